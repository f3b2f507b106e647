//! Per-allocation opaque tokens (§4.1: "a fresh token accompanies each
//! `place_available`/`place_reserved` pair"). The exporter's gateway
//! checks this token verbatim against what the agent presents in its
//! `CONNECT` authority, so it only needs to be unguessable, not signed.

use rand::Rng;

const TOKEN_LEN: usize = 24;
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_distinct_tokens_of_fixed_length() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), TOKEN_LEN);
        assert_ne!(a, b);
    }
}
