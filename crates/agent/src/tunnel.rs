//! Client half of the exporter's CONNECT gateway (§6): dials the
//! place's gateway port and asks for `tcp:<iface>@<place_id>` or
//! `usb:<iface>@<place_id>`, presenting the reservation token as a
//! bearer. Mirrors the gateway's own request/status-line framing.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const MAX_STATUS_LINE: usize = 4096;

pub async fn open(
    host: &str,
    port: u16,
    kind: &str,
    iface: &str,
    place_id: boardshare_model::PlaceId,
    token: &str,
) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect((host, port)).await?;
    let request = connect_request(kind, iface, place_id, token);
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if buf.len() > MAX_STATUS_LINE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "status line too long"));
        }
        stream.read_exact(&mut byte).await?;
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let status_line = text.lines().next().unwrap_or("");
    if status_code(status_line) != Some(200) {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("gateway refused tunnel: {status_line}"),
        ));
    }
    Ok(stream)
}

/// Pulls the numeric status out of an HTTP/1.1 response's first line.
fn status_code(status_line: &str) -> Option<u16> {
    status_line.split_whitespace().nth(1)?.parse().ok()
}

/// Builds the request line and bearer header a CONNECT tunnel opens with.
fn connect_request(kind: &str, iface: &str, place_id: boardshare_model::PlaceId, token: &str) -> String {
    format!("CONNECT {kind}:{iface}@{place_id} HTTP/1.1\r\nAuthorization: Bearer {token}\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_parses_from_response_line() {
        assert_eq!(status_code("HTTP/1.1 200 Connection Established"), Some(200));
        assert_eq!(status_code("HTTP/1.1 401 Unauthorized"), Some(401));
        assert_eq!(status_code(""), None);
    }

    #[test]
    fn connect_request_carries_authority_and_bearer() {
        let req = connect_request("usb", "dut", 7, "tok123");
        assert!(req.starts_with("CONNECT usb:dut@7 HTTP/1.1\r\n"));
        assert!(req.contains("Authorization: Bearer tok123"));
        assert!(req.ends_with("\r\n\r\n"));
    }
}
