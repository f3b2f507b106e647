//! The authorization policy consumed by the hub (§4.1): gates
//! `register_exporter` on the `exporter` role and `reserve`/
//! `return_reservation` on the `importer` role. The actual OIDC
//! authorization-code login flow is an external collaborator (§1) —
//! this module only defines the boundary it plugs into.

use crate::session::{Principal, Role};
use std::collections::HashSet;

/// Resolves the bearer credential presented at WebSocket upgrade time
/// into a [`Principal`] and its granted roles.
pub trait AuthPolicy: Send + Sync {
    fn authenticate(&self, bearer: Option<&str>) -> Principal;
}

/// "If the hub is configured without an auth policy, all peers are
/// granted both roles." (§4.1)
pub struct NoopAuthPolicy;

impl AuthPolicy for NoopAuthPolicy {
    fn authenticate(&self, _bearer: Option<&str>) -> Principal {
        Principal {
            name: "anonymous".to_string(),
            roles: [Role::Exporter, Role::Importer].into_iter().collect(),
        }
    }
}

/// A static table of bearer token -> granted roles, standing in for the
/// real deployment's OIDC-issued tokens. Unknown tokens get no roles,
/// so every gated RPC fails with `AuthError`.
pub struct StaticTokenAuthPolicy {
    grants: std::collections::HashMap<String, (String, HashSet<Role>)>,
}

impl StaticTokenAuthPolicy {
    pub fn new() -> Self {
        Self {
            grants: std::collections::HashMap::new(),
        }
    }

    pub fn grant(mut self, token: impl Into<String>, name: impl Into<String>, roles: &[Role]) -> Self {
        self.grants
            .insert(token.into(), (name.into(), roles.iter().copied().collect()));
        self
    }
}

impl Default for StaticTokenAuthPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthPolicy for StaticTokenAuthPolicy {
    fn authenticate(&self, bearer: Option<&str>) -> Principal {
        match bearer.and_then(|token| self.grants.get(token)) {
            Some((name, roles)) => Principal {
                name: name.clone(),
                roles: roles.clone(),
            },
            None => Principal {
                name: "unauthenticated".to_string(),
                roles: HashSet::new(),
            },
        }
    }
}

/// Loads a flat `token = name:role,role` table, one grant per line,
/// blank lines and `#` comments ignored. Stands in for the real
/// deployment's OIDC token issuer.
pub fn load_auth_table(path: &std::path::Path) -> std::io::Result<StaticTokenAuthPolicy> {
    let contents = std::fs::read_to_string(path)?;
    let mut policy = StaticTokenAuthPolicy::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((token, rest)) = line.split_once('=') else {
            continue;
        };
        let Some((name, roles)) = rest.trim().split_once(':') else {
            continue;
        };
        let roles: HashSet<Role> = roles
            .split(',')
            .filter_map(|r| match r.trim() {
                "exporter" => Some(Role::Exporter),
                "importer" => Some(Role::Importer),
                _ => None,
            })
            .collect();
        policy = policy.grant(token.trim().to_string(), name.trim().to_string(), &roles.into_iter().collect::<Vec<_>>());
    }
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_grants_both_roles() {
        let p = NoopAuthPolicy.authenticate(None);
        assert!(p.has(Role::Exporter));
        assert!(p.has(Role::Importer));
    }

    #[test]
    fn static_table_grants_only_configured_roles() {
        let policy = StaticTokenAuthPolicy::new().grant("tok-a", "alice", &[Role::Importer]);
        let p = policy.authenticate(Some("tok-a"));
        assert!(p.has(Role::Importer));
        assert!(!p.has(Role::Exporter));
    }

    #[test]
    fn unknown_token_grants_nothing() {
        let policy = StaticTokenAuthPolicy::new();
        let p = policy.authenticate(Some("bogus"));
        assert!(!p.has(Role::Importer));
        assert!(!p.has(Role::Exporter));
    }
}
