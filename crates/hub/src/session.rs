//! A control-channel session (§3 "Session"): role, authenticated
//! principal, and the places/reservations it owns. Lifetime equals the
//! underlying WebSocket's.

use std::collections::HashSet;
use std::net::IpAddr;

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Exporter,
    Importer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Exporter,
    Agent,
}

#[derive(Debug, Clone)]
pub struct Principal {
    pub name: String,
    pub roles: HashSet<Role>,
}

impl Principal {
    pub fn has(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub role: SessionRole,
    pub principal: Principal,
    pub remote_addr: IpAddr,
}
