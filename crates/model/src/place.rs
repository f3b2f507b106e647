//! Runtime representation of a registered place and its parts.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type PlaceId = u64;

/// A TCP endpoint exposed by a part, reachable through the owning
/// exporter's gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpEndpoint {
    pub host: String,
    pub port: u16,
}

/// A member of a [`Place`]. `usb` maps an interface name to a USB bus ID
/// of the form `<bus>-<path>` (e.g. `"1-2.3"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub compatible: BTreeSet<String>,
    #[serde(default)]
    pub tcp: BTreeMap<String, TcpEndpoint>,
    #[serde(default)]
    pub usb: BTreeMap<String, String>,
}

/// A named bundle published by one exporter. `host` is discovered from
/// the control channel's peer address at registration time, not declared
/// by the exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Place {
    pub id: PlaceId,
    pub host: String,
    pub port: u16,
    pub parts: Vec<Part>,
}

impl Place {
    pub fn part(&self, idx: usize) -> Option<&Part> {
        self.parts.get(idx)
    }
}
