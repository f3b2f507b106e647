//! Shared exporter state: the place's own parts, the active-tokens cache
//! a gateway accept checks on every CONNECT (§5), and the USB/IP host
//! bridge backing `usb:` tunnels.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use boardshare_model::{Part, PlaceId};
use boardshare_usbip::{SysfsUsbBridge, UrbTable, UrbTransferBackend, UsbHost};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::hub_client::HubClient;

/// The hub-issued capability granted to whichever agent holds the
/// current reservation against this exporter's place.
#[derive(Debug, Clone)]
pub struct ActiveToken {
    pub token: String,
    pub peer_ip: IpAddr,
}

pub struct ExporterState {
    pub gateway_port: u16,
    pub parts: Vec<Part>,
    pub place_id: Mutex<Option<PlaceId>>,
    pub active_tokens: DashMap<PlaceId, ActiveToken>,
    pub hub_client: Mutex<Option<Arc<HubClient>>>,
    pub usb_host: Arc<UsbHost<SysfsUsbBridge>>,
    pub urb_table: Arc<UrbTable>,
    pub transfer_backend: Arc<dyn UrbTransferBackend>,
    pub managed_busids: HashSet<String>,
}

impl ExporterState {
    pub fn new(
        gateway_port: u16,
        parts: Vec<Part>,
        transfer_backend: Arc<dyn UrbTransferBackend>,
    ) -> Arc<Self> {
        let managed_busids = parts
            .iter()
            .flat_map(|p| p.usb.values())
            .cloned()
            .collect();
        Arc::new(Self {
            gateway_port,
            parts,
            place_id: Mutex::new(None),
            active_tokens: DashMap::new(),
            hub_client: Mutex::new(None),
            usb_host: Arc::new(UsbHost::new(SysfsUsbBridge::new())),
            urb_table: UrbTable::new(),
            transfer_backend,
            managed_busids,
        })
    }

    /// Looks up the part advertising `name` (a `tcp.<name>` or
    /// `usb.<name>` interface) among this exporter's parts.
    pub fn find_part(&self, name: &str) -> Option<&Part> {
        self.parts
            .iter()
            .find(|p| p.tcp.contains_key(name) || p.usb.contains_key(name))
    }

    /// Checks a bearer token and source address against the current
    /// reservation for `place_id` (§6: missing/invalid auth is `401`,
    /// a right token from the wrong source is `403`).
    pub fn authorize(&self, place_id: PlaceId, token: &str, peer: IpAddr) -> AuthOutcome {
        match self.active_tokens.get(&place_id) {
            Some(entry) if entry.token != token => AuthOutcome::BadToken,
            Some(entry) if entry.peer_ip != peer => AuthOutcome::WrongIp,
            Some(_) => AuthOutcome::Ok,
            None => AuthOutcome::BadToken,
        }
    }
}

/// The result of checking a `CONNECT` request's bearer token and source
/// address against the place's current reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Ok,
    BadToken,
    WrongIp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardshare_usbip::LoopbackBackend;
    use std::collections::BTreeSet;

    fn sample_part() -> Part {
        Part {
            compatible: BTreeSet::from(["x".to_string()]),
            tcp: Default::default(),
            usb: [("dut".to_string(), "1-2".to_string())].into_iter().collect(),
        }
    }

    #[test]
    fn managed_busids_collected_from_parts() {
        let state = ExporterState::new(2192, vec![sample_part()], Arc::new(LoopbackBackend));
        assert!(state.managed_busids.contains("1-2"));
    }

    #[test]
    fn authorize_requires_matching_token_and_peer() {
        let state = ExporterState::new(2192, vec![], Arc::new(LoopbackBackend));
        let peer: IpAddr = "10.0.0.5".parse().unwrap();
        state.active_tokens.insert(
            1,
            ActiveToken {
                token: "secret".to_string(),
                peer_ip: peer,
            },
        );
        assert_eq!(state.authorize(1, "secret", peer), AuthOutcome::Ok);
        assert_eq!(state.authorize(2, "secret", peer), AuthOutcome::BadToken);
    }

    #[test]
    fn authorize_distinguishes_bad_token_from_wrong_ip() {
        let state = ExporterState::new(2192, vec![], Arc::new(LoopbackBackend));
        let peer: IpAddr = "10.0.0.5".parse().unwrap();
        state.active_tokens.insert(
            1,
            ActiveToken {
                token: "secret".to_string(),
                peer_ip: peer,
            },
        );
        assert_eq!(state.authorize(1, "wrong", peer), AuthOutcome::BadToken);
        assert_eq!(
            state.authorize(1, "secret", "10.0.0.6".parse().unwrap()),
            AuthOutcome::WrongIp
        );
    }
}
