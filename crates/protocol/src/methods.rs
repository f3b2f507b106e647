//! Tagged-by-method payloads for the hub's public surface (§4.1). Each
//! variant serializes to `{"method": "...", "params": {...}}`, which
//! [`crate::rpc::encode_request`]/[`crate::rpc::decode_method`] plug
//! straight into the JSON-RPC envelope — one typed dispatcher per enum,
//! no duck-typed method-name matching.

use boardshare_model::{ImportSpec, Part, PlaceId, ReservationId, ReturnReason};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Calls an exporter or agent may place against the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum HubRequest {
    RegisterExporter { port: u16, parts: Vec<Part> },
    Reserve { import_spec: ImportSpec },
    ReturnReservation { reservation_id: ReservationId },
}

/// Results the hub sends back for each [`HubRequest`] variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HubResponse {
    PlaceId { place_id: PlaceId },
    ReservationId { reservation_id: ReservationId },
    Unit {},
}

/// A view of a part handed to an agent once its reservation is
/// allocated — the same shape as [`Part`], kept as a distinct type so
/// the wire contract doesn't silently change if the internal model
/// grows hub-only fields.
pub type PartView = Part;

/// Notifications the hub pushes to exporters and agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum HubNotification {
    /// To the agent whose reservation became `Allocated`.
    PlaceAvailable {
        reservation_id: ReservationId,
        place_id: PlaceId,
        host: String,
        port: u16,
        parts: Vec<PartView>,
        token: String,
    },
    /// To the owning exporter, once a reservation against one of its
    /// places is allocated.
    PlaceReserved {
        place_id: PlaceId,
        peer_ip: IpAddr,
        token: String,
    },
    /// To the owning exporter, when the reservation against its place
    /// ends.
    PlaceReturned { place_id: PlaceId },
    /// To the agent, on a forced return (§7 `AllocationLost`, or a
    /// candidate set emptying under it).
    ReservationLost {
        reservation_id: ReservationId,
        reason: ReturnReason,
    },
}
