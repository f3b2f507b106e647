//! The typed error taxonomy of §7: malformed frames are fatal to the
//! channel, `AuthError`/`NoMatch`/etc. are surfaced to the caller as
//! ordinary JSON-RPC errors. Internal error types never cross the wire —
//! only [`RpcError`] does.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed frame or unexpected opcode — fatal to the channel.
    Protocol,
    /// Rejected by the configured `AuthPolicy`.
    Auth,
    /// A `reserve` call had an empty candidate set.
    NoMatch,
    /// An `Allocated` reservation's exporter deregistered or crashed.
    AllocationLost,
    /// A local resource (VHCI port, TCP bind) was already in use.
    ResourceBusy,
    /// I/O or a device not yet present; retried internally before this
    /// ever reaches the wire.
    Transient,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Protocol => "protocol_error",
            ErrorKind::Auth => "auth_error",
            ErrorKind::NoMatch => "no_match",
            ErrorKind::AllocationLost => "allocation_lost",
            ErrorKind::ResourceBusy => "resource_busy",
            ErrorKind::Transient => "transient",
        };
        f.write_str(s)
    }
}

/// The wire shape of a JSON-RPC error: a short human message plus a kind
/// tag, per §7's closing paragraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Errors internal to one component's use of the protocol crate —
/// never serialized, always unwound to a session/tunnel/reservation task
/// boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("channel closed")]
    Closed,
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Internal(String),
}
