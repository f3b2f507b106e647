//! The duplex control protocol shared by the hub, exporter and agent
//! (§4.2): a JSON-RPC 2.0 envelope carried as length-delimited frames
//! over a Unix domain socket, or as one JSON object per WebSocket text
//! frame; a tagged-by-method schema per direction; idle/dead keep-alive
//! timers and reconnect backoff; and the §7 error taxonomy.

pub mod error;
pub mod framing;
pub mod ipc;
pub mod keepalive;
pub mod methods;
pub mod rpc;

pub use error::{Error, ErrorKind, RpcError};
pub use keepalive::{Backoff, KeepAlive, T_DEAD, T_IDLE};
pub use methods::{HubNotification, HubRequest, HubResponse};
pub use rpc::{
    decode_method, encode_notification, encode_request, Frame, IdAllocator, RawResponse,
    RequestId,
};
