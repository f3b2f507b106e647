//! The agent's local command surface (§4.5, §6): commands a CLI client
//! sends over the Unix domain socket, and the agent's replies.

use boardshare_model::ImportSpec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum IpcRequest {
    Reserve { spec: ImportSpec },
    Attach { name: String },
    Detach { name: String },
    Return { name: String },
    List,
    Status,
    Edit { name: String, spec: ImportSpec },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    Success = 0,
    GenericFailure = 1,
    Usage = 2,
    NoMatch = 3,
    AuthFailure = 4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationSummary {
    pub name: String,
    pub state: String,
    pub place_id: Option<u64>,
    pub return_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IpcResponse {
    Reserved { name: String },
    Ok,
    List { reservations: Vec<ReservationSummary> },
    Status { reservations: Vec<ReservationSummary>, connected: bool },
    Error { code: ExitCode, message: String },
}
