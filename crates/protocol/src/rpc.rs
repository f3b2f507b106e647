//! The JSON-RPC 2.0 envelope, with the one extension §4.2 calls for:
//! responses and notifications may be issued by either side of a control
//! channel at any time. Request ids are integers, positive from the
//! peer that opened the channel, negative from the peer that accepted
//! it, so the two id spaces never collide.

use crate::error::{Error, RpcError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

pub type RequestId = i64;

/// Allocates request ids for one side of a control channel.
pub struct IdAllocator {
    next: AtomicI64,
    step: i64,
}

impl IdAllocator {
    /// For the peer that opened the channel: ids `1, 2, 3, ...`.
    pub fn initiator() -> Self {
        Self {
            next: AtomicI64::new(1),
            step: 1,
        }
    }

    /// For the peer that accepted the channel: ids `-1, -2, -3, ...`.
    pub fn acceptor() -> Self {
        Self {
            next: AtomicI64::new(-1),
            step: -1,
        }
    }

    pub fn next(&self) -> RequestId {
        self.next.fetch_add(self.step, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawOutcome {
    Result { result: Value },
    Error { error: RpcError },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(flatten)]
    outcome: RawOutcome,
}

impl RawResponse {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            outcome: RawOutcome::Result { result },
        }
    }

    pub fn err(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            outcome: RawOutcome::Error { error },
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.outcome {
            RawOutcome::Result { result } => Ok(result),
            RawOutcome::Error { error } => Err(error),
        }
    }
}

/// A deserialized control-channel frame, classified by shape: a frame
/// carrying both `id` and `method` is a request, `method` alone is a
/// notification, neither is a response (responses carry `id` and either
/// `result` or `error`).
#[derive(Debug, Clone)]
pub enum Frame {
    Request(RawRequest),
    Notification(RawNotification),
    Response(RawResponse),
}

impl Frame {
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, Error> {
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some();
        if has_method && has_id {
            Ok(Frame::Request(serde_json::from_value(value)?))
        } else if has_method {
            Ok(Frame::Notification(serde_json::from_value(value)?))
        } else {
            Ok(Frame::Response(serde_json::from_value(value)?))
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let v = match self {
            Frame::Request(r) => serde_json::to_vec(r)?,
            Frame::Notification(n) => serde_json::to_vec(n)?,
            Frame::Response(r) => serde_json::to_vec(r)?,
        };
        Ok(v)
    }
}

/// Builds a `RawRequest` for a typed, tagged-by-method payload (the
/// `#[serde(tag = "method", content = "params")]` convention used by
/// [`crate::hub_methods`] and [`crate::agent_methods`]).
pub fn encode_request<T: Serialize>(id: RequestId, call: &T) -> Result<RawRequest, Error> {
    let encoded = serde_json::to_value(call)?;
    let method = encoded
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Internal("tagged call missing method field".into()))?
        .to_string();
    let params = encoded.get("params").cloned().unwrap_or(Value::Null);
    Ok(RawRequest {
        jsonrpc: "2.0".into(),
        id,
        method,
        params,
    })
}

pub fn encode_notification<T: Serialize>(call: &T) -> Result<RawNotification, Error> {
    let encoded = serde_json::to_value(call)?;
    let method = encoded
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Internal("tagged call missing method field".into()))?
        .to_string();
    let params = encoded.get("params").cloned().unwrap_or(Value::Null);
    Ok(RawNotification {
        jsonrpc: "2.0".into(),
        method,
        params,
    })
}

/// Decodes a `method` + `params` pair back into a tagged enum.
pub fn decode_method<T: DeserializeOwned>(method: &str, params: &Value) -> Result<T, Error> {
    let reconstructed = serde_json::json!({ "method": method, "params": params });
    Ok(serde_json::from_value(reconstructed)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_allocators_never_collide() {
        let a = IdAllocator::initiator();
        let b = IdAllocator::acceptor();
        for _ in 0..5 {
            assert!(a.next() > 0);
            assert!(b.next() < 0);
        }
    }

    #[test]
    fn classifies_request_notification_response() {
        let req = serde_json::json!({"jsonrpc":"2.0","id":1,"method":"reserve","params":{}});
        assert!(matches!(Frame::from_value(req).unwrap(), Frame::Request(_)));

        let notif = serde_json::json!({"jsonrpc":"2.0","method":"place_returned","params":{}});
        assert!(matches!(
            Frame::from_value(notif).unwrap(),
            Frame::Notification(_)
        ));

        let resp = serde_json::json!({"jsonrpc":"2.0","id":1,"result":42});
        assert!(matches!(Frame::from_value(resp).unwrap(), Frame::Response(_)));
    }
}
