//! Per-connection WebSocket lifecycle for the control channel (§4.2):
//! upgrade, authenticate, dispatch requests against [`HubContext`], push
//! notifications produced as a side effect of someone else's request,
//! and run the idle/dead timers that close a silent channel.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use boardshare_protocol::{
    decode_method, encode_notification, ErrorKind, Frame, HubNotification, HubRequest,
    HubResponse, KeepAlive, RawResponse, RpcError, T_IDLE,
};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::auth::AuthPolicy;
use crate::scheduler::Effect;
use crate::session::SessionId;
use crate::session::SessionRole;
use crate::state::HubContext;

/// Per-session outbound queues, keyed by session id, so a request
/// handled on one connection's task can push a notification onto
/// another connection's socket.
pub type Outboxes = Arc<DashMap<SessionId, mpsc::UnboundedSender<Message>>>;

pub fn new_outboxes() -> Outboxes {
    Arc::new(DashMap::new())
}

pub async fn handle_socket(
    socket: WebSocket,
    hub: Arc<HubContext>,
    auth: Arc<dyn AuthPolicy>,
    outboxes: Outboxes,
    role: SessionRole,
    bearer: Option<String>,
    remote_addr: SocketAddr,
) {
    let principal = auth.authenticate(bearer.as_deref());
    let session = hub.open_session(role, principal, remote_addr.ip()).await;
    info!(session, ?role, %remote_addr, "control channel opened");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    outboxes.insert(session, tx.clone());

    let outbound = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut keepalive = KeepAlive::new();
    let mut ping_ticker = interval(T_IDLE / 4);
    ping_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = stream.next() => {
                let Some(Ok(frame)) = frame else { break };
                match frame {
                    Message::Text(text) => {
                        keepalive.note_received();
                        handle_request(&text, session, &hub, &tx, &outboxes).await;
                    }
                    Message::Pong(_) => keepalive.note_received(),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = ping_ticker.tick() => {
                if keepalive.is_dead() {
                    warn!(session, "control channel timed out, no frame for T_DEAD");
                    break;
                }
                if keepalive.should_ping() && tx.send(Message::Ping(Vec::new().into())).is_err() {
                    break;
                }
                keepalive.note_sent();
            }
        }
    }

    outbound.abort();
    outboxes.remove(&session);
    let effects = hub.close_session(session).await;
    dispatch_effects(effects, &outboxes);
    info!(session, "control channel closed");
}

async fn handle_request(
    text: &str,
    session: SessionId,
    hub: &Arc<HubContext>,
    tx: &mpsc::UnboundedSender<Message>,
    outboxes: &Outboxes,
) {
    let frame = match Frame::decode(text.as_bytes()) {
        Ok(frame) => frame,
        Err(_) => return, // malformed frame: drop it, the peer will time out on no response
    };
    let Frame::Request(req) = frame else {
        return; // the hub never expects a response or notification from a peer
    };

    let call: HubRequest = match decode_method(&req.method, &req.params) {
        Ok(call) => call,
        Err(_) => {
            send_response(
                tx,
                RawResponse::err(req.id, RpcError::new(ErrorKind::Protocol, "unknown method")),
            );
            return;
        }
    };

    let (outcome, effects) = dispatch(session, hub, call).await;
    match outcome {
        Ok(value) => send_response(tx, RawResponse::ok(req.id, value)),
        Err(err) => send_response(tx, RawResponse::err(req.id, err)),
    }
    dispatch_effects(effects, outboxes);
}

async fn dispatch(
    session: SessionId,
    hub: &Arc<HubContext>,
    call: HubRequest,
) -> (Result<serde_json::Value, RpcError>, Vec<Effect>) {
    match call {
        HubRequest::RegisterExporter { port, parts } => {
            match hub.register_exporter(session, port, parts).await {
                Ok((place_id, effects)) => (
                    Ok(serde_json::to_value(HubResponse::PlaceId { place_id }).unwrap()),
                    effects,
                ),
                Err(_) => (
                    Err(RpcError::new(ErrorKind::Auth, "exporter role required")),
                    Vec::new(),
                ),
            }
        }
        HubRequest::Reserve { import_spec } => match hub.reserve(session, import_spec).await {
            Ok((reservation_id, effects)) => (
                Ok(serde_json::to_value(HubResponse::ReservationId { reservation_id }).unwrap()),
                effects,
            ),
            Err(crate::state::ReserveError::NotAuthorized) => (
                Err(RpcError::new(ErrorKind::Auth, "importer role required")),
                Vec::new(),
            ),
            Err(crate::state::ReserveError::NoMatch) => (
                Err(RpcError::new(ErrorKind::NoMatch, "no registered place matches this import spec")),
                Vec::new(),
            ),
        },
        HubRequest::ReturnReservation { reservation_id } => {
            match hub.return_reservation(session, reservation_id).await {
                Ok(effects) => (
                    Ok(serde_json::to_value(HubResponse::Unit {}).unwrap()),
                    effects,
                ),
                Err(_) => (
                    Err(RpcError::new(ErrorKind::Auth, "reservation not owned by this session")),
                    Vec::new(),
                ),
            }
        }
    }
}

fn dispatch_effects(effects: Vec<Effect>, outboxes: &Outboxes) {
    for effect in effects {
        let (target, notification) = match effect {
            Effect::PlaceAvailable {
                agent_session,
                reservation_id,
                place_id,
                host,
                port,
                parts,
                token,
            } => (
                agent_session,
                HubNotification::PlaceAvailable {
                    reservation_id,
                    place_id,
                    host,
                    port,
                    parts,
                    token,
                },
            ),
            Effect::PlaceReserved {
                exporter_session,
                place_id,
                peer_ip,
                token,
            } => (
                exporter_session,
                HubNotification::PlaceReserved {
                    place_id,
                    peer_ip,
                    token,
                },
            ),
            Effect::PlaceReturned {
                exporter_session,
                place_id,
            } => (exporter_session, HubNotification::PlaceReturned { place_id }),
            Effect::ReservationLost {
                agent_session,
                reservation_id,
                reason,
            } => (
                agent_session,
                HubNotification::ReservationLost {
                    reservation_id,
                    reason,
                },
            ),
        };

        let Some(outbox) = outboxes.get(&target) else {
            continue; // the session already closed; nothing to deliver
        };
        let Ok(raw) = encode_notification(&notification) else {
            continue;
        };
        let Ok(bytes) = Frame::Notification(raw).encode() else {
            continue;
        };
        let _ = outbox.send(Message::Text(String::from_utf8_lossy(&bytes).into_owned().into()));
    }
}

fn send_response(tx: &mpsc::UnboundedSender<Message>, resp: RawResponse) {
    if let Ok(bytes) = Frame::Response(resp).encode() {
        let _ = tx.send(Message::Text(String::from_utf8_lossy(&bytes).into_owned().into()));
    }
}
