//! Duplex control channel to the hub (§4.2, §4.3): registers the place
//! once per connection, keeps a pending-request table so responses can
//! be matched back to callers, and turns hub notifications into updates
//! against [`crate::state::ExporterState`]. Reconnects with backoff,
//! grounded on the corpus's own agent reconnect loop.

use std::collections::HashMap;
use std::sync::Arc;

use boardshare_protocol::{
    decode_method, encode_request, Frame, HubNotification, HubRequest, HubResponse, IdAllocator,
    KeepAlive, RawResponse, RequestId, T_IDLE,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::state::ExporterState;

type PendingTable = Mutex<HashMap<RequestId, oneshot::Sender<RawResponse>>>;

/// A handle to the running connection, used to issue requests from the
/// gateway/relay tasks without reaching into the socket directly.
pub struct HubClient {
    outbound: mpsc::UnboundedSender<Message>,
    ids: IdAllocator,
    pending: Arc<PendingTable>,
}

impl HubClient {
    pub async fn call(&self, call: HubRequest) -> Result<HubResponse, String> {
        let id = self.ids.next();
        let raw = encode_request(id, &call).map_err(|e| e.to_string())?;
        let bytes = Frame::Request(raw).encode().map_err(|e| e.to_string())?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        self.outbound
            .send(Message::Text(String::from_utf8_lossy(&bytes).into_owned().into()))
            .map_err(|_| "control channel closed".to_string())?;

        let resp = rx.await.map_err(|_| "control channel closed".to_string())?;
        let value = resp.into_result().map_err(|e| e.to_string())?;
        serde_json::from_value(value).map_err(|e| e.to_string())
    }
}

/// Runs the control channel forever: connect, register, dispatch
/// notifications, reconnect with backoff on any disconnect.
pub async fn run(hub_url: String, token: Option<String>, state: Arc<ExporterState>) {
    let mut backoff = boardshare_protocol::Backoff::new();
    loop {
        let url = match &token {
            Some(t) => format!("{hub_url}?role=exporter&token={t}"),
            None => format!("{hub_url}?role=exporter"),
        };
        info!(%url, "connecting to hub");

        match connect_async(&url).await {
            Ok((stream, _)) => {
                backoff.reset();
                info!("control channel established");
                run_connected(stream, &state).await;
                warn!("control channel closed, reconnecting");
            }
            Err(err) => {
                error!(%err, "failed to connect to hub");
            }
        }

        tokio::time::sleep(backoff.next_delay()).await;
    }
}

async fn run_connected(
    stream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    state: &Arc<ExporterState>,
) {
    let (mut sink, mut stream) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let pending: Arc<PendingTable> = Arc::new(Mutex::new(HashMap::new()));

    let outbound = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let client = Arc::new(HubClient {
        outbound: tx.clone(),
        ids: IdAllocator::initiator(),
        pending: pending.clone(),
    });

    match client
        .call(HubRequest::RegisterExporter {
            port: state.gateway_port,
            parts: state.parts.clone(),
        })
        .await
    {
        Ok(HubResponse::PlaceId { place_id }) => {
            info!(place_id, "registered place with hub");
            *state.place_id.lock().await = Some(place_id);
        }
        other => {
            error!(?other, "registration failed");
            outbound.abort();
            return;
        }
    }
    *state.hub_client.lock().await = Some(client.clone());

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
                        handle_frame(&text, &pending, state).await;
                    }
                    Message::Pong(_) => keepalive.note_received(),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = ping_ticker.tick() => {
                if keepalive.is_dead() {
                    warn!("hub control channel timed out");
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
    *state.hub_client.lock().await = None;
    state.active_tokens.clear();
}

async fn handle_frame(text: &str, pending: &Arc<PendingTable>, state: &Arc<ExporterState>) {
    let Ok(frame) = Frame::decode(text.as_bytes()) else {
        return;
    };
    match frame {
        Frame::Response(resp) => {
            if let Some(tx) = pending.lock().await.remove(&resp.id) {
                let _ = tx.send(resp);
            }
        }
        Frame::Notification(raw) => {
            let Ok(notification): Result<HubNotification, _> =
                decode_method(&raw.method, &raw.params)
            else {
                return;
            };
            apply_notification(notification, state).await;
        }
        Frame::Request(_) => {} // the hub never calls the exporter back as a request
    }
}

async fn apply_notification(notification: HubNotification, state: &Arc<ExporterState>) {
    match notification {
        HubNotification::PlaceReserved {
            place_id,
            peer_ip,
            token,
        } => {
            info!(place_id, %peer_ip, "place reserved");
            state.active_tokens.insert(
                place_id,
                crate::state::ActiveToken { token, peer_ip },
            );
        }
        HubNotification::PlaceReturned { place_id } => {
            info!(place_id, "place returned");
            state.active_tokens.remove(&place_id);
        }
        HubNotification::PlaceAvailable { .. } | HubNotification::ReservationLost { .. } => {
            // agent-only notifications; the exporter's control channel never receives these
        }
    }
}
