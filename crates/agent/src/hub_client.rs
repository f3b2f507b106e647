//! Duplex control channel to the hub (§4.2, §4.5): issues `reserve` and
//! `return_reservation` calls on behalf of the reservation actor, and
//! turns `place_available`/`reservation_lost` notifications into
//! [`crate::reservation::Command`]s against it. Reconnects with backoff,
//! mirroring the exporter's own control channel.

use std::collections::HashMap;
use std::sync::Arc;

use boardshare_protocol::{
    decode_method, encode_request, Frame, HubNotification, IdAllocator, KeepAlive, RawResponse,
    RequestId, T_IDLE,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::reservation::Command;

type PendingTable = Mutex<HashMap<RequestId, oneshot::Sender<RawResponse>>>;

/// A handle to the running connection, used by the reservation actor to
/// issue `reserve`/`return_reservation` calls.
pub struct HubClient {
    outbound: mpsc::UnboundedSender<Message>,
    ids: IdAllocator,
    pending: Arc<PendingTable>,
}

impl HubClient {
    pub async fn call(&self, call: boardshare_protocol::HubRequest) -> Result<boardshare_protocol::HubResponse, String> {
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

type HubCell = Mutex<Option<Arc<HubClient>>>;

/// Runs the control channel forever: connect, dispatch notifications
/// into the reservation actor, reconnect with backoff on disconnect.
pub async fn run(
    hub_url: String,
    token: Option<String>,
    hub_cell: Arc<HubCell>,
    actor: mpsc::UnboundedSender<Command>,
) {
    let mut backoff = boardshare_protocol::Backoff::new();
    loop {
        let url = match &token {
            Some(t) => format!("{hub_url}?role=agent&token={t}"),
            None => format!("{hub_url}?role=agent"),
        };
        info!(%url, "connecting to hub");

        match connect_async(&url).await {
            Ok((stream, _)) => {
                backoff.reset();
                info!("control channel established");
                let _ = actor.send(Command::HubConnected { connected: true });
                run_connected(stream, &hub_cell, &actor).await;
                let _ = actor.send(Command::HubConnected { connected: false });
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
    hub_cell: &Arc<HubCell>,
    actor: &mpsc::UnboundedSender<Command>,
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
    *hub_cell.lock().await = Some(client);

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
                        handle_frame(&text, &pending, actor).await;
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
    *hub_cell.lock().await = None;
}

async fn handle_frame(text: &str, pending: &Arc<PendingTable>, actor: &mpsc::UnboundedSender<Command>) {
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
            apply_notification(notification, actor);
        }
        Frame::Request(_) => {} // the hub never calls the agent back as a request
    }
}

fn apply_notification(notification: HubNotification, actor: &mpsc::UnboundedSender<Command>) {
    match notification {
        HubNotification::PlaceAvailable {
            reservation_id,
            place_id,
            host,
            port,
            parts,
            token,
        } => {
            info!(reservation_id, place_id, "place available");
            let _ = actor.send(Command::PlaceAvailable {
                reservation_id,
                place_id,
                host,
                port,
                parts,
                token,
            });
        }
        HubNotification::ReservationLost {
            reservation_id,
            reason,
        } => {
            let _ = actor.send(Command::ReservationLost {
                reservation_id,
                reason,
            });
        }
        HubNotification::PlaceReserved { .. } | HubNotification::PlaceReturned { .. } => {
            // exporter-only notifications; the agent's control channel never receives these
        }
    }
}
