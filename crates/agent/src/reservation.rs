//! The agent's in-memory reservation table, owned by a single task (§5:
//! "A's reservation table is owned by a single task; commands from the
//! Unix socket are marshalled to that task"). Requests that can't be
//! satisfied immediately — `attach` before the place is allocated —
//! register a waiter instead of blocking the actor loop, so a later
//! `place_available` event can still reach it.

use std::collections::HashMap;
use std::sync::Arc;

use boardshare_model::{ImportSpec, Part, PlaceId, ReservationId, ReturnReason};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::autoreturn::AutoReturn;
use crate::hub_client::HubClient;
use crate::{tcp_forward, usb_attach};

type HubCell = tokio::sync::Mutex<Option<Arc<HubClient>>>;

#[derive(Debug, Clone)]
pub enum AgentError {
    NotFound,
    WrongState(&'static str),
    Hub(String),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::NotFound => write!(f, "no such reservation"),
            AgentError::WrongState(s) => write!(f, "reservation is {s}"),
            AgentError::Hub(msg) => write!(f, "{msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalState {
    Pending,
    Allocated,
    Attached,
    Returned,
}

#[derive(Debug, Clone)]
pub struct ReservationSummary {
    pub name: String,
    pub state: LocalState,
    pub place_id: Option<PlaceId>,
    pub return_reason: Option<ReturnReason>,
}

struct AllocatedPlace {
    place_id: PlaceId,
    host: String,
    port: u16,
    parts: Vec<Part>,
    token: String,
}

struct ReservationEntry {
    spec: ImportSpec,
    reservation_id: Option<ReservationId>,
    local_state: LocalState,
    allocated: Option<AllocatedPlace>,
    return_reason: Option<ReturnReason>,
    pending_attach: Option<oneshot::Sender<Result<(), AgentError>>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    autoreturn: Option<AutoReturn>,
}

impl ReservationEntry {
    fn teardown_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.autoreturn = None;
    }
}

pub enum Command {
    Reserve {
        spec: ImportSpec,
        reply: oneshot::Sender<Result<String, AgentError>>,
    },
    Attach {
        name: String,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    Detach {
        name: String,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    Return {
        name: String,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    Edit {
        name: String,
        spec: ImportSpec,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    List {
        reply: oneshot::Sender<Vec<ReservationSummary>>,
    },
    Status {
        reply: oneshot::Sender<(Vec<ReservationSummary>, bool)>,
    },
    PlaceAvailable {
        reservation_id: ReservationId,
        place_id: PlaceId,
        host: String,
        port: u16,
        parts: Vec<Part>,
        token: String,
    },
    ReservationLost {
        reservation_id: ReservationId,
        reason: ReturnReason,
    },
    HubConnected {
        connected: bool,
    },
}

#[derive(Clone)]
pub struct ReservationHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ReservationHandle {
    pub fn sender(&self) -> mpsc::UnboundedSender<Command> {
        self.tx.clone()
    }

    pub async fn reserve(&self, spec: ImportSpec) -> Result<String, AgentError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Reserve { spec, reply });
        rx.await.map_err(|_| AgentError::Hub("actor stopped".into()))?
    }

    pub async fn attach(&self, name: String) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Attach { name, reply });
        rx.await.map_err(|_| AgentError::Hub("actor stopped".into()))?
    }

    pub async fn detach(&self, name: String) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Detach { name, reply });
        rx.await.map_err(|_| AgentError::Hub("actor stopped".into()))?
    }

    pub async fn return_reservation(&self, name: String) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Return { name, reply });
        rx.await.map_err(|_| AgentError::Hub("actor stopped".into()))?
    }

    pub async fn edit(&self, name: String, spec: ImportSpec) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Edit { name, spec, reply });
        rx.await.map_err(|_| AgentError::Hub("actor stopped".into()))?
    }

    pub async fn list(&self) -> Vec<ReservationSummary> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::List { reply });
        rx.await.unwrap_or_default()
    }

    pub async fn status(&self) -> (Vec<ReservationSummary>, bool) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::Status { reply });
        rx.await.unwrap_or_default()
    }
}

/// Spawns the actor task and returns a cloneable handle to it. `hub` is
/// the same cell `hub_client::run` fills in once connected.
pub fn spawn(hub: Arc<HubCell>) -> ReservationHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(rx, hub, tx.clone()));
    ReservationHandle { tx }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>, hub: Arc<HubCell>, self_tx: mpsc::UnboundedSender<Command>) {
    let mut reservations: HashMap<String, ReservationEntry> = HashMap::new();
    let mut by_reservation_id: HashMap<ReservationId, String> = HashMap::new();
    let mut next_local_id: u64 = 0;
    let mut hub_connected = false;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Reserve { spec, reply } => {
                let client = hub.lock().await.clone();
                let Some(client) = client else {
                    let _ = reply.send(Err(AgentError::Hub("not connected to hub".into())));
                    continue;
                };
                match client
                    .call(boardshare_protocol::HubRequest::Reserve {
                        import_spec: spec.clone(),
                    })
                    .await
                {
                    Ok(boardshare_protocol::HubResponse::ReservationId { reservation_id }) => {
                        next_local_id += 1;
                        let name = format!("r{next_local_id}");
                        reservations.insert(
                            name.clone(),
                            ReservationEntry {
                                spec,
                                reservation_id: Some(reservation_id),
                                local_state: LocalState::Pending,
                                allocated: None,
                                return_reason: None,
                                pending_attach: None,
                                tasks: Vec::new(),
                                autoreturn: None,
                            },
                        );
                        by_reservation_id.insert(reservation_id, name.clone());
                        info!(reservation_id, %name, "reservation pending");
                        let _ = reply.send(Ok(name));
                    }
                    Ok(_) => {
                        let _ = reply.send(Err(AgentError::Hub("unexpected reply".into())));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(AgentError::Hub(err)));
                    }
                }
            }

            Command::Attach { name, reply } => {
                let Some(entry) = reservations.get_mut(&name) else {
                    let _ = reply.send(Err(AgentError::NotFound));
                    continue;
                };
                match entry.local_state {
                    LocalState::Returned => {
                        let _ = reply.send(Err(AgentError::WrongState("returned")));
                    }
                    LocalState::Pending => {
                        entry.pending_attach = Some(reply);
                    }
                    LocalState::Allocated | LocalState::Attached => {
                        materialize(&name, entry, self_tx.clone());
                        entry.local_state = LocalState::Attached;
                        let _ = reply.send(Ok(()));
                    }
                }
            }

            Command::Detach { name, reply } => {
                let Some(entry) = reservations.get_mut(&name) else {
                    let _ = reply.send(Err(AgentError::NotFound));
                    continue;
                };
                entry.teardown_tasks();
                if entry.local_state == LocalState::Attached {
                    entry.local_state = LocalState::Allocated;
                }
                let _ = reply.send(Ok(()));
            }

            Command::Return { name, reply } => {
                let Some(entry) = reservations.get_mut(&name) else {
                    let _ = reply.send(Err(AgentError::NotFound));
                    continue;
                };
                if entry.local_state == LocalState::Returned {
                    let _ = reply.send(Ok(()));
                    continue;
                }
                entry.teardown_tasks();
                if let Some(reservation_id) = entry.reservation_id {
                    if let Some(client) = hub.lock().await.clone() {
                        let _ = client
                            .call(boardshare_protocol::HubRequest::ReturnReservation {
                                reservation_id,
                            })
                            .await;
                    }
                }
                entry.local_state = LocalState::Returned;
                entry.return_reason = Some(ReturnReason::Requested);
                let _ = reply.send(Ok(()));
            }

            Command::Edit { name, spec, reply } => {
                let Some(entry) = reservations.get_mut(&name) else {
                    let _ = reply.send(Err(AgentError::NotFound));
                    continue;
                };
                if entry.local_state == LocalState::Returned {
                    let _ = reply.send(Err(AgentError::WrongState("returned")));
                    continue;
                }
                entry.spec = spec;
                if let Some(autoreturn) = entry.autoreturn.as_ref() {
                    autoreturn.reset(entry.spec.auto_return_time);
                }
                let _ = reply.send(Ok(()));
            }

            Command::List { reply } => {
                let _ = reply.send(summarize(&reservations));
            }

            Command::Status { reply } => {
                let _ = reply.send((summarize(&reservations), hub_connected));
            }

            Command::PlaceAvailable {
                reservation_id,
                place_id,
                host,
                port,
                parts,
                token,
            } => {
                let Some(name) = by_reservation_id.get(&reservation_id).cloned() else {
                    warn!(reservation_id, "place_available for unknown reservation");
                    continue;
                };
                let Some(entry) = reservations.get_mut(&name) else {
                    continue;
                };
                entry.allocated = Some(AllocatedPlace {
                    place_id,
                    host,
                    port,
                    parts,
                    token,
                });
                entry.local_state = LocalState::Allocated;
                info!(%name, place_id, "place allocated");
                if let Some(waiter) = entry.pending_attach.take() {
                    materialize(&name, entry, self_tx.clone());
                    entry.local_state = LocalState::Attached;
                    let _ = waiter.send(Ok(()));
                }
            }

            Command::ReservationLost {
                reservation_id,
                reason,
            } => {
                let Some(name) = by_reservation_id.get(&reservation_id).cloned() else {
                    continue;
                };
                let Some(entry) = reservations.get_mut(&name) else {
                    continue;
                };
                warn!(%name, ?reason, "reservation lost");
                entry.teardown_tasks();
                entry.local_state = LocalState::Returned;
                entry.return_reason = Some(reason);
                if let Some(waiter) = entry.pending_attach.take() {
                    let _ = waiter.send(Err(AgentError::WrongState("returned")));
                }
            }

            Command::HubConnected { connected } => {
                hub_connected = connected;
            }
        }
    }
}

/// Spawns the TCP listeners and USB tunnels an allocated reservation's
/// spec calls for. Idempotent per call site: `Attach` only reaches this
/// once per transition into `Attached`.
fn materialize(name: &str, entry: &mut ReservationEntry, self_tx: mpsc::UnboundedSender<Command>) {
    let Some(allocated) = entry.allocated.as_ref() else {
        return;
    };
    let place_id = allocated.place_id;
    let host = allocated.host.clone();
    let port = allocated.port;
    let token = allocated.token.clone();
    let parts = allocated.parts.clone();
    let assignment = entry.spec_assignment();

    for (part_name, idx) in assignment {
        let Some(part) = parts.get(idx) else {
            continue;
        };
        let Some(want) = entry.spec.parts.get(&part_name) else {
            continue;
        };
        for (iface, tcp_want) in &want.tcp {
            if part.tcp.contains_key(iface) {
                let handle = tcp_forward::spawn(
                    tcp_want.local_port,
                    iface.clone(),
                    place_id,
                    host.clone(),
                    port,
                    token.clone(),
                );
                entry.tasks.push(handle);
            }
        }
        for (iface, usb_want) in &want.usb {
            if let Some(busid) = part.usb.get(iface) {
                let handle = usb_attach::spawn(
                    busid.clone(),
                    usb_want.port_num,
                    place_id,
                    host.clone(),
                    port,
                    token.clone(),
                );
                entry.tasks.push(handle);
            }
        }
    }
    if entry.spec.auto_return_time > std::time::Duration::ZERO {
        entry.autoreturn = Some(AutoReturn::new(
            entry.spec.auto_return_time,
            name.to_string(),
            self_tx,
        ));
    }
    info!(%name, "interfaces materialized");
}

impl ReservationEntry {
    /// Recomputes the part assignment fresh against the allocated
    /// place's parts; the scheduler already validated this spec matches
    /// when it allocated, so this always succeeds.
    fn spec_assignment(&self) -> boardshare_model::Assignment {
        let Some(allocated) = self.allocated.as_ref() else {
            return Default::default();
        };
        let place = boardshare_model::Place {
            id: allocated.place_id,
            host: allocated.host.clone(),
            port: allocated.port,
            parts: allocated.parts.clone(),
        };
        boardshare_model::candidate_assignment(&self.spec, &place).unwrap_or_default()
    }
}

fn summarize(reservations: &HashMap<String, ReservationEntry>) -> Vec<ReservationSummary> {
    let mut names: Vec<&String> = reservations.keys().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| {
            let entry = &reservations[name];
            ReservationSummary {
                name: name.clone(),
                state: entry.local_state.clone(),
                place_id: entry.allocated.as_ref().map(|a| a.place_id),
                return_reason: entry.return_reason,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ReservationHandle {
        spawn(Arc::new(tokio::sync::Mutex::new(None)))
    }

    #[tokio::test]
    async fn attach_on_unknown_reservation_is_not_found() {
        let handle = handle();
        let err = handle.attach("missing".to_string()).await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound));
    }

    #[tokio::test]
    async fn detach_on_unknown_reservation_is_not_found() {
        let handle = handle();
        let err = handle.detach("missing".to_string()).await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound));
    }

    #[tokio::test]
    async fn list_on_fresh_actor_is_empty() {
        let handle = handle();
        assert!(handle.list().await.is_empty());
    }

    #[tokio::test]
    async fn status_reports_disconnected_before_any_hub_connection() {
        let handle = handle();
        let (reservations, connected) = handle.status().await;
        assert!(reservations.is_empty());
        assert!(!connected);
    }

    #[tokio::test]
    async fn reserve_without_hub_connection_fails() {
        let handle = handle();
        let spec = ImportSpec {
            auto_return_time: std::time::Duration::from_secs(0),
            parts: Default::default(),
        };
        let err = handle.reserve(spec).await.unwrap_err();
        assert!(matches!(err, AgentError::Hub(_)));
    }

    #[tokio::test]
    async fn hub_connected_flips_status_flag() {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, Arc::new(tokio::sync::Mutex::new(None)), tx.clone()));
        let handle = ReservationHandle { tx };
        let _ = handle.sender().send(Command::HubConnected { connected: true });
        // Give the actor a chance to process before asserting.
        tokio::task::yield_now().await;
        let (_, connected) = handle.status().await;
        assert!(connected);
    }
}
