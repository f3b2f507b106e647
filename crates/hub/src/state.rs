//! The async-facing wrapper around [`scheduler::HubState`] (§5: "the
//! hub's matching and allocation logic runs inside a single critical
//! section; no two matching passes ever run concurrently"). Every public
//! method here takes the lock once, mutates, runs a scheduler pass, and
//! returns the [`Effect`]s the caller dispatches to sessions after the
//! lock is dropped.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use boardshare_model::{ImportSpec, Part, Place, PlaceId, Reservation, ReservationId, ReturnReason};
use tokio::sync::Mutex;

use crate::scheduler::{Effect, HubState, PlaceRecord, PlaceStatus};
use crate::session::{Principal, Role, SessionId, SessionInfo, SessionRole};

pub struct HubContext {
    state: Mutex<HubState>,
    sessions: Mutex<HashMap<SessionId, SessionInfo>>,
    next_session_id: std::sync::atomic::AtomicU64,
}

impl HubContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState::new()),
            sessions: Mutex::new(HashMap::new()),
            next_session_id: std::sync::atomic::AtomicU64::new(1),
        })
    }

    pub async fn open_session(
        &self,
        role: SessionRole,
        principal: Principal,
        remote_addr: IpAddr,
    ) -> SessionId {
        let id = self
            .next_session_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let info = SessionInfo {
            id,
            role,
            principal,
            remote_addr,
        };
        self.sessions.lock().await.insert(id, info);
        id
    }

    pub async fn session_principal(&self, session: SessionId) -> Option<Principal> {
        self.sessions
            .lock()
            .await
            .get(&session)
            .map(|s| s.principal.clone())
    }

    /// `register_exporter` (§4.1): requires [`Role::Exporter`]. Assigns a
    /// fresh place id, stores the place under the caller's session, and
    /// runs a pass since a newly-registered place can satisfy reservations
    /// already in the pending queue.
    pub async fn register_exporter(
        &self,
        session: SessionId,
        port: u16,
        parts: Vec<Part>,
    ) -> Result<(PlaceId, Vec<Effect>), AuthError> {
        self.require_role(session, Role::Exporter).await?;
        let host = self
            .sessions
            .lock()
            .await
            .get(&session)
            .map(|s| s.remote_addr.to_string())
            .unwrap_or_default();

        let mut state = self.state.lock().await;
        let place_id = state.allocate_place_id();
        state.places.insert(
            place_id,
            PlaceRecord {
                place: Place {
                    id: place_id,
                    host,
                    port,
                    parts,
                },
                owner: session,
                status: PlaceStatus::Free,
            },
        );
        let effects = state.run_pass();
        Ok((place_id, effects))
    }

    /// `reserve` (§4.1): requires [`Role::Importer`], and fails with
    /// [`ReserveError::NoMatch`] if the spec's candidate set is empty at
    /// the moment of the call (§7: `reserve` must answer `NoMatch`
    /// synchronously, not enqueue and let the set empty out from under
    /// it). Once admitted, enqueues a new `Pending` reservation and
    /// immediately runs a pass; a candidate set that empties out later
    /// (an exporter deregistering) is still handled as `CandidatesGone`
    /// by that later pass.
    pub async fn reserve(
        &self,
        session: SessionId,
        spec: ImportSpec,
    ) -> Result<(ReservationId, Vec<Effect>), ReserveError> {
        self.require_role(session, Role::Importer)
            .await
            .map_err(|_| ReserveError::NotAuthorized)?;
        let principal = self
            .session_principal(session)
            .await
            .map(|p| p.name)
            .unwrap_or_default();
        let peer_ip = self
            .sessions
            .lock()
            .await
            .get(&session)
            .map(|s| s.remote_addr)
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));

        let mut state = self.state.lock().await;
        if state.candidate_places(&spec).is_empty() {
            return Err(ReserveError::NoMatch);
        }
        let reservation_id = state.allocate_reservation_id();
        let reservation = Reservation::new_pending(reservation_id, principal, peer_ip);
        state
            .reservations
            .insert(reservation_id, (reservation, spec, session));
        state.pending.push_back(reservation_id);
        let effects = state.run_pass();
        Ok((reservation_id, effects))
    }

    /// `return_reservation` (§4.1), with `Requested` as the reason.
    /// Only the importer session that created the reservation may return
    /// it — an unknown reservation id or one owned by another session is
    /// rejected rather than silently accepted (it is otherwise a trivially
    /// enumerable sequential id). A pass is not required for the release
    /// itself, but it can free the place just released for the next
    /// pending reservation, so we still run one.
    pub async fn return_reservation(
        &self,
        session: SessionId,
        reservation_id: ReservationId,
    ) -> Result<Vec<Effect>, AuthError> {
        let mut state = self.state.lock().await;
        match state.reservations.get(&reservation_id) {
            Some((_, _, owner)) if *owner == session => {}
            _ => return Err(AuthError),
        }
        let mut effects = state.return_reservation(reservation_id, ReturnReason::Requested);
        effects.extend(state.run_pass());
        Ok(effects)
    }

    /// Invoked when a session's WebSocket closes (§3 Session lifetime).
    /// Exporter sessions force-return whatever they had allocated;
    /// importer sessions lose their own pending/allocated reservations.
    pub async fn close_session(&self, session: SessionId) -> Vec<Effect> {
        self.sessions.lock().await.remove(&session);
        let mut state = self.state.lock().await;
        let mut effects = state.unregister_exporter_places(session);

        let owned: Vec<ReservationId> = state
            .reservations
            .iter()
            .filter(|(_, (_, _, owner))| *owner == session)
            .map(|(id, _)| *id)
            .collect();
        for reservation_id in owned {
            effects.extend(state.return_reservation(reservation_id, ReturnReason::SessionClosed));
        }

        effects.extend(state.run_pass());
        effects
    }

    pub async fn list_places(&self) -> Vec<Place> {
        let state = self.state.lock().await;
        let mut places: Vec<Place> = state.places.values().map(|r| r.place.clone()).collect();
        places.sort_by_key(|p| p.id);
        places
    }

    async fn require_role(&self, session: SessionId, role: Role) -> Result<(), AuthError> {
        let granted = self
            .sessions
            .lock()
            .await
            .get(&session)
            .map(|s| s.principal.has(role))
            .unwrap_or(false);
        if granted {
            Ok(())
        } else {
            Err(AuthError)
        }
    }
}

#[derive(Debug)]
pub struct AuthError;

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "principal lacks the role required for this operation")
    }
}

impl std::error::Error for AuthError {}

/// Why `reserve` refused to admit a spec.
#[derive(Debug)]
pub enum ReserveError {
    NotAuthorized,
    NoMatch,
}

impl std::fmt::Display for ReserveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReserveError::NotAuthorized => write!(f, "principal lacks the importer role"),
            ReserveError::NoMatch => write!(f, "no registered place matches this import spec"),
        }
    }
}

impl std::error::Error for ReserveError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    fn principal(roles: &[Role]) -> Principal {
        Principal {
            name: "alice".into(),
            roles: roles.iter().copied().collect::<HashSet<_>>(),
        }
    }

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[tokio::test]
    async fn register_then_reserve_allocates_immediately() {
        let ctx = HubContext::new();
        let exporter = ctx
            .open_session(SessionRole::Exporter, principal(&[Role::Exporter]), loopback())
            .await;
        let agent = ctx
            .open_session(SessionRole::Agent, principal(&[Role::Importer]), loopback())
            .await;

        let part = Part {
            compatible: ["dut".to_string()].into_iter().collect(),
            tcp: Default::default(),
            usb: Default::default(),
        };
        let (_place_id, effects) = ctx
            .register_exporter(exporter, 2192, vec![part.clone()])
            .await
            .unwrap();
        assert!(effects.is_empty());

        let mut parts = std::collections::BTreeMap::new();
        parts.insert(
            "dut".to_string(),
            boardshare_model::PartSpec {
                compatible: ["dut".to_string()].into_iter().collect(),
                tcp: Default::default(),
                usb: Default::default(),
            },
        );
        let spec = ImportSpec {
            auto_return_time: std::time::Duration::from_secs(3600),
            parts,
        };
        let (_reservation_id, effects) = ctx.reserve(agent, spec).await.unwrap();
        assert_eq!(effects.len(), 2);
    }

    #[tokio::test]
    async fn reserve_with_no_candidate_place_fails_with_no_match_and_does_not_enqueue() {
        let ctx = HubContext::new();
        let agent = ctx
            .open_session(SessionRole::Agent, principal(&[Role::Importer]), loopback())
            .await;
        let spec = ImportSpec {
            auto_return_time: std::time::Duration::from_secs(1),
            parts: {
                let mut parts = std::collections::BTreeMap::new();
                parts.insert(
                    "dut".to_string(),
                    boardshare_model::PartSpec {
                        compatible: ["dut".to_string()].into_iter().collect(),
                        tcp: Default::default(),
                        usb: Default::default(),
                    },
                );
                parts
            },
        };
        match ctx.reserve(agent, spec).await {
            Err(ReserveError::NoMatch) => {}
            other => panic!("expected NoMatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reserve_without_importer_role_is_rejected() {
        let ctx = HubContext::new();
        let session = ctx
            .open_session(SessionRole::Agent, principal(&[]), loopback())
            .await;
        let spec = ImportSpec {
            auto_return_time: std::time::Duration::from_secs(1),
            parts: Default::default(),
        };
        assert!(ctx.reserve(session, spec).await.is_err());
    }

    #[tokio::test]
    async fn closing_exporter_session_returns_allocated_reservation() {
        let ctx = HubContext::new();
        let exporter = ctx
            .open_session(SessionRole::Exporter, principal(&[Role::Exporter]), loopback())
            .await;
        let agent = ctx
            .open_session(SessionRole::Agent, principal(&[Role::Importer]), loopback())
            .await;
        let part = Part {
            compatible: ["dut".to_string()].into_iter().collect(),
            tcp: Default::default(),
            usb: Default::default(),
        };
        ctx.register_exporter(exporter, 2192, vec![part]).await.unwrap();
        let mut parts = std::collections::BTreeMap::new();
        parts.insert(
            "dut".to_string(),
            boardshare_model::PartSpec {
                compatible: ["dut".to_string()].into_iter().collect(),
                tcp: Default::default(),
                usb: Default::default(),
            },
        );
        let spec = ImportSpec {
            auto_return_time: std::time::Duration::from_secs(1),
            parts,
        };
        ctx.reserve(agent, spec).await.unwrap();

        let effects = ctx.close_session(exporter).await;
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ReservationLost { reason: ReturnReason::ExporterGone, .. })));
    }

    #[tokio::test]
    async fn return_reservation_rejects_a_session_that_does_not_own_it() {
        let ctx = HubContext::new();
        let exporter = ctx
            .open_session(SessionRole::Exporter, principal(&[Role::Exporter]), loopback())
            .await;
        let owner = ctx
            .open_session(SessionRole::Agent, principal(&[Role::Importer]), loopback())
            .await;
        let bystander = ctx
            .open_session(SessionRole::Agent, principal(&[Role::Importer]), loopback())
            .await;
        let part = Part {
            compatible: ["dut".to_string()].into_iter().collect(),
            tcp: Default::default(),
            usb: Default::default(),
        };
        ctx.register_exporter(exporter, 2192, vec![part]).await.unwrap();
        let mut parts = std::collections::BTreeMap::new();
        parts.insert(
            "dut".to_string(),
            boardshare_model::PartSpec {
                compatible: ["dut".to_string()].into_iter().collect(),
                tcp: Default::default(),
                usb: Default::default(),
            },
        );
        let spec = ImportSpec {
            auto_return_time: std::time::Duration::from_secs(1),
            parts,
        };
        let (reservation_id, _) = ctx.reserve(owner, spec).await.unwrap();

        assert!(ctx.return_reservation(bystander, reservation_id).await.is_err());
        assert!(ctx.return_reservation(owner, reservation_id).await.is_ok());
    }

    #[tokio::test]
    async fn return_reservation_on_unknown_id_is_rejected() {
        let ctx = HubContext::new();
        let session = ctx
            .open_session(SessionRole::Agent, principal(&[Role::Importer]), loopback())
            .await;
        assert!(ctx.return_reservation(session, 999).await.is_err());
    }
}
