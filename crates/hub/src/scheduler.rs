//! The matching/reservation engine (§4.1 policy, §5 "the scheduler in H
//! is serialized"). This module is deliberately synchronous and free of
//! any I/O or session plumbing: [`HubState`] is plain data, [`run_pass`]
//! is a pure function over it, and every property in §8 can be (and is,
//! below) tested without starting a server.

use boardshare_model::{
    candidate_assignment, ImportSpec, Part, Place, PlaceId, Reservation, ReservationId,
    ReservationState, ReturnReason,
};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use crate::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceStatus {
    Free,
    Allocated(ReservationId),
}

#[derive(Debug, Clone)]
pub struct PlaceRecord {
    pub place: Place,
    pub owner: SessionId,
    pub status: PlaceStatus,
}

/// An observable side effect of a scheduler pass, applied by the caller
/// after the lock guarding [`HubState`] is released.
#[derive(Debug, Clone)]
pub enum Effect {
    PlaceAvailable {
        agent_session: SessionId,
        reservation_id: ReservationId,
        place_id: PlaceId,
        host: String,
        port: u16,
        parts: Vec<Part>,
        token: String,
    },
    PlaceReserved {
        exporter_session: SessionId,
        place_id: PlaceId,
        peer_ip: IpAddr,
        token: String,
    },
    PlaceReturned {
        exporter_session: SessionId,
        place_id: PlaceId,
    },
    ReservationLost {
        agent_session: SessionId,
        reservation_id: ReservationId,
        reason: ReturnReason,
    },
}

pub const RETURNED_HISTORY_CAP: usize = 64;

/// All of the hub's canonical state: places, reservations, the FIFO
/// pending queue, and a bounded history of `Returned` reservation ids
/// (§9 Open Question, resolved: the hub keeps a short ring buffer).
pub struct HubState {
    pub places: HashMap<PlaceId, PlaceRecord>,
    next_place_id: PlaceId,
    pub reservations: HashMap<ReservationId, (Reservation, ImportSpec, SessionId)>,
    next_reservation_id: ReservationId,
    pub pending: VecDeque<ReservationId>,
    pub history: VecDeque<ReservationId>,
}

impl HubState {
    pub fn new() -> Self {
        Self {
            places: HashMap::new(),
            next_place_id: 1,
            reservations: HashMap::new(),
            next_reservation_id: 1,
            pending: VecDeque::new(),
            history: VecDeque::new(),
        }
    }

    pub fn allocate_place_id(&mut self) -> PlaceId {
        let id = self.next_place_id;
        self.next_place_id += 1;
        id
    }

    pub fn allocate_reservation_id(&mut self) -> ReservationId {
        let id = self.next_reservation_id;
        self.next_reservation_id += 1;
        id
    }

    fn push_history(&mut self, id: ReservationId) {
        self.history.push_back(id);
        while self.history.len() > RETURNED_HISTORY_CAP {
            self.history.pop_front();
        }
    }

    /// Rule 3: a `Place` is a candidate for `spec` iff a valid assignment
    /// exists against its currently-registered parts.
    pub(crate) fn candidate_places(&self, spec: &ImportSpec) -> Vec<PlaceId> {
        let mut ids: Vec<PlaceId> = self.places.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter(|id| candidate_assignment(spec, &self.places[id].place).is_some())
            .collect()
    }

    /// Runs one scheduler pass: walks the FIFO pending queue in
    /// insertion order, allocating the first `Free` candidate place to
    /// each reservation it can (§4.1 rules 2-3), and moving any
    /// reservation whose candidate set has emptied to `Returned` with
    /// `CandidatesGone` (rule 6).
    pub fn run_pass(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut still_pending = VecDeque::new();

        while let Some(reservation_id) = self.pending.pop_front() {
            let Some((reservation, spec, agent_session)) = self.reservations.get(&reservation_id)
            else {
                continue;
            };
            if reservation.state != ReservationState::Pending {
                continue;
            }
            let agent_session = *agent_session;

            let candidates = self.candidate_places(spec);
            if candidates.is_empty() {
                if let Some((reservation, _, _)) = self.reservations.get_mut(&reservation_id) {
                    reservation.finish(ReturnReason::CandidatesGone);
                }
                self.push_history(reservation_id);
                effects.push(Effect::ReservationLost {
                    agent_session,
                    reservation_id,
                    reason: ReturnReason::CandidatesGone,
                });
                continue;
            }

            let free_candidate = candidates
                .into_iter()
                .find(|id| matches!(self.places[id].status, PlaceStatus::Free));

            match free_candidate {
                Some(place_id) => {
                    let spec = spec.clone();
                    let assignment = candidate_assignment(&spec, &self.places[&place_id].place)
                        .expect("already confirmed a candidate");
                    let token = crate::tokens::generate();

                    let (place, exporter_session) = {
                        let record = self.places.get_mut(&place_id).unwrap();
                        record.status = PlaceStatus::Allocated(reservation_id);
                        (record.place.clone(), record.owner)
                    };

                    let peer_ip = {
                        let (reservation, _, _) = self.reservations.get_mut(&reservation_id).unwrap();
                        reservation.allocate(place_id, assignment);
                        reservation.peer_ip
                    };

                    effects.push(Effect::PlaceAvailable {
                        agent_session,
                        reservation_id,
                        place_id,
                        host: place.host.clone(),
                        port: place.port,
                        parts: place.parts.clone(),
                        token: token.clone(),
                    });
                    effects.push(Effect::PlaceReserved {
                        exporter_session,
                        place_id,
                        peer_ip,
                        token,
                    });
                }
                None => still_pending.push_back(reservation_id),
            }
        }

        self.pending = still_pending;
        effects
    }

    /// `return_reservation` (§4.1): `Returned`, releasing the place if
    /// `Allocated`, and notifying the previously-notified exporter.
    pub fn return_reservation(
        &mut self,
        reservation_id: ReservationId,
        reason: ReturnReason,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let Some((reservation, _, _)) = self.reservations.get_mut(&reservation_id) else {
            return effects;
        };
        if reservation.state == ReservationState::Returned {
            return effects; // idempotent: second `return` is a no-op
        }
        let place_id = reservation.place_id;
        reservation.finish(reason);
        self.push_history(reservation_id);

        if let Some(place_id) = place_id {
            if let Some(record) = self.places.get_mut(&place_id) {
                if record.status == PlaceStatus::Allocated(reservation_id) {
                    record.status = PlaceStatus::Free;
                    effects.push(Effect::PlaceReturned {
                        exporter_session: record.owner,
                        place_id,
                    });
                }
            }
        }
        effects
    }

    /// Exporter session close: unregister its places, force-returning
    /// any reservation allocated against them (§3 Session).
    pub fn unregister_exporter_places(&mut self, session: SessionId) -> Vec<Effect> {
        let mut effects = Vec::new();
        let owned: Vec<PlaceId> = self
            .places
            .iter()
            .filter(|(_, r)| r.owner == session)
            .map(|(id, _)| *id)
            .collect();

        for place_id in owned {
            if let Some(record) = self.places.remove(&place_id) {
                if let PlaceStatus::Allocated(reservation_id) = record.status {
                    if let Some((reservation, _, agent_session)) =
                        self.reservations.get_mut(&reservation_id)
                    {
                        let agent_session = *agent_session;
                        reservation.finish(ReturnReason::ExporterGone);
                        self.push_history(reservation_id);
                        effects.push(Effect::ReservationLost {
                            agent_session,
                            reservation_id,
                            reason: ReturnReason::ExporterGone,
                        });
                    }
                }
            }
        }
        effects
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardshare_model::{ImportSpec, PartSpec};
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn tagged_place(id: PlaceId, owner: SessionId, tags: &[&str]) -> PlaceRecord {
        PlaceRecord {
            place: Place {
                id,
                host: "10.0.0.1".into(),
                port: 2192,
                parts: vec![Part {
                    compatible: tags.iter().map(|t| t.to_string()).collect(),
                    tcp: Default::default(),
                    usb: Default::default(),
                }],
            },
            owner,
            status: PlaceStatus::Free,
        }
    }

    fn simple_spec(tag: &str) -> ImportSpec {
        let mut parts = BTreeMap::new();
        parts.insert(
            "a".to_string(),
            PartSpec {
                compatible: [tag.to_string()].into_iter().collect(),
                tcp: Default::default(),
                usb: Default::default(),
            },
        );
        ImportSpec {
            auto_return_time: Duration::from_secs(0),
            parts,
        }
    }

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn enqueue(state: &mut HubState, tag: &str) -> ReservationId {
        let id = state.allocate_reservation_id();
        let reservation = Reservation::new_pending(id, "alice".into(), localhost());
        state
            .reservations
            .insert(id, (reservation, simple_spec(tag), 0));
        state.pending.push_back(id);
        id
    }

    #[test]
    fn fifo_fairness_two_reservations_one_place() {
        let mut state = HubState::new();
        let place_id = state.allocate_place_id();
        state.places.insert(place_id, tagged_place(place_id, 100, &["x"]));

        let r1 = enqueue(&mut state, "x");
        let r2 = enqueue(&mut state, "x");

        state.run_pass();

        assert_eq!(state.reservations[&r1].0.state, ReservationState::Allocated);
        assert_eq!(state.reservations[&r2].0.state, ReservationState::Pending);
    }

    #[test]
    fn returning_a_place_admits_the_next_pending_reservation() {
        let mut state = HubState::new();
        let p1 = state.allocate_place_id();
        let p2 = state.allocate_place_id();
        state.places.insert(p1, tagged_place(p1, 100, &["x"]));
        state.places.insert(p2, tagged_place(p2, 100, &["x"]));

        let r1 = enqueue(&mut state, "x");
        let r2 = enqueue(&mut state, "x");
        let r3 = enqueue(&mut state, "x");

        state.run_pass();
        assert_eq!(state.reservations[&r1].0.state, ReservationState::Allocated);
        assert_eq!(state.reservations[&r2].0.state, ReservationState::Allocated);
        assert_eq!(state.reservations[&r3].0.state, ReservationState::Pending);

        state.return_reservation(r1, ReturnReason::Requested);
        state.run_pass();
        assert_eq!(state.reservations[&r3].0.state, ReservationState::Allocated);
        assert_eq!(state.reservations[&r3].0.place_id, Some(p1));
    }

    #[test]
    fn at_most_one_allocated_reservation_per_place() {
        let mut state = HubState::new();
        let p1 = state.allocate_place_id();
        state.places.insert(p1, tagged_place(p1, 100, &["x"]));
        let r1 = enqueue(&mut state, "x");
        let r2 = enqueue(&mut state, "x");
        state.run_pass();
        let allocated_count = [r1, r2]
            .iter()
            .filter(|id| state.reservations[id].0.state == ReservationState::Allocated)
            .count();
        assert_eq!(allocated_count, 1);
    }

    #[test]
    fn exporter_deregistration_empties_candidate_set_and_returns() {
        let mut state = HubState::new();
        let p1 = state.allocate_place_id();
        state.places.insert(p1, tagged_place(p1, 100, &["x"]));
        let r1 = enqueue(&mut state, "x");

        state.places.remove(&p1);
        state.run_pass();

        assert_eq!(state.reservations[&r1].0.state, ReservationState::Returned);
        assert_eq!(state.reservations[&r1].0.return_reason, Some(ReturnReason::CandidatesGone));
    }

    #[test]
    fn exporter_session_close_force_returns_allocated_reservation() {
        let mut state = HubState::new();
        let p1 = state.allocate_place_id();
        state.places.insert(p1, tagged_place(p1, 100, &["x"]));
        let r1 = enqueue(&mut state, "x");
        state.run_pass();
        assert_eq!(state.reservations[&r1].0.state, ReservationState::Allocated);

        state.unregister_exporter_places(100);
        assert_eq!(state.reservations[&r1].0.state, ReservationState::Returned);
        assert_eq!(state.reservations[&r1].0.return_reason, Some(ReturnReason::ExporterGone));
        assert!(!state.places.contains_key(&p1));
    }

    #[test]
    fn double_return_is_a_no_op() {
        let mut state = HubState::new();
        let p1 = state.allocate_place_id();
        state.places.insert(p1, tagged_place(p1, 100, &["x"]));
        let r1 = enqueue(&mut state, "x");
        state.run_pass();
        let effects1 = state.return_reservation(r1, ReturnReason::Requested);
        assert!(!effects1.is_empty());
        let effects2 = state.return_reservation(r1, ReturnReason::Requested);
        assert!(effects2.is_empty());
    }
}
