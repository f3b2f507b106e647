//! Reservation state machine: `Pending -> Allocated -> Returned`, with
//! `Pending -> Returned` permitted directly (cancellation).

use crate::import_spec::Assignment;
use crate::place::PlaceId;
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub type ReservationId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    Pending,
    Allocated,
    Returned,
}

/// Why a reservation ended up in `Returned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnReason {
    Requested,
    CandidatesGone,
    ExporterGone,
    SessionClosed,
    AutoReturn,
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: ReservationId,
    pub principal: String,
    pub peer_ip: std::net::IpAddr,
    pub place_id: Option<PlaceId>,
    pub assignment: Assignment,
    pub state: ReservationState,
    pub return_reason: Option<ReturnReason>,
    pub created_at: Instant,
    pub allocated_at: Option<Instant>,
    pub returned_at: Option<Instant>,
}

impl Reservation {
    pub fn new_pending(id: ReservationId, principal: String, peer_ip: std::net::IpAddr) -> Self {
        Self {
            id,
            principal,
            peer_ip,
            place_id: None,
            assignment: Assignment::new(),
            state: ReservationState::Pending,
            return_reason: None,
            created_at: Instant::now(),
            allocated_at: None,
            returned_at: None,
        }
    }

    /// `Pending -> Allocated`. Panics if called from any other state —
    /// the scheduler is the only caller and never double-allocates.
    pub fn allocate(&mut self, place_id: PlaceId, assignment: Assignment) {
        assert_eq!(self.state, ReservationState::Pending);
        self.place_id = Some(place_id);
        self.assignment = assignment;
        self.state = ReservationState::Allocated;
        self.allocated_at = Some(Instant::now());
    }

    /// `Pending|Allocated -> Returned`.
    pub fn finish(&mut self, reason: ReturnReason) {
        assert_ne!(self.state, ReservationState::Returned);
        self.state = ReservationState::Returned;
        self.return_reason = Some(reason);
        self.returned_at = Some(Instant::now());
    }
}
