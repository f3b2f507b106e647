//! The hub (§4.1): the registry of exported places, the reservation
//! queue, and the candidate-matching scheduler that is the sole writer
//! of both. Exposed as a library so the `tests/` integration crate can
//! drive [`state::HubContext`] and [`http::router`] directly.

pub mod auth;
pub mod config;
pub mod http;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod tokens;
pub mod ws;
