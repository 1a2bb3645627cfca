//! farmhand: a multi-tenant job leasing and scheduling backend for remote
//! game-automation agents.
//!
//! Three cooperating pieces share one leasing primitive:
//!
//! - the agent poll protocol, which claims durably queued jobs with a
//!   dual-store lease (PostgreSQL row + Redis key);
//! - the schedule generator, which turns due recurring tasks into pending
//!   jobs, deduplicated through ephemeral slots;
//! - the interactive scan state machine, a human-in-the-loop session type
//!   with a realtime push channel layered on the same lease.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod notify;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod taskmeta;
