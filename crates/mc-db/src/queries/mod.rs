//! Query functions, one module per table.
//!
//! Mutating functions take the [`crate::Store`] and hold its write lock for
//! the duration of their statements; read-only functions query the pool
//! directly.

pub mod handoffs;
pub mod merge_requests;
pub mod missions;
pub mod plans;
pub mod rounds;
pub mod signals;
pub mod snapshots;
pub mod unit_events;
pub mod work_units;
pub mod workers;
