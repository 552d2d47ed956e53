//! SQLite-backed state for mission control: typed row models, per-table
//! query modules, and the append-only unit-event store with replay.

pub mod models;
pub mod queries;
pub mod store;

pub use store::{Store, default_migrations_path};
