//! Durable data layer for drover.
//!
//! Holds the typed error hierarchy, the persisted data model (task, worker,
//! level, and feature state), the atomic-write helper, the mtime-cached
//! state store, worker heartbeats, and the task-graph parser/resolver.
//! Everything here is synchronous filesystem code; the async engine lives
//! in `drover-core`.

pub mod atomic;
pub mod error;
pub mod graph;
pub mod heartbeat;
pub mod models;
pub mod store;

pub use error::{DroverError, Result};
