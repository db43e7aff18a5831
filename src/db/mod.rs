//! Local durable store: the sync queue and the event cache.
//!
//! This module is split into three submodules:
//! - `model`: row mapping from SQLite rows into domain types.
//! - `repo`: the durable queue store (entries, sync log, sync config).
//! - `cache`: reference data cached for offline use.
//!
//! External modules should import from `scout_sync::db`; the repository API
//! is re-exported here.

pub mod cache;
pub mod model;
pub mod repo;

pub use cache::*;
pub use repo::*;
