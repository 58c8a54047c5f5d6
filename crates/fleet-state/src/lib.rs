//! fleet-state — embedded state store for FleetGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for the cluster registry and the scale request queue.
//!
//! # Architecture
//!
//! Domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Clusters are keyed by their numeric id with a secondary name index for
//! unique-name lookups; scale requests use composite zero-padded keys
//! (`{cluster_id}:{request_id}`) so a plain prefix scan yields them in
//! creation order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
