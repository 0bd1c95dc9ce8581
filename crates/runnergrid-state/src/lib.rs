//! runnergrid-state — embedded state store for runnergrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for routing rules, scaling policies, pools, runners, job records,
//! the status reporter's queue, and exported metric snapshots.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{repository}:{runner_id}`, `{repository}:{timestamp}`)
//! enable prefix scans for related records.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.
//!
//! [`RunnerPool`] is the read/scale interface the scheduling components use
//! to reach runner pools; `runnergrid-pool` implements it on top of the store.

pub mod error;
pub mod pool_api;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use pool_api::RunnerPool;
pub use store::StateStore;
pub use types::*;
