//! tidescale-state — embedded state store for Tidescale.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for policy records, credential secrets, and the local capacity
//! and utilization tables that back the store-driven providers.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Policy records carry a `version` that every status write must match,
//! giving writers optimistic-concurrency semantics: a stale write fails
//! with [`StateError::Conflict`] and leaves the record untouched.
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
