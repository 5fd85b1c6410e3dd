//! Durable local store: the single source of truth for mutation state.

mod sqlite;

pub use sqlite::{SqliteStore, StoreError};
