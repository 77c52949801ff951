//! Local state store: durable bookmark items plus the append-only cycle log.
//!
//! Backed by SQLite through `sqlx`. Operations are grouped by concern into
//! `impl Database` blocks across the submodules.

mod cycles;
mod items;
mod schema;
mod types;

pub use schema::Database;
pub use types::{
    BookmarkItem, ContentType, CycleOutcome, ItemStatus, StatusCounts, StoreError,
    SyncCycleRecord,
};
