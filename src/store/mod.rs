//! Local persistent store for offline support.
//!
//! This module provides:
//! - Keyed, per-entity tables of JSON documents with `synced` / `local_updated_at` bookkeeping
//! - The two control tables (pending mutations, offline credentials) and sync metadata
//! - A no-op store for running online-only when the database cannot be opened
//! - Typed helpers that hand clean domain values to the application

mod storage;
mod traits;
mod typed;

pub use storage::{LocalStore, NoopStore, SqliteStore};
pub use traits::{document_updated_at, record_id, strip_offline_fields, CachedRecord, Cacheable, Table};
pub use typed::{decode, encode, LocalStoreExt, WhereClause};
pub(crate) use typed::decode_all;
