//! Offline-first data layer for the project and beneficiary management console.
//!
//! Reads are served from a local SQLite store and refreshed in the background,
//! writes are applied locally and queued for replay, and a sync orchestrator
//! reconciles both directions whenever the server is reachable.

pub mod api;
pub mod auth;
pub mod config;
pub mod connectivity;
pub mod context;
mod db;
pub mod intercept;
pub mod notify;
pub mod preload;
pub mod queue;
pub mod reader;
pub mod store;
pub mod sync;

pub use context::AppContext;
pub use db::data_dir;
