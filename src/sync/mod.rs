//! Synchronization between the local store and the remote API.

pub mod merge;
mod orchestrator;
pub mod pull;
mod state;
mod summary;

pub use orchestrator::{SkipReason, SyncOrchestrator, SyncReport, SyncTrigger, LAST_SYNCED_AT};
pub use state::{ConnectivityState, SyncStatus};
pub use summary::{FetchOutcome, FetchSummary, FetchTotals};
