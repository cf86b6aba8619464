use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  Idle,
  Syncing,
  Error,
}

impl SyncStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncStatus::Idle => "idle",
      SyncStatus::Syncing => "syncing",
      SyncStatus::Error => "error",
    }
  }
}

/// Observable snapshot of the offline layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
  pub is_online: bool,
  pub is_syncing: bool,
  pub pending_mutations: usize,
  pub last_synced_at: Option<DateTime<Utc>>,
  pub sync_status: SyncStatus,
  pub error_message: Option<String>,
}

impl ConnectivityState {
  pub fn new(is_online: bool) -> Self {
    Self {
      is_online,
      is_syncing: false,
      pending_mutations: 0,
      last_synced_at: None,
      sync_status: SyncStatus::Idle,
      error_message: None,
    }
  }
}
