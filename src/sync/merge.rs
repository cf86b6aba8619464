//! Applying server snapshots to the local store.
//!
//! A server record never overwrites a local record that still has a queued
//! mutation. Otherwise the newer timestamp wins; when either side carries no
//! usable timestamp the server copy is taken.

use chrono::{DateTime, NaiveDateTime, Utc};
use color_eyre::Result;
use serde_json::Value;
use tracing::debug;

use crate::store::{document_updated_at, encode, CachedRecord, Cacheable, LocalStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
  pub written: usize,
  pub skipped_pending: usize,
  pub skipped_stale: usize,
}

/// Upsert server entities as synced records, honoring pending mutations and
/// last-writer-wins.
pub fn apply_server_records<T: Cacheable>(store: &dyn LocalStore, items: &[T]) -> Result<MergeStats> {
  let table = T::table();
  let mut stats = MergeStats::default();
  if items.is_empty() {
    return Ok(stats);
  }

  let ids: Vec<String> = items.iter().map(|item| item.cache_key()).collect();
  let existing = store.bulk_get(table, &ids)?;

  let mut writes = Vec::with_capacity(items.len());
  for ((item, id), local) in items.iter().zip(&ids).zip(existing) {
    if store.has_mutation_for(table, id)? {
      stats.skipped_pending += 1;
      continue;
    }

    if let Some(local) = local {
      if !server_wins(&local, item.updated_at()) {
        stats.skipped_stale += 1;
        continue;
      }
    }

    writes.push(CachedRecord::synced(encode(item)?));
  }

  stats.written = writes.len();
  store.bulk_put(table, &writes)?;

  if stats.skipped_pending > 0 || stats.skipped_stale > 0 {
    debug!(
      %table,
      written = stats.written,
      skipped_pending = stats.skipped_pending,
      skipped_stale = stats.skipped_stale,
      "Merged server snapshot"
    );
  }

  Ok(stats)
}

/// Whether a server copy stamped `server_updated_at` replaces `local`.
pub fn server_wins(local: &CachedRecord<Value>, server_updated_at: Option<&str>) -> bool {
  let local_ts = if local.synced {
    document_updated_at(&local.data).and_then(parse_timestamp)
  } else {
    Some(local.local_updated_at)
  };

  match (server_updated_at.and_then(parse_timestamp), local_ts) {
    (Some(server), Some(local)) => server >= local,
    _ => true,
  }
}

/// Parse the timestamp formats the API emits. Naive values are taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.with_timezone(&Utc));
  }
  ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
    .iter()
    .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
    .map(|naive| naive.and_utc())
}
