//! Ordered log of local writes waiting to be confirmed by the server.
//!
//! Mutations are replayed strictly in the order they were captured. A failing
//! mutation stays at the head of the queue with a backoff window; once it has
//! failed `max_retries` times it needs manual resolution (retry or discard).

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::HttpMethod;
use crate::store::{LocalStore, Table};

/// Kind of write a mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl Operation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Operation::Create => "create",
      Operation::Update => "update",
      Operation::Delete => "delete",
    }
  }
}

impl FromStr for Operation {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "create" => Ok(Operation::Create),
      "update" => Ok(Operation::Update),
      "delete" => Ok(Operation::Delete),
      other => Err(eyre!("Unknown mutation operation '{}'", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
  Pending,
  /// Retries exhausted; blocks the queue until retried or discarded
  NeedsResolution,
}

impl MutationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      MutationStatus::Pending => "pending",
      MutationStatus::NeedsResolution => "needs_resolution",
    }
  }
}

impl FromStr for MutationStatus {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(MutationStatus::Pending),
      "needs_resolution" => Ok(MutationStatus::NeedsResolution),
      other => Err(eyre!("Unknown mutation status '{}'", other)),
    }
  }
}

/// A write captured locally and not yet acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
  pub id: String,
  /// Queue position, assigned by the store
  pub seq: i64,
  pub entity_type: Table,
  pub entity_id: String,
  pub operation: Operation,
  pub payload: Value,
  pub endpoint: String,
  pub method: HttpMethod,
  pub retry_count: u32,
  pub status: MutationStatus,
  pub last_error: Option<String>,
  pub next_attempt_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
}

impl PendingMutation {
  /// Whether the backoff window has elapsed.
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at.map_or(true, |at| at <= now)
  }
}

/// What a caller hands over when writing; the target travels with the write.
#[derive(Debug, Clone)]
pub struct MutationDescriptor {
  pub entity_type: Table,
  pub entity_id: String,
  pub operation: Operation,
  pub payload: Value,
  pub endpoint: String,
  pub method: HttpMethod,
}

impl MutationDescriptor {
  pub fn create(entity_type: Table, entity_id: &str, payload: Value, endpoint: &str) -> Self {
    Self {
      entity_type,
      entity_id: entity_id.to_string(),
      operation: Operation::Create,
      payload,
      endpoint: endpoint.to_string(),
      method: HttpMethod::Post,
    }
  }

  pub fn update(entity_type: Table, entity_id: &str, payload: Value, endpoint: &str) -> Self {
    Self {
      entity_type,
      entity_id: entity_id.to_string(),
      operation: Operation::Update,
      payload,
      endpoint: endpoint.to_string(),
      method: HttpMethod::Put,
    }
  }

  pub fn delete(entity_type: Table, entity_id: &str, endpoint: &str) -> Self {
    Self {
      entity_type,
      entity_id: entity_id.to_string(),
      operation: Operation::Delete,
      payload: Value::Null,
      endpoint: endpoint.to_string(),
      method: HttpMethod::Delete,
    }
  }

  /// Override the HTTP method (e.g. PATCH for partial updates).
  pub fn with_method(mut self, method: HttpMethod) -> Self {
    self.method = method;
    self
  }
}

/// Bounded retry with exponential backoff for failed mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  #[serde(default = "default_base_delay_secs")]
  pub base_delay_secs: u64,
  #[serde(default = "default_max_delay_secs")]
  pub max_delay_secs: u64,
}

fn default_max_retries() -> u32 {
  5
}

fn default_base_delay_secs() -> u64 {
  2
}

fn default_max_delay_secs() -> u64 {
  300
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: default_max_retries(),
      base_delay_secs: default_base_delay_secs(),
      max_delay_secs: default_max_delay_secs(),
    }
  }
}

impl RetryPolicy {
  /// Delay before the next attempt after `retry_count` failures (1-based).
  pub fn delay_for(&self, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(20);
    let secs = self
      .base_delay_secs
      .saturating_mul(1u64 << exponent)
      .min(self.max_delay_secs);
    Duration::seconds(secs as i64)
  }

  pub fn is_exhausted(&self, retry_count: u32) -> bool {
    retry_count >= self.max_retries
  }
}

/// FIFO queue of pending mutations, persisted in the local store.
#[derive(Clone)]
pub struct MutationQueue {
  store: Arc<dyn LocalStore>,
  policy: RetryPolicy,
}

impl MutationQueue {
  pub fn new(store: Arc<dyn LocalStore>, policy: RetryPolicy) -> Self {
    Self { store, policy }
  }

  pub fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  /// Append a mutation at the tail of the queue.
  pub fn enqueue(&self, descriptor: MutationDescriptor) -> Result<PendingMutation> {
    let mut mutation = PendingMutation {
      id: uuid::Uuid::new_v4().to_string(),
      seq: 0,
      entity_type: descriptor.entity_type,
      entity_id: descriptor.entity_id,
      operation: descriptor.operation,
      payload: descriptor.payload,
      endpoint: descriptor.endpoint,
      method: descriptor.method,
      retry_count: 0,
      status: MutationStatus::Pending,
      last_error: None,
      next_attempt_at: None,
      created_at: Utc::now(),
    };

    mutation.seq = self.store.insert_mutation(&mutation)?;
    debug!(
      mutation_id = %mutation.id,
      table = %mutation.entity_type,
      entity_id = %mutation.entity_id,
      operation = mutation.operation.as_str(),
      "Queued mutation"
    );

    Ok(mutation)
  }

  /// All queued mutations in replay order.
  pub fn pending(&self) -> Result<Vec<PendingMutation>> {
    self.store.list_mutations()
  }

  pub fn len(&self) -> Result<usize> {
    self.store.count_mutations()
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Oldest queued mutation.
  pub fn peek(&self) -> Result<Option<PendingMutation>> {
    Ok(self.pending()?.into_iter().next())
  }

  pub fn get(&self, id: &str) -> Result<Option<PendingMutation>> {
    Ok(self.pending()?.into_iter().find(|m| m.id == id))
  }

  /// Whether any queued mutation targets this record.
  pub fn has_pending_for(&self, table: Table, entity_id: &str) -> Result<bool> {
    self.store.has_mutation_for(table, entity_id)
  }

  /// Remove a mutation the server has confirmed.
  pub fn acknowledge(&self, id: &str) -> Result<bool> {
    self.store.delete_mutation(id)
  }

  /// Keep a failed mutation queued with an incremented retry count.
  pub fn record_failure(&self, mutation: &PendingMutation, error: &str) -> Result<PendingMutation> {
    let mut failed = mutation.clone();
    failed.retry_count += 1;
    failed.last_error = Some(error.to_string());

    if self.policy.is_exhausted(failed.retry_count) {
      failed.status = MutationStatus::NeedsResolution;
      failed.next_attempt_at = None;
      warn!(
        mutation_id = %failed.id,
        retries = failed.retry_count,
        "Mutation needs manual resolution"
      );
    } else {
      failed.next_attempt_at = Some(Utc::now() + self.policy.delay_for(failed.retry_count));
    }

    self.store.update_mutation(&failed)?;
    Ok(failed)
  }

  /// Put a mutation back into normal rotation, clearing its failure history.
  pub fn retry(&self, id: &str) -> Result<bool> {
    let Some(mut mutation) = self.get(id)? else {
      return Ok(false);
    };

    mutation.retry_count = 0;
    mutation.status = MutationStatus::Pending;
    mutation.next_attempt_at = None;
    mutation.last_error = None;
    self.store.update_mutation(&mutation)?;
    info!(mutation_id = %id, "Mutation reset for retry");

    Ok(true)
  }

  /// Drop a mutation without sending it.
  pub fn discard(&self, id: &str) -> Result<bool> {
    let removed = self.store.delete_mutation(id)?;
    if removed {
      warn!(mutation_id = %id, "Mutation discarded");
    }
    Ok(removed)
  }

  /// Point later mutations at a server-assigned id.
  pub fn reassign_entity(&self, table: Table, from: &str, to: &str) -> Result<usize> {
    self.store.reassign_mutations(table, from, to)
  }
}
