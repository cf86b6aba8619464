use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::merge::parse_timestamp;
use super::pull::{pull_table, pull_user_projects};
use super::state::{ConnectivityState, SyncStatus};
use super::summary::FetchSummary;
use crate::api::types::{Beneficiary, FormSubmission, FormTemplate, Project, Service, User};
use crate::api::{endpoints, ListParams, RemoteApi};
use crate::connectivity::ConnectivityMonitor;
use crate::notify::{Subscribers, Subscription};
use crate::queue::{MutationDescriptor, MutationQueue, MutationStatus, Operation, PendingMutation};
use crate::store::{record_id, strip_offline_fields, CachedRecord, LocalStore, Table};

pub const LAST_SYNCED_AT: &str = "lastSyncedAt";

/// What started a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncTrigger {
  Manual,
  Reconnected,
  /// Right after a preload; the pull already happened
  InitialLoad,
  Interval,
  /// A write was queued while online
  LocalWrite,
}

impl SyncTrigger {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncTrigger::Manual => "manual",
      SyncTrigger::Reconnected => "reconnected",
      SyncTrigger::InitialLoad => "initial_load",
      SyncTrigger::Interval => "interval",
      SyncTrigger::LocalWrite => "local_write",
    }
  }

  fn pulls(&self) -> bool {
    matches!(
      self,
      SyncTrigger::Manual | SyncTrigger::Reconnected | SyncTrigger::Interval
    )
  }

  fn honors_backoff(&self) -> bool {
    !matches!(self, SyncTrigger::Manual)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
  Offline,
  AlreadySyncing,
}

/// What a sync attempt did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
  pub trigger: SyncTrigger,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub skipped: Option<SkipReason>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pull: Option<FetchSummary>,
  pub pushed: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub push_error: Option<String>,
  pub remaining: usize,
}

impl SyncReport {
  fn skipped(trigger: SyncTrigger, reason: SkipReason) -> Self {
    Self {
      trigger,
      skipped: Some(reason),
      pull: None,
      pushed: 0,
      push_error: None,
      remaining: 0,
    }
  }

  pub fn ran(&self) -> bool {
    self.skipped.is_none()
  }
}

#[derive(Default)]
struct PushOutcome {
  pushed: usize,
  halted: Option<String>,
}

/// Clears the "already syncing" flag when a sync ends, however it ends.
struct SyncingFlag<'a>(&'a AtomicBool);

impl Drop for SyncingFlag<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

struct Inner {
  store: Arc<dyn LocalStore>,
  api: Arc<dyn RemoteApi>,
  queue: MutationQueue,
  monitor: ConnectivityMonitor,
  user_id: RwLock<Option<String>>,
  state: RwLock<ConnectivityState>,
  subscribers: Arc<Subscribers<ConnectivityState>>,
  syncing: AtomicBool,
  connectivity: Mutex<Option<Subscription>>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Owner of `ConnectivityState`: pulls server snapshots, drains the mutation
/// queue and tells subscribers about every state change.
#[derive(Clone)]
pub struct SyncOrchestrator {
  inner: Arc<Inner>,
}

impl SyncOrchestrator {
  pub fn new(
    store: Arc<dyn LocalStore>,
    api: Arc<dyn RemoteApi>,
    queue: MutationQueue,
    monitor: ConnectivityMonitor,
  ) -> Self {
    let online = monitor.is_online();
    Self {
      inner: Arc::new(Inner {
        store,
        api,
        queue,
        monitor,
        user_id: RwLock::new(None),
        state: RwLock::new(ConnectivityState::new(online)),
        subscribers: Subscribers::new(),
        syncing: AtomicBool::new(false),
        connectivity: Mutex::new(None),
        tasks: Mutex::new(Vec::new()),
      }),
    }
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.inner.queue
  }

  /// User whose project assignments are pulled along with everything else.
  pub fn set_user(&self, user_id: Option<String>) {
    if let Ok(mut current) = self.inner.user_id.write() {
      *current = user_id;
    }
  }

  pub fn user_id(&self) -> Option<String> {
    self.inner.user_id.read().ok().and_then(|u| u.clone())
  }

  // ==========================================================================
  // Lifecycle
  // ==========================================================================

  /// Load persisted state, follow connectivity changes and optionally start
  /// the periodic sync.
  pub fn init(&self, auto_sync_interval: Option<Duration>) -> Result<()> {
    let pending = self.inner.queue.len()?;
    let last_synced_at = self
      .inner
      .store
      .get_meta(LAST_SYNCED_AT)?
      .and_then(|s| parse_timestamp(&s));
    let online = self.inner.monitor.is_online();
    self.update_state(|s| {
      s.is_online = online;
      s.pending_mutations = pending;
      s.last_synced_at = last_synced_at;
    });

    let weak = Arc::downgrade(&self.inner);
    let subscription = self.inner.monitor.subscribe(move |online| {
      if let Some(inner) = weak.upgrade() {
        SyncOrchestrator { inner }.on_connectivity_change(*online);
      }
    });
    if let Ok(mut current) = self.inner.connectivity.lock() {
      if let Some(previous) = current.replace(subscription) {
        previous.unsubscribe();
      }
    }

    if let Some(interval) = auto_sync_interval {
      let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| eyre!("Periodic sync needs a tokio runtime: {}", e))?;
      let handle = runtime.spawn(interval_loop(Arc::downgrade(&self.inner), interval));
      if let Ok(mut tasks) = self.inner.tasks.lock() {
        tasks.push(handle);
      }
    }

    debug!(pending, online, "Sync orchestrator initialized");
    Ok(())
  }

  pub fn dispose(&self) {
    if let Ok(mut current) = self.inner.connectivity.lock() {
      if let Some(subscription) = current.take() {
        subscription.unsubscribe();
      }
    }
    if let Ok(mut tasks) = self.inner.tasks.lock() {
      for task in tasks.drain(..) {
        task.abort();
      }
    }
  }

  fn on_connectivity_change(&self, online: bool) {
    self.update_state(|s| s.is_online = online);
    if online {
      self.spawn_sync(SyncTrigger::Reconnected);
    }
  }

  fn spawn_sync(&self, trigger: SyncTrigger) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      debug!(trigger = trigger.as_str(), "No runtime, background sync not started");
      return;
    };

    let orchestrator = self.clone();
    runtime.spawn(async move {
      if let Err(e) = orchestrator.sync(trigger).await {
        error!(trigger = trigger.as_str(), "Background sync failed: {}", e);
      }
    });
  }

  // ==========================================================================
  // State
  // ==========================================================================

  pub fn is_online(&self) -> bool {
    self.inner.monitor.is_online()
  }

  pub fn get_state(&self) -> ConnectivityState {
    match self.inner.state.read() {
      Ok(state) => state.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&ConnectivityState) + Send + Sync + 'static,
  {
    self.inner.subscribers.subscribe(callback)
  }

  fn update_state<F: FnOnce(&mut ConnectivityState)>(&self, apply: F) {
    let (before, after) = {
      let mut state = match self.inner.state.write() {
        Ok(state) => state,
        Err(poisoned) => poisoned.into_inner(),
      };
      let before = state.clone();
      apply(&mut state);
      (before, state.clone())
    };

    if before != after {
      self.inner.subscribers.notify(&after);
    }
  }

  fn refresh_pending(&self) -> Result<()> {
    let pending = self.inner.queue.len()?;
    self.update_state(|s| s.pending_mutations = pending);
    Ok(())
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Apply a write to the local store right away and queue it for the server.
  pub fn queue_mutation(&self, descriptor: MutationDescriptor) -> Result<PendingMutation> {
    if !self.inner.store.is_persistent() {
      return Err(eyre!(
        "Offline storage is unavailable; {} {} cannot be queued",
        descriptor.operation.as_str(),
        descriptor.entity_type
      ));
    }

    self.apply_optimistic(&descriptor)?;
    let mutation = self.inner.queue.enqueue(descriptor)?;
    self.refresh_pending()?;

    if self.is_online() {
      self.spawn_sync(SyncTrigger::LocalWrite);
    }
    Ok(mutation)
  }

  fn apply_optimistic(&self, descriptor: &MutationDescriptor) -> Result<()> {
    let store = &self.inner.store;
    let table = descriptor.entity_type;
    let id = &descriptor.entity_id;

    if descriptor.operation == Operation::Delete {
      store.delete(table, id)?;
      return Ok(());
    }

    let Value::Object(_) = &descriptor.payload else {
      return Ok(());
    };

    let mut document = match store.get(table, id)? {
      Some(existing) if descriptor.operation == Operation::Update => {
        let mut data = existing.data;
        overlay(&mut data, &descriptor.payload);
        data
      }
      _ => descriptor.payload.clone(),
    };
    strip_offline_fields(&mut document);
    if let Value::Object(map) = &mut document {
      map.insert("id".to_string(), Value::String(id.clone()));
    }

    store.put(table, &CachedRecord::local(document))
  }

  /// Put a mutation that needs resolution back into rotation.
  pub fn retry_mutation(&self, id: &str) -> Result<bool> {
    let reset = self.inner.queue.retry(id)?;
    self.refresh_pending()?;
    Ok(reset)
  }

  /// Drop a queued mutation. The optimistic local row is left as written.
  pub fn discard_mutation(&self, id: &str) -> Result<bool> {
    let removed = self.inner.queue.discard(id)?;
    self.refresh_pending()?;
    Ok(removed)
  }

  /// Wipe every table, including queued mutations and cached credentials.
  pub fn clear_cache(&self) -> Result<()> {
    self.inner.store.clear_all()?;
    self.update_state(|s| {
      s.pending_mutations = 0;
      s.last_synced_at = None;
      s.sync_status = SyncStatus::Idle;
      s.error_message = None;
    });
    info!("Local cache cleared");
    Ok(())
  }

  // ==========================================================================
  // Sync
  // ==========================================================================

  pub async fn sync_now(&self) -> Result<SyncReport> {
    self.sync(SyncTrigger::Manual).await
  }

  pub async fn sync(&self, trigger: SyncTrigger) -> Result<SyncReport> {
    if !self.is_online() {
      info!(trigger = trigger.as_str(), "Offline, sync skipped");
      return Ok(SyncReport::skipped(trigger, SkipReason::Offline));
    }
    if self.inner.syncing.swap(true, Ordering::SeqCst) {
      debug!(trigger = trigger.as_str(), "Sync already running");
      return Ok(SyncReport::skipped(trigger, SkipReason::AlreadySyncing));
    }
    let _flag = SyncingFlag(&self.inner.syncing);

    self.update_state(|s| {
      s.is_syncing = true;
      s.sync_status = SyncStatus::Syncing;
      s.error_message = None;
    });
    info!(trigger = trigger.as_str(), "Sync started");

    let result = self.run(trigger).await;

    match &result {
      Ok(report) => {
        let finished_at = Utc::now();
        let clean = report.push_error.is_none();
        if clean {
          if let Err(e) = self
            .inner
            .store
            .set_meta(LAST_SYNCED_AT, &finished_at.to_rfc3339())
          {
            warn!("Failed to persist last sync time: {}", e);
          }
        }

        self.update_state(|s| {
          s.is_syncing = false;
          s.pending_mutations = report.remaining;
          if clean {
            s.sync_status = SyncStatus::Idle;
            s.error_message = None;
            s.last_synced_at = Some(finished_at);
          } else {
            s.sync_status = SyncStatus::Error;
            s.error_message = report.push_error.clone();
          }
        });

        info!(
          trigger = trigger.as_str(),
          pushed = report.pushed,
          remaining = report.remaining,
          "Sync finished"
        );
      }
      Err(e) => {
        error!(trigger = trigger.as_str(), "Sync failed: {}", e);
        let message = e.to_string();
        self.update_state(|s| {
          s.is_syncing = false;
          s.sync_status = SyncStatus::Error;
          s.error_message = Some(message);
        });
      }
    }

    result
  }

  async fn run(&self, trigger: SyncTrigger) -> Result<SyncReport> {
    let pull = if trigger.pulls() {
      Some(self.pull_all().await)
    } else {
      None
    };
    let push = self.push_pending(trigger.honors_backoff()).await?;

    Ok(SyncReport {
      trigger,
      skipped: None,
      pull,
      pushed: push.pushed,
      push_error: push.halted,
      remaining: self.inner.queue.len()?,
    })
  }

  /// Refresh every independent table. Failures are isolated per table.
  pub async fn pull_all(&self) -> FetchSummary {
    let api = self.inner.api.as_ref();
    let store = self.inner.store.as_ref();
    let params = ListParams::new();
    let user_id = self.user_id();

    let (projects, beneficiaries, templates, submissions, users, services, user_projects) = tokio::join!(
      pull_table::<Project>(api, store, endpoints::PROJECTS, &params),
      pull_table::<Beneficiary>(api, store, endpoints::BENEFICIARIES, &params),
      pull_table::<FormTemplate>(api, store, endpoints::FORM_TEMPLATES, &params),
      pull_table::<FormSubmission>(api, store, endpoints::FORM_RESPONSES, &params),
      pull_table::<User>(api, store, endpoints::USERS, &params),
      pull_table::<Service>(api, store, endpoints::SERVICES, &params),
      async {
        match user_id.as_deref() {
          Some(user_id) => Some(pull_user_projects(api, store, user_id).await),
          None => None,
        }
      },
    );

    let mut summary = FetchSummary::new();
    summary.record(Table::Projects.name(), projects);
    summary.record(Table::Beneficiaries.name(), beneficiaries);
    summary.record(Table::FormTemplates.name(), templates);
    summary.record(Table::FormSubmissions.name(), submissions);
    summary.record(Table::Users.name(), users);
    summary.record(Table::Services.name(), services);
    if let Some(user_projects) = user_projects {
      summary.record("userProjects", user_projects);
    }

    info!(
      success = summary.total.success,
      failed = summary.total.failed,
      cached = summary.total.total_cached,
      "Pull finished"
    );
    summary
  }

  /// Replay queued mutations oldest first, stopping at the first one that
  /// cannot be sent.
  async fn push_pending(&self, honor_backoff: bool) -> Result<PushOutcome> {
    let mut outcome = PushOutcome::default();

    // Re-read the head each round: acknowledging a create can re-point later entries
    while let Some(mutation) = self.inner.queue.peek()? {
      if mutation.status == MutationStatus::NeedsResolution {
        outcome.halted = Some(format!(
          "Mutation {} needs manual resolution: {}",
          mutation.id,
          mutation.last_error.as_deref().unwrap_or("unknown error")
        ));
        break;
      }

      if honor_backoff && !mutation.is_due(Utc::now()) {
        outcome.halted = Some(format!(
          "Waiting to retry {} {} {}: {}",
          mutation.operation.as_str(),
          mutation.entity_type,
          mutation.entity_id,
          mutation.last_error.as_deref().unwrap_or("previous attempt failed")
        ));
        break;
      }

      debug!(
        mutation_id = %mutation.id,
        method = mutation.method.as_str(),
        endpoint = %mutation.endpoint,
        "Pushing mutation"
      );

      match self
        .inner
        .api
        .send(mutation.method, &mutation.endpoint, &mutation.payload)
        .await
      {
        Ok(response) => {
          self.acknowledge(&mutation, response)?;
          outcome.pushed += 1;
          self.refresh_pending()?;
        }
        Err(e) => {
          let failed = self.inner.queue.record_failure(&mutation, &e.to_string())?;
          warn!(
            mutation_id = %failed.id,
            retries = failed.retry_count,
            "Mutation push failed: {}",
            e
          );
          outcome.halted = Some(format!(
            "Failed to {} {} {}: {}",
            mutation.operation.as_str(),
            mutation.entity_type,
            mutation.entity_id,
            e
          ));
          break;
        }
      }
    }

    Ok(outcome)
  }

  fn acknowledge(&self, mutation: &PendingMutation, response: Value) -> Result<()> {
    let store = &self.inner.store;
    let table = mutation.entity_type;
    self.inner.queue.acknowledge(&mutation.id)?;

    if mutation.operation == Operation::Delete {
      store.delete(table, &mutation.entity_id)?;
      return Ok(());
    }

    let mut server = match response {
      Value::Object(_) => Some(response),
      _ => None,
    };
    if let Some(document) = server.as_mut() {
      strip_offline_fields(document);
    }

    let mut entity_id = mutation.entity_id.clone();
    if mutation.operation == Operation::Create {
      if let Some(server_id) = server.as_ref().and_then(record_id) {
        if server_id != entity_id {
          self.adopt_server_id(table, &entity_id, &server_id)?;
          entity_id = server_id;
        }
      }
    }

    // A later write to the same record keeps it unsynced
    if self.inner.queue.has_pending_for(table, &entity_id)? {
      return Ok(());
    }

    let mut data = match (store.get(table, &entity_id)?, server) {
      (Some(local), Some(server)) => {
        let mut data = local.data;
        overlay(&mut data, &server);
        data
      }
      (None, Some(server)) => server,
      (Some(local), None) => local.data,
      (None, None) => return Ok(()),
    };

    if let Value::Object(map) = &mut data {
      map.insert("id".to_string(), Value::String(entity_id));
    }
    store.put(table, &CachedRecord::synced(data))
  }

  /// Re-key a locally created record and the mutations that still target it.
  fn adopt_server_id(&self, table: Table, temp_id: &str, server_id: &str) -> Result<()> {
    let store = &self.inner.store;
    if let Some(mut record) = store.get(table, temp_id)? {
      if let Value::Object(map) = &mut record.data {
        map.insert("id".to_string(), Value::String(server_id.to_string()));
      }
      store.put(table, &record)?;
      store.delete(table, temp_id)?;
    }

    let moved = self.inner.queue.reassign_entity(table, temp_id, server_id)?;
    info!(%table, temp_id, server_id, moved, "Adopted server id");
    Ok(())
  }
}

/// Shallow merge of `patch`'s keys into `base`.
fn overlay(base: &mut Value, patch: &Value) {
  match (base, patch) {
    (Value::Object(base), Value::Object(patch)) => {
      for (key, value) in patch {
        base.insert(key.clone(), value.clone());
      }
    }
    (base, patch) => *base = patch.clone(),
  }
}

async fn interval_loop(inner: Weak<Inner>, interval: Duration) {
  let mut ticker = tokio::time::interval(interval);
  // The first tick completes immediately
  ticker.tick().await;

  loop {
    ticker.tick().await;
    let Some(inner) = inner.upgrade() else {
      return;
    };
    let orchestrator = SyncOrchestrator { inner };
    if !orchestrator.is_online() {
      continue;
    }
    if let Err(e) = orchestrator.sync(SyncTrigger::Interval).await {
      warn!("Periodic sync failed: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::mock::MockApi;
  use crate::api::{endpoints, HttpMethod};
  use crate::preload::DataPreloader;
  use crate::queue::RetryPolicy;
  use crate::store::{NoopStore, SqliteStore};
  use serde_json::json;

  struct Harness {
    api: Arc<MockApi>,
    store: Arc<dyn LocalStore>,
    monitor: ConnectivityMonitor,
    orchestrator: SyncOrchestrator,
  }

  fn harness_with(online: bool, policy: RetryPolicy) -> Harness {
    let api = Arc::new(MockApi::new());
    let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let monitor = ConnectivityMonitor::new(online, Duration::ZERO);
    let queue = MutationQueue::new(store.clone(), policy);
    let orchestrator = SyncOrchestrator::new(store.clone(), api.clone(), queue, monitor.clone());
    Harness {
      api,
      store,
      monitor,
      orchestrator,
    }
  }

  fn harness(online: bool) -> Harness {
    harness_with(online, RetryPolicy::default())
  }

  fn update(id: &str, name: &str) -> MutationDescriptor {
    MutationDescriptor::update(
      Table::Beneficiaries,
      id,
      json!({ "name": name }),
      &format!("/beneficiaries/{}", id),
    )
  }

  #[tokio::test]
  async fn test_offline_write_then_sync_acknowledges() {
    let h = harness(false);
    let descriptor = MutationDescriptor::create(
      Table::FormSubmissions,
      "temp-1",
      json!({"templateId": "t1", "entityId": "e1", "entityType": "activity", "data": {"q": 1}}),
      endpoints::FORM_RESPONSES,
    );
    h.orchestrator.queue_mutation(descriptor).unwrap();

    let row = h.store.get(Table::FormSubmissions, "temp-1").unwrap().unwrap();
    assert!(!row.synced);
    assert_eq!(h.orchestrator.get_state().pending_mutations, 1);

    h.monitor.set_online(true);
    let report = h.orchestrator.sync_now().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.remaining, 0);

    let row = h.store.get(Table::FormSubmissions, "temp-1").unwrap().unwrap();
    assert!(row.synced);
    let state = h.orchestrator.get_state();
    assert_eq!(state.pending_mutations, 0);
    assert_eq!(state.sync_status, SyncStatus::Idle);
    assert!(state.last_synced_at.is_some());
    assert!(h.store.get_meta(LAST_SYNCED_AT).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_counter_tracks_queue_and_stops_at_first_failure() {
    let h = harness(false);
    for (i, id) in ["b1", "b2", "b3"].iter().enumerate() {
      h.orchestrator.queue_mutation(update(id, "x")).unwrap();
      assert_eq!(h.orchestrator.get_state().pending_mutations, i + 1);
      assert_eq!(h.orchestrator.queue().len().unwrap(), i + 1);
    }

    h.api.fail("/beneficiaries/b2");
    h.monitor.set_online(true);
    let report = h.orchestrator.sync_now().await.unwrap();

    assert_eq!(report.pushed, 1);
    assert_eq!(report.remaining, 2);
    let sent: Vec<_> = h.api.sent().into_iter().map(|(_, e, _)| e).collect();
    assert_eq!(sent, vec!["/beneficiaries/b1".to_string()]);

    let state = h.orchestrator.get_state();
    assert_eq!(state.pending_mutations, 2);
    assert_eq!(state.sync_status, SyncStatus::Error);
    assert!(state.error_message.unwrap().contains("b2"));

    let head = h.orchestrator.queue().peek().unwrap().unwrap();
    assert_eq!(head.entity_id, "b2");
    assert_eq!(head.retry_count, 1);
  }

  #[tokio::test]
  async fn test_automatic_sync_respects_backoff() {
    let h = harness(false);
    h.orchestrator.queue_mutation(update("b1", "x")).unwrap();
    h.api.fail("/beneficiaries/b1");
    h.monitor.set_online(true);
    h.orchestrator.sync_now().await.unwrap();

    h.api.heal("/beneficiaries/b1");
    let report = h.orchestrator.sync(SyncTrigger::Reconnected).await.unwrap();
    assert_eq!(report.pushed, 0);
    assert!(report.push_error.unwrap().starts_with("Waiting to retry"));

    let report = h.orchestrator.sync_now().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.remaining, 0);
  }

  #[tokio::test]
  async fn test_exhausted_mutation_blocks_until_retried() {
    let policy = RetryPolicy {
      max_retries: 1,
      ..RetryPolicy::default()
    };
    let h = harness_with(false, policy);
    let mutation = h.orchestrator.queue_mutation(update("b1", "x")).unwrap();
    h.orchestrator.queue_mutation(update("b2", "y")).unwrap();
    h.api.fail("/beneficiaries/b1");
    h.monitor.set_online(true);
    h.orchestrator.sync_now().await.unwrap();

    h.api.heal("/beneficiaries/b1");
    let report = h.orchestrator.sync_now().await.unwrap();
    assert_eq!(report.pushed, 0);
    assert!(report.push_error.unwrap().contains("manual resolution"));

    assert!(h.orchestrator.retry_mutation(&mutation.id).unwrap());
    let report = h.orchestrator.sync_now().await.unwrap();
    assert_eq!(report.pushed, 2);
    assert_eq!(h.orchestrator.get_state().sync_status, SyncStatus::Idle);
  }

  #[tokio::test]
  async fn test_discard_unblocks_queue() {
    let policy = RetryPolicy {
      max_retries: 1,
      ..RetryPolicy::default()
    };
    let h = harness_with(false, policy);
    let stuck = h.orchestrator.queue_mutation(update("b1", "x")).unwrap();
    h.orchestrator.queue_mutation(update("b2", "y")).unwrap();
    h.api.fail("/beneficiaries/b1");
    h.monitor.set_online(true);
    h.orchestrator.sync_now().await.unwrap();

    assert!(h.orchestrator.discard_mutation(&stuck.id).unwrap());
    assert_eq!(h.orchestrator.get_state().pending_mutations, 1);
    let report = h.orchestrator.sync_now().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.remaining, 0);
  }

  #[tokio::test]
  async fn test_server_id_is_adopted() {
    let h = harness(false);
    h.orchestrator
      .queue_mutation(MutationDescriptor::create(
        Table::FormSubmissions,
        "temp-1",
        json!({"templateId": "t1", "entityId": "e1", "entityType": "activity", "data": {}}),
        endpoints::FORM_RESPONSES,
      ))
      .unwrap();
    h.orchestrator
      .queue_mutation(MutationDescriptor::update(
        Table::FormSubmissions,
        "temp-1",
        json!({"data": {"q": 2}}),
        "/forms/responses/temp-1",
      ))
      .unwrap();
    h.api.respond_write(
      endpoints::FORM_RESPONSES,
      json!({"id": "srv-9", "templateId": "t1", "entityId": "e1", "entityType": "activity"}),
    );

    h.monitor.set_online(true);
    let report = h.orchestrator.sync_now().await.unwrap();
    assert_eq!(report.pushed, 2);

    let sent = h.api.sent();
    assert_eq!(sent[0].0, HttpMethod::Post);
    assert_eq!(sent[1].1, "/forms/responses/srv-9");

    assert!(h.store.get(Table::FormSubmissions, "temp-1").unwrap().is_none());
    let row = h.store.get(Table::FormSubmissions, "srv-9").unwrap().unwrap();
    assert!(row.synced);
    assert_eq!(row.data["id"], "srv-9");
    assert_eq!(row.data["data"]["q"], 2);
  }

  #[tokio::test]
  async fn test_pull_failures_are_isolated() {
    let h = harness(true);
    h.orchestrator.set_user(Some("u1".into()));
    h.api
      .respond(endpoints::PROJECTS, json!([{"id": 1, "name": "A"}, {"id": 2, "name": "B"}]))
      .respond(endpoints::BENEFICIARIES, json!([{"id": "b1"}]))
      .respond(endpoints::FORM_TEMPLATES, json!([{"id": "t1", "name": "Intake"}]))
      .respond(endpoints::SERVICES, json!([{"id": "s1", "name": "Food"}]))
      .respond("/users/u1/projects", json!([{"id": 3, "name": "C"}]))
      .fail(endpoints::USERS);

    let summary = h.orchestrator.pull_all().await;
    assert_eq!(summary.steps.len(), 7);
    assert_eq!(summary.total.failed, 1);
    assert_eq!(summary.total.success, 6);
    assert!(!summary.get("users").unwrap().success);

    assert_eq!(h.store.count(Table::Projects).unwrap(), 3);
    assert_eq!(h.store.count(Table::Beneficiaries).unwrap(), 1);
    assert_eq!(h.store.count(Table::ProjectUsers).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_sync_refused_offline() {
    let h = harness(false);
    let report = h.orchestrator.sync_now().await.unwrap();
    assert_eq!(report.skipped, Some(SkipReason::Offline));
    assert!(h.api.calls().is_empty());
    assert_eq!(h.orchestrator.get_state().sync_status, SyncStatus::Idle);
  }

  #[tokio::test]
  async fn test_overlapping_sync_is_dropped() {
    let h = harness(true);
    h.api.set_delay(Duration::from_millis(50));

    let (first, second) = tokio::join!(
      h.orchestrator.sync_now(),
      async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.orchestrator.sync(SyncTrigger::Interval).await
      }
    );

    assert!(first.unwrap().ran());
    assert_eq!(second.unwrap().skipped, Some(SkipReason::AlreadySyncing));
    assert!(!h.orchestrator.get_state().is_syncing);
  }

  #[tokio::test]
  async fn test_subscribers_see_sync_transitions() {
    let h = harness(true);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let _ = h.orchestrator.subscribe(move |state| {
      seen_clone.lock().unwrap().push(state.sync_status);
    });

    h.orchestrator.sync_now().await.unwrap();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.first(), Some(&SyncStatus::Syncing));
    assert_eq!(seen.last(), Some(&SyncStatus::Idle));
  }

  #[tokio::test]
  async fn test_reconnect_triggers_background_sync() {
    let h = harness(false);
    h.orchestrator.init(None).unwrap();
    h.orchestrator.queue_mutation(update("b1", "x")).unwrap();

    h.monitor.set_online(true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.api.sent().len(), 1);
    let state = h.orchestrator.get_state();
    assert!(state.is_online);
    assert_eq!(state.pending_mutations, 0);
    h.orchestrator.dispose();
  }

  #[tokio::test]
  async fn test_clear_cache_resets_everything() {
    let h = harness(false);
    h.orchestrator.queue_mutation(update("b1", "x")).unwrap();
    h.orchestrator.clear_cache().unwrap();

    for table in Table::ALL {
      assert_eq!(h.store.count(table).unwrap(), 0);
    }
    assert_eq!(h.orchestrator.queue().len().unwrap(), 0);
    assert_eq!(h.orchestrator.get_state().pending_mutations, 0);
  }

  #[tokio::test]
  async fn test_clear_cache_forgets_preloaded_data() {
    let h = harness(true);
    h.api
      .respond(endpoints::PROJECTS, json!([{"id": "p1", "name": "Water"}]))
      .respond(endpoints::FORM_TEMPLATES, json!([{"id": "t1", "name": "Intake"}]));
    let preloader = DataPreloader::new(h.store.clone(), h.api.clone());
    preloader.preload_all_data(None).await.unwrap();
    assert!(preloader.is_data_preloaded().unwrap());

    h.orchestrator.queue_mutation(update("b1", "x")).unwrap();
    h.orchestrator.clear_cache().unwrap();

    assert!(!preloader.is_data_preloaded().unwrap());
    for table in Table::ALL {
      assert_eq!(h.store.count(table).unwrap(), 0);
    }
    assert_eq!(h.store.count_mutations().unwrap(), 0);
  }

  #[test]
  fn test_noop_store_refuses_queueing() {
    let api = Arc::new(MockApi::new());
    let store: Arc<dyn LocalStore> = Arc::new(NoopStore);
    let monitor = ConnectivityMonitor::new(true, Duration::ZERO);
    let queue = MutationQueue::new(store.clone(), RetryPolicy::default());
    let orchestrator = SyncOrchestrator::new(store, api, queue, monitor);

    assert!(orchestrator.queue_mutation(update("b1", "x")).is_err());
  }

  #[test]
  fn test_update_merges_into_existing_row() {
    let h = harness(false);
    h.store
      .put(
        Table::Beneficiaries,
        &CachedRecord::synced(json!({"id": "b1", "name": "Old", "village": "Kisumu"})),
      )
      .unwrap();

    h.orchestrator.queue_mutation(update("b1", "New")).unwrap();
    let row = h.store.get(Table::Beneficiaries, "b1").unwrap().unwrap();
    assert!(!row.synced);
    assert_eq!(row.data["name"], "New");
    assert_eq!(row.data["village"], "Kisumu");
  }
}
