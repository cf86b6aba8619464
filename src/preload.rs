//! Bulk bootstrap of the local store.
//!
//! Top-level steps run concurrently. Subprojects wait for Projects and
//! Activities wait for Subprojects, each iterating whatever its parent step
//! left in the store. Progress is reported once per finished step.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::types::{
  Activity, Beneficiary, EntityService, FormTemplate, Project, Service, Subproject, User,
};
use crate::api::{endpoints, ListParams, RemoteApi};
use crate::notify::{Subscribers, Subscription};
use crate::store::{LocalStore, LocalStoreExt, Table};
use crate::sync::merge::parse_timestamp;
use crate::sync::pull::{pull_children, pull_subproject_users, pull_table, pull_user_projects};
use crate::sync::{FetchOutcome, FetchSummary, LAST_SYNCED_AT};

pub const LAST_PRELOADED_AT: &str = "lastPreloadedAt";

/// Per-parent fetches in flight at once within a dependent step.
const PARALLEL_FETCHES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PreloadStep {
  Projects,
  Subprojects,
  Activities,
  Beneficiaries,
  FormTemplates,
  UserData,
}

impl PreloadStep {
  pub fn label(&self) -> &'static str {
    match self {
      PreloadStep::Projects => "Projects",
      PreloadStep::Subprojects => "Subprojects",
      PreloadStep::Activities => "Activities",
      PreloadStep::Beneficiaries => "Beneficiaries",
      PreloadStep::FormTemplates => "Form templates",
      PreloadStep::UserData => "User data",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadProgress {
  pub total: usize,
  pub completed: usize,
  pub current: String,
  pub percentage: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
  /// Row count of every persisted table, control tables included
  pub tables: BTreeMap<String, usize>,
  pub last_preloaded_at: Option<DateTime<Utc>>,
  pub last_synced_at: Option<DateTime<Utc>>,
}

impl CacheStats {
  pub fn count(&self, table: &str) -> usize {
    self.tables.get(table).copied().unwrap_or(0)
  }
}

struct ProgressTracker<'a> {
  total: usize,
  completed: AtomicUsize,
  subscribers: &'a Subscribers<PreloadProgress>,
}

impl ProgressTracker<'_> {
  fn finish(&self, step: PreloadStep) {
    let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
    let progress = PreloadProgress {
      total: self.total,
      completed,
      current: step.label().to_string(),
      percentage: ((completed * 100) / self.total.max(1)) as u8,
    };
    info!(
      step = step.label(),
      completed,
      total = self.total,
      "Preload step finished"
    );
    self.subscribers.notify(&progress);
  }
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

pub struct DataPreloader {
  store: Arc<dyn LocalStore>,
  api: Arc<dyn RemoteApi>,
  progress: Arc<Subscribers<PreloadProgress>>,
  running: AtomicBool,
}

impl DataPreloader {
  pub fn new(store: Arc<dyn LocalStore>, api: Arc<dyn RemoteApi>) -> Self {
    Self {
      store,
      api,
      progress: Subscribers::new(),
      running: AtomicBool::new(false),
    }
  }

  pub fn subscribe_to_progress<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&PreloadProgress) + Send + Sync + 'static,
  {
    self.progress.subscribe(callback)
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  /// Fill the store from the API. Safe to repeat: rows are upserted by id.
  pub async fn preload_all_data(&self, user_id: Option<&str>) -> Result<FetchSummary> {
    let _flag = self.acquire()?;
    self.run(user_id).await
  }

  /// Drop every cached entity, then preload again. Queued mutations and
  /// cached credentials are kept.
  pub async fn force_refresh(&self, user_id: Option<&str>) -> Result<FetchSummary> {
    let _flag = self.acquire()?;
    self.store.clear_entities()?;
    info!("Cleared cached entities for a full refresh");
    self.run(user_id).await
  }

  /// Projects and form templates are both cached.
  pub fn is_data_preloaded(&self) -> Result<bool> {
    Ok(self.store.count(Table::Projects)? > 0 && self.store.count(Table::FormTemplates)? > 0)
  }

  pub fn get_stats(&self) -> Result<CacheStats> {
    let mut tables = BTreeMap::new();
    for table in Table::ALL {
      tables.insert(table.name().to_string(), self.store.count(table)?);
    }
    tables.insert("pendingMutations".to_string(), self.store.count_mutations()?);
    tables.insert("authCache".to_string(), self.store.count_auth()?);

    Ok(CacheStats {
      tables,
      last_preloaded_at: self.meta_timestamp(LAST_PRELOADED_AT)?,
      last_synced_at: self.meta_timestamp(LAST_SYNCED_AT)?,
    })
  }

  fn meta_timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
    Ok(self.store.get_meta(key)?.and_then(|s| parse_timestamp(&s)))
  }

  fn acquire(&self) -> Result<RunningFlag<'_>> {
    if !self.store.is_persistent() {
      return Err(eyre!("Offline storage is unavailable, nothing to preload into"));
    }
    if self.running.swap(true, Ordering::SeqCst) {
      return Err(eyre!("A preload is already running"));
    }
    Ok(RunningFlag(&self.running))
  }

  async fn run(&self, user_id: Option<&str>) -> Result<FetchSummary> {
    let tracker = ProgressTracker {
      total: if user_id.is_some() { 6 } else { 5 },
      completed: AtomicUsize::new(0),
      subscribers: &self.progress,
    };
    let api = self.api.as_ref();
    let store = self.store.as_ref();
    let params = ListParams::new();
    info!(user_id = user_id.unwrap_or("-"), "Preloading offline data");

    let (hierarchy, beneficiaries, templates, user_data) = tokio::join!(
      self.load_hierarchy(&tracker),
      async {
        let result = pull_table::<Beneficiary>(api, store, endpoints::BENEFICIARIES, &params).await;
        tracker.finish(PreloadStep::Beneficiaries);
        result
      },
      async {
        let result = pull_table::<FormTemplate>(api, store, endpoints::FORM_TEMPLATES, &params).await;
        tracker.finish(PreloadStep::FormTemplates);
        result
      },
      async {
        match user_id {
          Some(user_id) => {
            let outcomes = self.load_user_data(user_id).await;
            tracker.finish(PreloadStep::UserData);
            outcomes
          }
          None => Vec::new(),
        }
      },
    );

    let mut summary = FetchSummary::new();
    for (step, outcome) in hierarchy {
      summary.record(step, outcome);
    }
    summary.record(Table::Beneficiaries.name(), beneficiaries);
    summary.record(Table::FormTemplates.name(), templates);
    for (step, outcome) in user_data {
      summary.record(step, outcome);
    }

    if let Err(e) = self.store.set_meta(LAST_PRELOADED_AT, &Utc::now().to_rfc3339()) {
      warn!("Failed to record preload time: {}", e);
    }

    info!(
      success = summary.total.success,
      failed = summary.total.failed,
      cached = summary.total.total_cached,
      "Preload finished"
    );
    Ok(summary)
  }

  /// Projects, then subprojects of every cached project, then activities and
  /// members of every cached subproject.
  async fn load_hierarchy(&self, tracker: &ProgressTracker<'_>) -> Vec<(&'static str, FetchOutcome)> {
    let api = self.api.as_ref();
    let store = self.store.as_ref();
    let mut outcomes = Vec::with_capacity(3);

    let projects = pull_table::<Project>(api, store, endpoints::PROJECTS, &ListParams::new()).await;
    outcomes.push((Table::Projects.name(), FetchOutcome::from(projects)));
    tracker.finish(PreloadStep::Projects);

    let project_ids = self.cached_ids::<Project>();
    let subprojects = fan_out(project_ids, |id| async move {
      pull_children::<Subproject>(
        api,
        store,
        &endpoints::project_subprojects(&id),
        "projectId",
        &id,
      )
      .await
    })
    .await;
    outcomes.push((Table::Subprojects.name(), subprojects));
    tracker.finish(PreloadStep::Subprojects);

    let subproject_ids = self.cached_ids::<Subproject>();
    let (activities, members) = tokio::join!(
      fan_out(subproject_ids.clone(), |id| async move {
        pull_children::<Activity>(
          api,
          store,
          &endpoints::subproject_activities(&id),
          "subprojectId",
          &id,
        )
        .await
      }),
      fan_out(subproject_ids, |id| async move {
        pull_subproject_users(api, store, &id).await
      }),
    );
    outcomes.push((Table::Activities.name(), activities));
    outcomes.push((Table::SubprojectUsers.name(), members));
    tracker.finish(PreloadStep::Activities);

    outcomes
  }

  async fn load_user_data(&self, user_id: &str) -> Vec<(&'static str, FetchOutcome)> {
    let api = self.api.as_ref();
    let store = self.store.as_ref();
    let params = ListParams::new();

    let (users, services, assignments, projects) = tokio::join!(
      pull_table::<User>(api, store, endpoints::USERS, &params),
      pull_table::<Service>(api, store, endpoints::SERVICES, &params),
      pull_table::<EntityService>(api, store, endpoints::SERVICE_ASSIGNMENTS, &params),
      pull_user_projects(api, store, user_id),
    );

    vec![
      (Table::Users.name(), users.into()),
      (Table::Services.name(), services.into()),
      (Table::EntityServices.name(), assignments.into()),
      ("userProjects", projects.into()),
    ]
  }

  fn cached_ids<T: crate::store::Cacheable>(&self) -> Vec<String> {
    match self.store.all_as::<T>() {
      Ok(items) => items.iter().map(|item| item.cache_key()).collect(),
      Err(e) => {
        warn!(table = %T::table(), "Failed to read cached parents: {}", e);
        Vec::new()
      }
    }
  }
}

/// Run one fetch per parent id and fold the results into a single outcome.
/// The step fails if any parent's fetch failed; rows from the others are kept.
async fn fan_out<F, Fut>(ids: Vec<String>, fetch: F) -> FetchOutcome
where
  F: Fn(String) -> Fut,
  Fut: std::future::Future<Output = Result<usize>>,
{
  let results: Vec<(String, Result<usize>)> = stream::iter(ids)
    .map(|id| {
      let fut = fetch(id.clone());
      async move { (id, fut.await) }
    })
    .buffer_unordered(PARALLEL_FETCHES)
    .collect()
    .await;

  let mut cached = 0;
  let mut errors = Vec::new();
  for (id, result) in results {
    match result {
      Ok(count) => cached += count,
      Err(e) => errors.push(format!("{}: {}", id, e)),
    }
  }

  if errors.is_empty() {
    FetchOutcome::ok(cached)
  } else {
    FetchOutcome::failed(cached, errors.join("; "))
  }
}
