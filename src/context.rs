//! Wiring of the offline layer's services around one store and one API client.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{ApiClient, RemoteApi};
use crate::auth::{Authenticator, OfflineAuthCache};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::intercept::ActionInterceptor;
use crate::preload::DataPreloader;
use crate::queue::MutationQueue;
use crate::reader::CacheReader;
use crate::store::{LocalStore, NoopStore, SqliteStore};
use crate::sync::{FetchSummary, SyncOrchestrator, SyncTrigger};

pub struct AppContext {
  pub config: Config,
  pub store: Arc<dyn LocalStore>,
  pub api: Arc<dyn RemoteApi>,
  pub monitor: ConnectivityMonitor,
  pub orchestrator: SyncOrchestrator,
  pub preloader: DataPreloader,
  pub reader: CacheReader,
  pub interceptor: ActionInterceptor,
  pub auth: Authenticator,
  client: ApiClient,
  force_offline: bool,
}

impl AppContext {
  /// Build every service. When the database cannot be opened the layer runs
  /// online-only on a no-op store.
  pub fn build(config: Config, force_offline: bool) -> Result<Self> {
    let store: Arc<dyn LocalStore> = match SqliteStore::open(config.storage.path.as_deref()) {
      Ok(store) => Arc::new(store),
      Err(e) => {
        warn!("Local store unavailable, running online-only: {}", e);
        Arc::new(NoopStore)
      }
    };

    let client = ApiClient::new(&config)?;
    Ok(Self::assemble(config, store, client, force_offline))
  }

  fn assemble(config: Config, store: Arc<dyn LocalStore>, client: ApiClient, force_offline: bool) -> Self {
    let api: Arc<dyn RemoteApi> = Arc::new(client.clone());
    let monitor = ConnectivityMonitor::new(false, config.sync.debounce());

    let queue = MutationQueue::new(store.clone(), config.sync.retry);
    let orchestrator = SyncOrchestrator::new(store.clone(), api.clone(), queue, monitor.clone());
    orchestrator.set_user(config.user_id.clone());

    let preloader = DataPreloader::new(store.clone(), api.clone());
    let reader = CacheReader::new(store.clone(), api.clone(), monitor.clone(), orchestrator.clone());
    let interceptor = ActionInterceptor::new(store.clone(), api.clone(), monitor.clone());
    let auth = Authenticator::new(api.clone(), OfflineAuthCache::new(store.clone()), monitor.clone());

    Self {
      config,
      store,
      api,
      monitor,
      orchestrator,
      preloader,
      reader,
      interceptor,
      auth,
      client,
      force_offline,
    }
  }

  /// Detect the initial connectivity, start the monitor and the orchestrator.
  /// With `force_offline` nothing is checked and the layer stays offline.
  pub async fn init(&self) -> Result<()> {
    if !self.force_offline {
      let reachable = self.client.is_reachable().await;
      self.monitor.set_online(reachable);
      self.monitor.start();
      self
        .monitor
        .spawn_health_check(self.client.clone(), self.config.sync.health_check_interval());
    }

    self.orchestrator.init(self.config.sync.auto_sync_interval())?;

    info!(
      api = %self.client.base_url(),
      online = self.monitor.is_online(),
      persistent = self.store.is_persistent(),
      "Offline layer ready"
    );
    Ok(())
  }

  pub fn user_id(&self) -> Option<String> {
    self.orchestrator.user_id()
  }

  /// Preload for `user_id` (or the configured user), then drain whatever was
  /// queued before the preload finished.
  pub async fn preload_all_data(&self, user_id: Option<&str>) -> Result<FetchSummary> {
    let user_id = user_id.map(str::to_string).or_else(|| self.user_id());
    let summary = self.preloader.preload_all_data(user_id.as_deref()).await?;
    self.after_initial_load().await;
    Ok(summary)
  }

  /// Drop cached entities and preload again.
  pub async fn force_refresh(&self, user_id: Option<&str>) -> Result<FetchSummary> {
    let user_id = user_id.map(str::to_string).or_else(|| self.user_id());
    let summary = self.preloader.force_refresh(user_id.as_deref()).await?;
    self.after_initial_load().await;
    Ok(summary)
  }

  async fn after_initial_load(&self) {
    if let Err(e) = self.orchestrator.sync(SyncTrigger::InitialLoad).await {
      warn!("Failed to push pending writes after preload: {}", e);
    }
  }

  pub fn dispose(&self) {
    self.orchestrator.dispose();
    self.monitor.dispose();
  }
}

impl Drop for AppContext {
  fn drop(&mut self) {
    self.dispose();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::Table;

  fn config() -> Config {
    Config::from_yaml("api:\n  url: http://127.0.0.1:9/api\nuser_id: \"u1\"\nsync:\n  auto_sync_interval_secs: 0\n")
      .unwrap()
  }

  #[tokio::test]
  async fn test_forced_offline_context_serves_local_data() {
    let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let client = ApiClient::new(&config()).unwrap();
    let ctx = AppContext::assemble(config(), store.clone(), client, true);
    ctx.init().await.unwrap();

    assert!(!ctx.monitor.is_online());
    assert_eq!(ctx.user_id().as_deref(), Some("u1"));

    store
      .put(
        Table::Projects,
        &crate::store::CachedRecord::synced(serde_json::json!({"id": "p1", "name": "Water"})),
      )
      .unwrap();
    let projects = ctx.reader.get_projects().await.unwrap();
    assert_eq!(projects.len(), 1);

    let state = ctx.orchestrator.get_state();
    assert!(!state.is_online);
    assert_eq!(state.pending_mutations, 0);
  }

  #[tokio::test]
  async fn test_unopenable_database_falls_back_to_online_only() {
    let blocker = tempfile::NamedTempFile::new().unwrap();
    // A regular file where the database directory should go
    let db_path = blocker.path().join("fieldsync").join("offline.db");
    let mut config = config();
    config.storage.path = Some(db_path);

    let ctx = AppContext::build(config, true).unwrap();
    assert!(!ctx.store.is_persistent());

    ctx.init().await.unwrap();
    assert!(ctx.reader.get_projects().await.is_err());
  }
}
