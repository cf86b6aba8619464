//! Offline-first read path.
//!
//! Every getter answers from the local store without waiting for the network.
//! When online, the same scope is refreshed in the background and subscribers
//! hear about it once the fresh rows have landed. Without persistent storage
//! the getters fetch into a scratch in-memory store and answer from that.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::api::types::{
  Activity, Beneficiary, EntityService, FormSubmission, FormTemplate, NewFormResponse, Project,
  ProjectUser, Service, Subproject, User,
};
use crate::api::{endpoints, HttpMethod, ListParams, RemoteApi};
use crate::connectivity::ConnectivityMonitor;
use crate::notify::{Subscribers, Subscription};
use crate::queue::MutationDescriptor;
use crate::store::{decode, decode_all, Cacheable, LocalStore, LocalStoreExt, SqliteStore, Table};
use crate::sync::pull::{pull_children, pull_table, pull_user_projects};
use crate::sync::{FetchOutcome, SyncOrchestrator};

/// Published when a background refresh finishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshEvent {
  pub table: Table,
  pub scope: String,
  pub outcome: FetchOutcome,
}

/// A remote scope that can be re-fetched into the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Refresh {
  List {
    table: Table,
    endpoint: String,
    params: ListParams,
  },
  Children {
    table: Table,
    endpoint: String,
    parent_key: &'static str,
    parent_id: String,
  },
  UserProjects {
    user_id: String,
  },
}

impl Refresh {
  fn list(table: Table, endpoint: &str, params: &ListParams) -> Self {
    Refresh::List {
      table,
      endpoint: endpoint.to_string(),
      params: params.clone(),
    }
  }

  fn table(&self) -> Table {
    match self {
      Refresh::List { table, .. } | Refresh::Children { table, .. } => *table,
      Refresh::UserProjects { .. } => Table::Projects,
    }
  }

  fn scope(&self) -> String {
    match self {
      Refresh::List {
        endpoint, params, ..
      } if !params.is_empty() => {
        let query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{}?{}", endpoint, query.join("&"))
      }
      Refresh::List { endpoint, .. } | Refresh::Children { endpoint, .. } => endpoint.clone(),
      Refresh::UserProjects { user_id } => endpoints::user_projects(user_id),
    }
  }

  async fn run(&self, api: &dyn RemoteApi, store: &dyn LocalStore) -> Result<usize> {
    match self {
      Refresh::List {
        table,
        endpoint,
        params,
      } => pull_list(*table, api, store, endpoint, params).await,
      Refresh::Children {
        table,
        endpoint,
        parent_key,
        parent_id,
      } => match table {
        Table::Subprojects => {
          pull_children::<Subproject>(api, store, endpoint, parent_key, parent_id).await
        }
        Table::Activities => {
          pull_children::<Activity>(api, store, endpoint, parent_key, parent_id).await
        }
        other => Err(eyre!("{} is not a child table", other)),
      },
      Refresh::UserProjects { user_id } => pull_user_projects(api, store, user_id).await,
    }
  }
}

async fn pull_list(
  table: Table,
  api: &dyn RemoteApi,
  store: &dyn LocalStore,
  endpoint: &str,
  params: &ListParams,
) -> Result<usize> {
  match table {
    Table::Projects => pull_table::<Project>(api, store, endpoint, params).await,
    Table::Beneficiaries => pull_table::<Beneficiary>(api, store, endpoint, params).await,
    Table::FormTemplates => pull_table::<FormTemplate>(api, store, endpoint, params).await,
    Table::FormSubmissions => pull_table::<FormSubmission>(api, store, endpoint, params).await,
    Table::Users => pull_table::<User>(api, store, endpoint, params).await,
    Table::Services => pull_table::<Service>(api, store, endpoint, params).await,
    Table::EntityServices => pull_table::<EntityService>(api, store, endpoint, params).await,
    other => Err(eyre!("{} has no list endpoint", other)),
  }
}

/// Stored `T`s whose documents satisfy every filter in `params`.
pub(crate) fn read_filtered<T: Cacheable>(
  store: &dyn LocalStore,
  params: &ListParams,
) -> Result<Vec<T>> {
  let matching = store
    .all(T::table())?
    .into_iter()
    .filter(|record| params.matches(&record.data))
    .collect();
  Ok(decode_all(matching))
}

/// Projects a user is assigned to, joined through `projectUsers`.
pub(crate) fn read_user_projects(store: &dyn LocalStore, user_id: &str) -> Result<Vec<Project>> {
  let links: Vec<ProjectUser> = store.query(Table::ProjectUsers, "userId").equals_as(user_id)?;
  let ids: Vec<String> = links.into_iter().map(|link| link.project_id).collect();
  store.bulk_get_as(&ids)
}

pub struct CacheReader {
  store: Arc<dyn LocalStore>,
  api: Arc<dyn RemoteApi>,
  monitor: ConnectivityMonitor,
  orchestrator: SyncOrchestrator,
  subscribers: Arc<Subscribers<RefreshEvent>>,
  in_flight: Arc<Mutex<HashSet<Refresh>>>,
}

impl CacheReader {
  pub fn new(
    store: Arc<dyn LocalStore>,
    api: Arc<dyn RemoteApi>,
    monitor: ConnectivityMonitor,
    orchestrator: SyncOrchestrator,
  ) -> Self {
    Self {
      store,
      api,
      monitor,
      orchestrator,
      subscribers: Subscribers::new(),
      in_flight: Arc::new(Mutex::new(HashSet::new())),
    }
  }

  /// Be told when a background refresh has written fresh rows.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&RefreshEvent) + Send + Sync + 'static,
  {
    self.subscribers.subscribe(callback)
  }

  // ==========================================================================
  // Getters
  // ==========================================================================

  pub async fn get_projects(&self) -> Result<Vec<Project>> {
    let refresh = Refresh::list(Table::Projects, endpoints::PROJECTS, &ListParams::new());
    self.read(refresh, |store| store.all_as()).await
  }

  pub async fn get_subprojects(&self, project_id: &str) -> Result<Vec<Subproject>> {
    let refresh = Refresh::Children {
      table: Table::Subprojects,
      endpoint: endpoints::project_subprojects(project_id),
      parent_key: "projectId",
      parent_id: project_id.to_string(),
    };
    self
      .read(refresh, |store| {
        store
          .query(Table::Subprojects, "projectId")
          .equals_as(project_id)
      })
      .await
  }

  pub async fn get_activities(&self, subproject_id: &str) -> Result<Vec<Activity>> {
    let refresh = Refresh::Children {
      table: Table::Activities,
      endpoint: endpoints::subproject_activities(subproject_id),
      parent_key: "subprojectId",
      parent_id: subproject_id.to_string(),
    };
    self
      .read(refresh, |store| {
        store
          .query(Table::Activities, "subprojectId")
          .equals_as(subproject_id)
      })
      .await
  }

  pub async fn get_beneficiaries(&self, params: &ListParams) -> Result<Vec<Beneficiary>> {
    let refresh = Refresh::list(Table::Beneficiaries, endpoints::BENEFICIARIES, params);
    self.read(refresh, |store| read_filtered(store, params)).await
  }

  pub async fn get_form_templates(&self, params: &ListParams) -> Result<Vec<FormTemplate>> {
    let refresh = Refresh::list(Table::FormTemplates, endpoints::FORM_TEMPLATES, params);
    self.read(refresh, |store| read_filtered(store, params)).await
  }

  pub async fn get_form_submissions(&self, params: &ListParams) -> Result<Vec<FormSubmission>> {
    let refresh = Refresh::list(Table::FormSubmissions, endpoints::FORM_RESPONSES, params);
    self.read(refresh, |store| read_filtered(store, params)).await
  }

  pub async fn get_user_projects(&self, user_id: &str) -> Result<Vec<Project>> {
    let refresh = Refresh::UserProjects {
      user_id: user_id.to_string(),
    };
    self
      .read(refresh, |store| read_user_projects(store, user_id))
      .await
  }

  async fn read<T, F>(&self, refresh: Refresh, local: F) -> Result<Vec<T>>
  where
    F: Fn(&dyn LocalStore) -> Result<Vec<T>>,
  {
    if !self.store.is_persistent() {
      return self.read_through_network(&refresh, local).await;
    }

    let cached = local(self.store.as_ref())?;
    if self.monitor.is_online() {
      self.spawn_refresh(refresh);
    }
    Ok(cached)
  }

  /// Online-only mode: fetch the scope into a throwaway store and read it
  /// back with the same query.
  async fn read_through_network<T, F>(&self, refresh: &Refresh, local: F) -> Result<Vec<T>>
  where
    F: Fn(&dyn LocalStore) -> Result<Vec<T>>,
  {
    if !self.monitor.is_online() {
      return Err(eyre!(
        "Offline storage is unavailable and the device is offline; cannot read {}",
        refresh.table()
      ));
    }

    let scratch = SqliteStore::open_in_memory()?;
    refresh.run(self.api.as_ref(), &scratch).await?;
    local(&scratch)
  }

  fn spawn_refresh(&self, refresh: Refresh) {
    {
      let Ok(mut in_flight) = self.in_flight.lock() else {
        return;
      };
      if !in_flight.insert(refresh.clone()) {
        debug!(scope = %refresh.scope(), "Refresh already in flight");
        return;
      }
    }

    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      if let Ok(mut in_flight) = self.in_flight.lock() {
        in_flight.remove(&refresh);
      }
      return;
    };

    let api = self.api.clone();
    let store = self.store.clone();
    let subscribers = self.subscribers.clone();
    let in_flight = self.in_flight.clone();

    runtime.spawn(async move {
      let result = refresh.run(api.as_ref(), store.as_ref()).await;
      if let Ok(mut in_flight) = in_flight.lock() {
        in_flight.remove(&refresh);
      }

      let outcome = FetchOutcome::from(result);
      match &outcome.error {
        Some(error) => debug!(scope = %refresh.scope(), "Background refresh failed: {}", error),
        None => debug!(scope = %refresh.scope(), cached = outcome.cached, "Background refresh done"),
      }

      subscribers.notify(&RefreshEvent {
        table: refresh.table(),
        scope: refresh.scope(),
        outcome,
      });
    });
  }

  // ==========================================================================
  // Writers
  // ==========================================================================

  /// Record a form response locally under a temporary id and queue it for the
  /// server. Returns without touching the network.
  pub async fn submit_form_response(&self, response: NewFormResponse) -> Result<FormSubmission> {
    let mut payload = serde_json::to_value(&response)
      .map_err(|e| eyre!("Failed to serialize form response: {}", e))?;
    if let Value::Object(map) = &mut payload {
      map.insert(
        "submittedAt".to_string(),
        Value::String(Utc::now().to_rfc3339()),
      );
    }

    if !self.store.is_persistent() {
      return self.submit_online(payload).await;
    }

    let temp_id = format!("temp-{}", uuid::Uuid::new_v4());
    let mutation = self.orchestrator.queue_mutation(MutationDescriptor::create(
      Table::FormSubmissions,
      &temp_id,
      payload,
      endpoints::FORM_RESPONSES,
    ))?;
    info!(
      submission_id = %temp_id,
      mutation_id = %mutation.id,
      template_id = %response.template_id,
      "Form response saved locally"
    );

    self
      .store
      .get_as::<FormSubmission>(&temp_id)?
      .ok_or_else(|| eyre!("Form response {} vanished after saving", temp_id))
  }

  async fn submit_online(&self, payload: Value) -> Result<FormSubmission> {
    if !self.monitor.is_online() {
      return Err(eyre!(
        "Offline storage is unavailable; form responses can only be submitted online"
      ));
    }

    let mut created = self
      .api
      .send(HttpMethod::Post, endpoints::FORM_RESPONSES, &payload)
      .await?;
    if let (Value::Object(created), Value::Object(sent)) = (&mut created, &payload) {
      for (key, value) in sent {
        created.entry(key.clone()).or_insert_with(|| value.clone());
      }
    }
    decode(created)
  }
}
