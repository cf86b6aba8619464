//! Connectivity-aware routing of read commands.
//!
//! Each read command knows how to resolve itself against the API and against
//! the local store. The interceptor picks the resolver from the current
//! connectivity, so callers issue the same command either way.

pub mod commands;

use async_trait::async_trait;
use color_eyre::Result;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::api::RemoteApi;
use crate::connectivity::ConnectivityMonitor;
use crate::store::LocalStore;

/// Token identifying every read command the interceptor can short-circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
  ListProjects,
  ProjectTree,
  ListSubprojects,
  ListActivities,
  ListBeneficiaries,
  ListFormTemplates,
  GetFormTemplate,
  ListFormSubmissions,
  ListUsers,
  ListServices,
  UserProjects,
  SubprojectMembers,
  EntityServices,
}

impl CommandKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      CommandKind::ListProjects => "list_projects",
      CommandKind::ProjectTree => "project_tree",
      CommandKind::ListSubprojects => "list_subprojects",
      CommandKind::ListActivities => "list_activities",
      CommandKind::ListBeneficiaries => "list_beneficiaries",
      CommandKind::ListFormTemplates => "list_form_templates",
      CommandKind::GetFormTemplate => "get_form_template",
      CommandKind::ListFormSubmissions => "list_form_submissions",
      CommandKind::ListUsers => "list_users",
      CommandKind::ListServices => "list_services",
      CommandKind::UserProjects => "user_projects",
      CommandKind::SubprojectMembers => "subproject_members",
      CommandKind::EntityServices => "entity_services",
    }
  }
}

impl fmt::Display for CommandKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A read with one resolver per side of the network.
#[async_trait]
pub trait ReadCommand: Send + Sync {
  type Output: Send;

  fn kind(&self) -> CommandKind;

  async fn online(&self, api: &dyn RemoteApi) -> Result<Self::Output>;

  fn offline(&self, store: &dyn LocalStore) -> Result<Self::Output>;
}

/// Where a command's result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Source {
  Network,
  Local,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
  pub data: T,
  pub source: Source,
}

impl<T> Resolved<T> {
  pub fn into_inner(self) -> T {
    self.data
  }
}

pub struct ActionInterceptor {
  store: Arc<dyn LocalStore>,
  api: Arc<dyn RemoteApi>,
  monitor: ConnectivityMonitor,
}

impl ActionInterceptor {
  pub fn new(store: Arc<dyn LocalStore>, api: Arc<dyn RemoteApi>, monitor: ConnectivityMonitor) -> Self {
    Self {
      store,
      api,
      monitor,
    }
  }

  pub async fn dispatch<C: ReadCommand>(&self, command: &C) -> Result<Resolved<C::Output>> {
    if self.monitor.is_online() {
      let data = command.online(self.api.as_ref()).await?;
      return Ok(Resolved {
        data,
        source: Source::Network,
      });
    }

    debug!(command = %command.kind(), "Offline, resolving from local store");
    let data = command.offline(self.store.as_ref())?;
    Ok(Resolved {
      data,
      source: Source::Local,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::commands::{EntityServices, ListProjects, ProjectTree, SubprojectMembers};
  use super::*;
  use crate::api::mock::MockApi;
  use crate::api::types::{EntityService, Project, Service, SubprojectUser, User};
  use crate::api::endpoints;
  use crate::store::{CachedRecord, LocalStoreExt, SqliteStore, Table};
  use serde_json::json;
  use std::time::Duration;

  fn interceptor(online: bool) -> (Arc<MockApi>, Arc<dyn LocalStore>, ConnectivityMonitor, ActionInterceptor) {
    let api = Arc::new(MockApi::new());
    let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let monitor = ConnectivityMonitor::new(online, Duration::ZERO);
    let interceptor = ActionInterceptor::new(store.clone(), api.clone(), monitor.clone());
    (api, store, monitor, interceptor)
  }

  fn put(store: &dyn LocalStore, table: Table, doc: serde_json::Value) {
    store.put(table, &CachedRecord::synced(doc)).unwrap();
  }

  #[tokio::test]
  async fn test_same_command_routes_by_connectivity() {
    let (api, store, monitor, interceptor) = interceptor(true);
    api.respond(endpoints::PROJECTS, json!([{"id": "p1", "name": "Remote"}]));
    put(store.as_ref(), Table::Projects, json!({"id": "p9", "name": "Cached"}));

    let online = interceptor.dispatch(&ListProjects).await.unwrap();
    assert_eq!(online.source, Source::Network);
    assert_eq!(online.data[0].name, "Remote");
    // The network path leaves the store alone
    assert_eq!(store.count(Table::Projects).unwrap(), 1);

    monitor.set_online(false);
    let offline = interceptor.dispatch(&ListProjects).await.unwrap();
    assert_eq!(offline.source, Source::Local);
    assert_eq!(offline.data[0].name, "Cached");
    assert_eq!(api.call_count(endpoints::PROJECTS), 1);
  }

  #[tokio::test]
  async fn test_offline_project_tree_joins_three_tables() {
    let (_api, store, _monitor, interceptor) = interceptor(false);
    let store = store.as_ref();
    put(store, Table::Projects, json!({"id": "p1", "name": "Water"}));
    put(store, Table::Projects, json!({"id": "p2", "name": "Schools"}));
    put(store, Table::Subprojects, json!({"id": "s1", "projectId": "p1", "name": "North"}));
    put(store, Table::Subprojects, json!({"id": "s2", "projectId": "p1", "name": "South"}));
    put(store, Table::Activities, json!({"id": "a1", "subprojectId": "s2", "name": "Wells"}));

    let tree = interceptor
      .dispatch(&ProjectTree::default())
      .await
      .unwrap()
      .into_inner();

    assert_eq!(tree.len(), 2);
    let water = tree.iter().find(|n| n.project.id == "p1").unwrap();
    assert_eq!(water.subprojects.len(), 2);
    let south = water.subprojects.iter().find(|s| s.subproject.id == "s2").unwrap();
    assert_eq!(south.activities.len(), 1);
    assert!(tree.iter().find(|n| n.project.id == "p2").unwrap().subprojects.is_empty());

    let only = interceptor
      .dispatch(&ProjectTree::for_project("p2"))
      .await
      .unwrap()
      .into_inner();
    assert_eq!(only.len(), 1);
  }

  #[tokio::test]
  async fn test_online_project_tree_walks_endpoints() {
    let (api, _store, _monitor, interceptor) = interceptor(true);
    api
      .respond(endpoints::PROJECTS, json!([{"id": "p1", "name": "Water"}]))
      .respond("/projects/p1/subprojects", json!([{"id": "s1", "name": "North"}]))
      .respond("/activities/subproject/s1", json!([{"id": "a1", "name": "Wells"}]));

    let tree = interceptor.dispatch(&ProjectTree::default()).await.unwrap().into_inner();
    assert_eq!(tree[0].subprojects[0].activities[0].id, "a1");
    assert_eq!(tree[0].subprojects[0].subproject.project_id, "p1");
  }

  #[tokio::test]
  async fn test_offline_members_join_users() {
    let (_api, store, _monitor, interceptor) = interceptor(false);
    store
      .put_synced(&serde_json::from_value::<User>(json!({"id": "u1", "email": "ana@x.org"})).unwrap())
      .unwrap();
    store
      .put_synced(&serde_json::from_value::<User>(json!({"id": "u2"})).unwrap())
      .unwrap();
    store.put_synced(&SubprojectUser::new("s1", "u1")).unwrap();

    let members = interceptor
      .dispatch(&SubprojectMembers::new("s1"))
      .await
      .unwrap()
      .into_inner();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].email.as_deref(), Some("ana@x.org"));
  }

  #[tokio::test]
  async fn test_offline_entity_services_join_services() {
    let (_api, store, _monitor, interceptor) = interceptor(false);
    for (id, name) in [("sv1", "Food"), ("sv2", "Health")] {
      store
        .put_synced(&serde_json::from_value::<Service>(json!({"id": id, "name": name})).unwrap())
        .unwrap();
    }
    store
      .put_synced(
        &serde_json::from_value::<EntityService>(
          json!({"id": "es1", "entityId": "a1", "serviceId": "sv2"}),
        )
        .unwrap(),
      )
      .unwrap();

    let services = interceptor
      .dispatch(&EntityServices::new("a1"))
      .await
      .unwrap()
      .into_inner();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].name, "Health");
  }

  #[tokio::test]
  async fn test_online_errors_are_not_masked() {
    let (api, store, _monitor, interceptor) = interceptor(true);
    store.put_synced(&serde_json::from_value::<Project>(json!({"id": "p1", "name": "A"})).unwrap()).unwrap();
    api.fail(endpoints::PROJECTS);

    assert!(interceptor.dispatch(&ListProjects).await.is_err());
  }
}
