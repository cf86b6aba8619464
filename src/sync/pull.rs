//! Fetch-and-merge helpers shared by the orchestrator, the preloader and the
//! background refresh of the read path.

use color_eyre::Result;
use serde_json::Value;

use super::merge::apply_server_records;
use crate::api::types::{AssignedProject, Project, ProjectUser, SubprojectUser, User};
use crate::api::{decode_items, endpoints, fetch_list, ListParams, RemoteApi};
use crate::store::{Cacheable, LocalStore};

/// Fetch a list endpoint and merge it into `T`'s table. Returns the number of
/// records written.
pub async fn pull_table<T: Cacheable>(
  api: &dyn RemoteApi,
  store: &dyn LocalStore,
  endpoint: &str,
  params: &ListParams,
) -> Result<usize> {
  let items: Vec<T> = fetch_list(api, endpoint, params).await?;
  Ok(apply_server_records(store, &items)?.written)
}

/// Fetch the children of one parent (subprojects of a project, activities of
/// a subproject). Children that omit the parent reference get it filled in.
pub async fn fetch_children<T: Cacheable>(
  api: &dyn RemoteApi,
  endpoint: &str,
  parent_key: &str,
  parent_id: &str,
) -> Result<Vec<T>> {
  let mut data = api.get(endpoint, &ListParams::new()).await?;
  let snake_key = snake_case(parent_key);
  if let Value::Array(items) = &mut data {
    for item in items.iter_mut() {
      if let Value::Object(map) = item {
        if !map.contains_key(parent_key) && !map.contains_key(&snake_key) {
          map.insert(parent_key.to_string(), Value::String(parent_id.to_string()));
        }
      }
    }
  }

  decode_items(data, T::table().name())
}

/// `fetch_children`, merged into `T`'s table.
pub async fn pull_children<T: Cacheable>(
  api: &dyn RemoteApi,
  store: &dyn LocalStore,
  endpoint: &str,
  parent_key: &str,
  parent_id: &str,
) -> Result<usize> {
  let items: Vec<T> = fetch_children(api, endpoint, parent_key, parent_id).await?;
  Ok(apply_server_records(store, &items)?.written)
}

/// Projects assigned to a user, as returned by the server.
pub async fn fetch_user_projects(
  api: &dyn RemoteApi,
  user_id: &str,
) -> Result<Vec<AssignedProject>> {
  let data = api
    .get(&endpoints::user_projects(user_id), &ListParams::new())
    .await?;
  decode_items(data, "user projects")
}

/// Projects assigned to a user, plus the `projectUsers` association rows.
pub async fn pull_user_projects(
  api: &dyn RemoteApi,
  store: &dyn LocalStore,
  user_id: &str,
) -> Result<usize> {
  let assigned = fetch_user_projects(api, user_id).await?;

  let links: Vec<ProjectUser> = assigned
    .iter()
    .map(|a| ProjectUser::new(&a.project.id, user_id, a.role.clone()))
    .collect();
  let projects: Vec<Project> = assigned.into_iter().map(|a| a.project).collect();

  let written = apply_server_records(store, &projects)?.written;
  apply_server_records(store, &links)?;
  Ok(written)
}

/// Members of a subproject: upserts the users and their `subprojectUsers`
/// association rows.
pub async fn pull_subproject_users(
  api: &dyn RemoteApi,
  store: &dyn LocalStore,
  subproject_id: &str,
) -> Result<usize> {
  let users: Vec<User> = fetch_list(
    api,
    &endpoints::subproject_users(subproject_id),
    &ListParams::new(),
  )
  .await?;

  let links: Vec<SubprojectUser> = users
    .iter()
    .map(|u| SubprojectUser::new(subproject_id, &u.cache_key()))
    .collect();

  apply_server_records(store, &users)?;
  Ok(apply_server_records(store, &links)?.written)
}

fn snake_case(key: &str) -> String {
  let mut out = String::with_capacity(key.len() + 2);
  for c in key.chars() {
    if c.is_ascii_uppercase() {
      out.push('_');
      out.push(c.to_ascii_lowercase());
    } else {
      out.push(c);
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::mock::MockApi;
  use crate::api::types::Subproject;
  use crate::store::{LocalStoreExt, SqliteStore, Table};
  use serde_json::json;

  #[tokio::test]
  async fn test_user_projects_fill_both_tables() {
    let api = MockApi::new();
    api.respond(
      "/users/u1/projects",
      json!([
        {"id": "p1", "name": "Water", "role": "manager"},
        {"id": "p2", "name": "Schools"}
      ]),
    );
    let store = SqliteStore::open_in_memory().unwrap();

    let written = pull_user_projects(&api, &store, "u1").await.unwrap();
    assert_eq!(written, 2);
    assert_eq!(store.count(Table::Projects).unwrap(), 2);

    let link: ProjectUser = store.get_as("p1:u1").unwrap().unwrap();
    assert_eq!(link.role.as_deref(), Some("manager"));
    // `role` is an assignment attribute, not part of the project
    let project = store.get(Table::Projects, "p1").unwrap().unwrap();
    assert!(project.data.get("role").is_none());
  }

  #[tokio::test]
  async fn test_children_get_parent_reference() {
    let api = MockApi::new();
    api.respond(
      "/projects/p1/subprojects",
      json!([{"id": "s1", "name": "North"}, {"id": "s2", "name": "South", "projectId": "p1"}]),
    );
    let store = SqliteStore::open_in_memory().unwrap();

    let written = pull_children::<Subproject>(&api, &store, "/projects/p1/subprojects", "projectId", "p1")
      .await
      .unwrap();
    assert_eq!(written, 2);
    let north: Subproject = store.get_as("s1").unwrap().unwrap();
    assert_eq!(north.project_id, "p1");
    assert_eq!(snake_case("subprojectId"), "subproject_id");
  }

  #[tokio::test]
  async fn test_subproject_users_fill_both_tables() {
    let api = MockApi::new();
    api.respond(
      "/subprojects/s1/users",
      json!([{"id": 7, "email": "a@x.org"}, {"id": 8, "email": "b@x.org"}]),
    );
    let store = SqliteStore::open_in_memory().unwrap();

    assert_eq!(pull_subproject_users(&api, &store, "s1").await.unwrap(), 2);
    assert_eq!(store.count(Table::Users).unwrap(), 2);
    assert!(store.get_as::<SubprojectUser>("s1:7").unwrap().is_some());
  }
}
