//! Read commands understood by the interceptor.

use async_trait::async_trait;
use color_eyre::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};

use super::{CommandKind, ReadCommand};
use crate::api::types::{
  Activity, Beneficiary, EntityService, FormSubmission, FormTemplate, Project, ProjectNode, Service,
  Subproject, SubprojectNode, SubprojectUser, User,
};
use crate::api::{endpoints, fetch_list, fetch_one, ListParams, RemoteApi};
use crate::reader::{read_filtered, read_user_projects};
use crate::store::{LocalStore, LocalStoreExt, Table};
use crate::sync::pull::{fetch_children, fetch_user_projects};

const TREE_FETCHES: usize = 4;

// ============================================================================
// Entity lists
// ============================================================================

pub struct ListProjects;

#[async_trait]
impl ReadCommand for ListProjects {
  type Output = Vec<Project>;

  fn kind(&self) -> CommandKind {
    CommandKind::ListProjects
  }

  async fn online(&self, api: &dyn RemoteApi) -> Result<Vec<Project>> {
    fetch_list(api, endpoints::PROJECTS, &ListParams::new()).await
  }

  fn offline(&self, store: &dyn LocalStore) -> Result<Vec<Project>> {
    store.all_as()
  }
}

pub struct ListSubprojects {
  pub project_id: String,
}

impl ListSubprojects {
  pub fn new(project_id: &str) -> Self {
    Self {
      project_id: project_id.to_string(),
    }
  }
}

#[async_trait]
impl ReadCommand for ListSubprojects {
  type Output = Vec<Subproject>;

  fn kind(&self) -> CommandKind {
    CommandKind::ListSubprojects
  }

  async fn online(&self, api: &dyn RemoteApi) -> Result<Vec<Subproject>> {
    fetch_children(
      api,
      &endpoints::project_subprojects(&self.project_id),
      "projectId",
      &self.project_id,
    )
    .await
  }

  fn offline(&self, store: &dyn LocalStore) -> Result<Vec<Subproject>> {
    store
      .query(Table::Subprojects, "projectId")
      .equals_as(self.project_id.as_str())
  }
}

pub struct ListActivities {
  pub subproject_id: String,
}

impl ListActivities {
  pub fn new(subproject_id: &str) -> Self {
    Self {
      subproject_id: subproject_id.to_string(),
    }
  }
}

#[async_trait]
impl ReadCommand for ListActivities {
  type Output = Vec<Activity>;

  fn kind(&self) -> CommandKind {
    CommandKind::ListActivities
  }

  async fn online(&self, api: &dyn RemoteApi) -> Result<Vec<Activity>> {
    fetch_children(
      api,
      &endpoints::subproject_activities(&self.subproject_id),
      "subprojectId",
      &self.subproject_id,
    )
    .await
  }

  fn offline(&self, store: &dyn LocalStore) -> Result<Vec<Activity>> {
    store
      .query(Table::Activities, "subprojectId")
      .equals_as(self.subproject_id.as_str())
  }
}

#[derive(Default)]
pub struct ListBeneficiaries {
  pub params: ListParams,
}

#[async_trait]
impl ReadCommand for ListBeneficiaries {
  type Output = Vec<Beneficiary>;

  fn kind(&self) -> CommandKind {
    CommandKind::ListBeneficiaries
  }

  async fn online(&self, api: &dyn RemoteApi) -> Result<Vec<Beneficiary>> {
    fetch_list(api, endpoints::BENEFICIARIES, &self.params).await
  }

  fn offline(&self, store: &dyn LocalStore) -> Result<Vec<Beneficiary>> {
    read_filtered(store, &self.params)
  }
}

#[derive(Default)]
pub struct ListFormTemplates {
  pub params: ListParams,
}

#[async_trait]
impl ReadCommand for ListFormTemplates {
  type Output = Vec<FormTemplate>;

  fn kind(&self) -> CommandKind {
    CommandKind::ListFormTemplates
  }

  async fn online(&self, api: &dyn RemoteApi) -> Result<Vec<FormTemplate>> {
    fetch_list(api, endpoints::FORM_TEMPLATES, &self.params).await
  }

  fn offline(&self, store: &dyn LocalStore) -> Result<Vec<FormTemplate>> {
    read_filtered(store, &self.params)
  }
}

/// A single template; `None` when it is not cached.
pub struct GetFormTemplate {
  pub id: String,
}

impl GetFormTemplate {
  pub fn new(id: &str) -> Self {
    Self { id: id.to_string() }
  }
}

#[async_trait]
impl ReadCommand for GetFormTemplate {
  type Output = Option<FormTemplate>;

  fn kind(&self) -> CommandKind {
    CommandKind::GetFormTemplate
  }

  async fn online(&self, api: &dyn RemoteApi) -> Result<Option<FormTemplate>> {
    fetch_one(api, &endpoints::form_template(&self.id)).await.map(Some)
  }

  fn offline(&self, store: &dyn LocalStore) -> Result<Option<FormTemplate>> {
    store.get_as(&self.id)
  }
}

#[derive(Default)]
pub struct ListFormSubmissions {
  pub params: ListParams,
}

#[async_trait]
impl ReadCommand for ListFormSubmissions {
  type Output = Vec<FormSubmission>;

  fn kind(&self) -> CommandKind {
    CommandKind::ListFormSubmissions
  }

  async fn online(&self, api: &dyn RemoteApi) -> Result<Vec<FormSubmission>> {
    fetch_list(api, endpoints::FORM_RESPONSES, &self.params).await
  }

  fn offline(&self, store: &dyn LocalStore) -> Result<Vec<FormSubmission>> {
    read_filtered(store, &self.params)
  }
}

pub struct ListUsers;

#[async_trait]
impl ReadCommand for ListUsers {
  type Output = Vec<User>;

  fn kind(&self) -> CommandKind {
    CommandKind::ListUsers
  }

  async fn online(&self, api: &dyn RemoteApi) -> Result<Vec<User>> {
    fetch_list(api, endpoints::USERS, &ListParams::new()).await
  }

  fn offline(&self, store: &dyn LocalStore) -> Result<Vec<User>> {
    store.all_as()
  }
}

pub struct ListServices;

#[async_trait]
impl ReadCommand for ListServices {
  type Output = Vec<Service>;

  fn kind(&self) -> CommandKind {
    CommandKind::ListServices
  }

  async fn online(&self, api: &dyn RemoteApi) -> Result<Vec<Service>> {
    fetch_list(api, endpoints::SERVICES, &ListParams::new()).await
  }

  fn offline(&self, store: &dyn LocalStore) -> Result<Vec<Service>> {
    store.all_as()
  }
}

// ============================================================================
// Joins
// ============================================================================

/// Projects with their subprojects and activities, optionally narrowed to a
/// single project.
#[derive(Default)]
pub struct ProjectTree {
  pub project_id: Option<String>,
}

impl ProjectTree {
  pub fn for_project(project_id: &str) -> Self {
    Self {
      project_id: Some(project_id.to_string()),
    }
  }
}

#[async_trait]
impl ReadCommand for ProjectTree {
  type Output = Vec<ProjectNode>;

  fn kind(&self) -> CommandKind {
    CommandKind::ProjectTree
  }

  async fn online(&self, api: &dyn RemoteApi) -> Result<Vec<ProjectNode>> {
    let projects: Vec<Project> = match &self.project_id {
      Some(id) => fetch_list::<Project>(api, endpoints::PROJECTS, &ListParams::new())
        .await?
        .into_iter()
        .filter(|p| &p.id == id)
        .collect(),
      None => fetch_list(api, endpoints::PROJECTS, &ListParams::new()).await?,
    };

    let project_ids: Vec<String> = projects.iter().map(|p| p.id.clone()).collect();
    let subprojects: Vec<Vec<Subproject>> = stream::iter(project_ids)
      .map(move |id| async move {
        fetch_children::<Subproject>(api, &endpoints::project_subprojects(&id), "projectId", &id).await
      })
      .buffered(TREE_FETCHES)
      .try_collect()
      .await?;
    let subprojects: Vec<Subproject> = subprojects.into_iter().flatten().collect();

    let subproject_ids: Vec<String> = subprojects.iter().map(|s| s.id.clone()).collect();
    let activities: Vec<Vec<Activity>> = stream::iter(subproject_ids)
      .map(move |id| async move {
        fetch_children::<Activity>(api, &endpoints::subproject_activities(&id), "subprojectId", &id)
          .await
      })
      .buffered(TREE_FETCHES)
      .try_collect()
      .await?;

    Ok(build_tree(
      projects,
      subprojects,
      activities.into_iter().flatten().collect(),
    ))
  }

  fn offline(&self, store: &dyn LocalStore) -> Result<Vec<ProjectNode>> {
    let projects: Vec<Project> = match &self.project_id {
      Some(id) => store.get_as(id)?.into_iter().collect(),
      None => store.all_as()?,
    };
    let subprojects: Vec<Subproject> = store.all_as()?;
    let activities: Vec<Activity> = store.all_as()?;
    Ok(build_tree(projects, subprojects, activities))
  }
}

/// Assemble the hierarchy. Children whose parent is not in `projects` are
/// dropped; order follows the input lists.
pub fn build_tree(
  projects: Vec<Project>,
  subprojects: Vec<Subproject>,
  activities: Vec<Activity>,
) -> Vec<ProjectNode> {
  let mut activities_by_subproject: HashMap<String, Vec<Activity>> = HashMap::new();
  for activity in activities {
    activities_by_subproject
      .entry(activity.subproject_id.clone())
      .or_default()
      .push(activity);
  }

  let mut subprojects_by_project: HashMap<String, Vec<SubprojectNode>> = HashMap::new();
  for subproject in subprojects {
    let activities = activities_by_subproject
      .remove(&subproject.id)
      .unwrap_or_default();
    subprojects_by_project
      .entry(subproject.project_id.clone())
      .or_default()
      .push(SubprojectNode {
        subproject,
        activities,
      });
  }

  projects
    .into_iter()
    .map(|project| ProjectNode {
      subprojects: subprojects_by_project
        .remove(&project.id)
        .unwrap_or_default(),
      project,
    })
    .collect()
}

pub struct UserProjects {
  pub user_id: String,
}

impl UserProjects {
  pub fn new(user_id: &str) -> Self {
    Self {
      user_id: user_id.to_string(),
    }
  }
}

#[async_trait]
impl ReadCommand for UserProjects {
  type Output = Vec<Project>;

  fn kind(&self) -> CommandKind {
    CommandKind::UserProjects
  }

  async fn online(&self, api: &dyn RemoteApi) -> Result<Vec<Project>> {
    let assigned = fetch_user_projects(api, &self.user_id).await?;
    Ok(assigned.into_iter().map(|a| a.project).collect())
  }

  fn offline(&self, store: &dyn LocalStore) -> Result<Vec<Project>> {
    read_user_projects(store, &self.user_id)
  }
}

/// Users assigned to a subproject.
pub struct SubprojectMembers {
  pub subproject_id: String,
}

impl SubprojectMembers {
  pub fn new(subproject_id: &str) -> Self {
    Self {
      subproject_id: subproject_id.to_string(),
    }
  }
}

#[async_trait]
impl ReadCommand for SubprojectMembers {
  type Output = Vec<User>;

  fn kind(&self) -> CommandKind {
    CommandKind::SubprojectMembers
  }

  async fn online(&self, api: &dyn RemoteApi) -> Result<Vec<User>> {
    fetch_list(
      api,
      &endpoints::subproject_users(&self.subproject_id),
      &ListParams::new(),
    )
    .await
  }

  fn offline(&self, store: &dyn LocalStore) -> Result<Vec<User>> {
    let links: Vec<SubprojectUser> = store
      .query(Table::SubprojectUsers, "subprojectId")
      .equals_as(self.subproject_id.as_str())?;
    let ids: Vec<String> = links.into_iter().map(|l| l.user_id).collect();
    store.bulk_get_as(&ids)
  }
}

/// Services assigned to a project, subproject or activity.
pub struct EntityServices {
  pub entity_id: String,
}

impl EntityServices {
  pub fn new(entity_id: &str) -> Self {
    Self {
      entity_id: entity_id.to_string(),
    }
  }
}

#[async_trait]
impl ReadCommand for EntityServices {
  type Output = Vec<Service>;

  fn kind(&self) -> CommandKind {
    CommandKind::EntityServices
  }

  async fn online(&self, api: &dyn RemoteApi) -> Result<Vec<Service>> {
    let params = ListParams::new().with("entityId", &self.entity_id);
    let assignments: Vec<EntityService> =
      fetch_list(api, endpoints::SERVICE_ASSIGNMENTS, &params).await?;
    let wanted: HashSet<String> = assignments
      .into_iter()
      .filter(|a| a.entity_id == self.entity_id)
      .map(|a| a.service_id)
      .collect();
    if wanted.is_empty() {
      return Ok(Vec::new());
    }

    let services: Vec<Service> = fetch_list(api, endpoints::SERVICES, &ListParams::new()).await?;
    Ok(services.into_iter().filter(|s| wanted.contains(&s.id)).collect())
  }

  fn offline(&self, store: &dyn LocalStore) -> Result<Vec<Service>> {
    let assignments: Vec<EntityService> = store
      .query(Table::EntityServices, "entityId")
      .equals_as(self.entity_id.as_str())?;
    let ids: Vec<String> = assignments.into_iter().map(|a| a.service_id).collect();
    store.bulk_get_as(&ids)
  }
}
