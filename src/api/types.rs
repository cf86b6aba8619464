//! Domain types exchanged with the remote API and kept in the local store.
//!
//! Ids arrive as strings or numbers depending on the endpoint and are
//! normalized to strings. Fields this layer doesn't care about are preserved
//! in `extra` so nothing is lost on a round trip through the store.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

fn string_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  match Value::deserialize(deserializer)? {
    Value::String(s) => Ok(s),
    Value::Number(n) => Ok(n.to_string()),
    other => Err(serde::de::Error::custom(format!(
      "expected string or number id, got {}",
      other
    ))),
  }
}

fn optional_string_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  match Option::<Value>::deserialize(deserializer)? {
    None | Some(Value::Null) => Ok(None),
    Some(Value::String(s)) => Ok(Some(s)),
    Some(Value::Number(n)) => Ok(Some(n.to_string())),
    Some(other) => Err(serde::de::Error::custom(format!(
      "expected string or number id, got {}",
      other
    ))),
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
  #[serde(deserialize_with = "string_id")]
  pub id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none", alias = "updated_at")]
  pub updated_at: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subproject {
  #[serde(deserialize_with = "string_id")]
  pub id: String,
  #[serde(deserialize_with = "string_id", alias = "project_id")]
  pub project_id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none", alias = "updated_at")]
  pub updated_at: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
  #[serde(deserialize_with = "string_id")]
  pub id: String,
  #[serde(deserialize_with = "string_id", alias = "subproject_id")]
  pub subproject_id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none", alias = "updated_at")]
  pub updated_at: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beneficiary {
  #[serde(deserialize_with = "string_id")]
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none", alias = "updated_at")]
  pub updated_at: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormTemplate {
  #[serde(deserialize_with = "string_id")]
  pub id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none", alias = "updated_at")]
  pub updated_at: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormSubmission {
  #[serde(deserialize_with = "string_id")]
  pub id: String,
  #[serde(deserialize_with = "string_id", alias = "template_id")]
  pub template_id: String,
  #[serde(deserialize_with = "string_id", alias = "entity_id")]
  pub entity_id: String,
  #[serde(alias = "entity_type")]
  pub entity_type: String,
  #[serde(default)]
  pub data: Value,
  #[serde(default, skip_serializing_if = "Option::is_none", alias = "submitted_at")]
  pub submitted_at: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none", alias = "updated_at")]
  pub updated_at: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
  #[serde(deserialize_with = "string_id")]
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none", alias = "updated_at")]
  pub updated_at: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
  #[serde(deserialize_with = "string_id")]
  pub id: String,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none", alias = "updated_at")]
  pub updated_at: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Service assigned to a project, subproject or activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityService {
  #[serde(deserialize_with = "string_id")]
  pub id: String,
  #[serde(deserialize_with = "string_id", alias = "entity_id")]
  pub entity_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none", alias = "entity_type")]
  pub entity_type: Option<String>,
  #[serde(deserialize_with = "string_id", alias = "service_id")]
  pub service_id: String,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUser {
  pub id: String,
  #[serde(deserialize_with = "string_id")]
  pub project_id: String,
  #[serde(deserialize_with = "string_id")]
  pub user_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub role: Option<String>,
}

impl ProjectUser {
  pub fn new(project_id: &str, user_id: &str, role: Option<String>) -> Self {
    Self {
      id: format!("{}:{}", project_id, user_id),
      project_id: project_id.to_string(),
      user_id: user_id.to_string(),
      role,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubprojectUser {
  pub id: String,
  #[serde(deserialize_with = "string_id")]
  pub subproject_id: String,
  #[serde(deserialize_with = "string_id")]
  pub user_id: String,
}

impl SubprojectUser {
  pub fn new(subproject_id: &str, user_id: &str) -> Self {
    Self {
      id: format!("{}:{}", subproject_id, user_id),
      subproject_id: subproject_id.to_string(),
      user_id: user_id.to_string(),
    }
  }
}

/// Project with its subprojects and their activities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectNode {
  #[serde(flatten)]
  pub project: Project,
  pub subprojects: Vec<SubprojectNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubprojectNode {
  #[serde(flatten)]
  pub subproject: Subproject,
  pub activities: Vec<Activity>,
}

/// Input of `submit_form_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFormResponse {
  pub template_id: String,
  pub entity_id: String,
  pub entity_type: String,
  pub data: Value,
}

/// Body of a successful `POST /auth/login`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
  pub token: String,
  #[serde(default)]
  pub user: Value,
}

/// A project the user is assigned to, as returned by `/users/{id}/projects`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignedProject {
  #[serde(flatten)]
  pub project: Project,
  #[serde(default)]
  pub role: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_ids_and_aliases_are_normalized() {
    let sub: Subproject =
      serde_json::from_value(json!({"id": 3, "project_id": 9, "name": "Clinic", "updated_at": "2024-05-01T00:00:00Z"}))
        .unwrap();
    assert_eq!(sub.id, "3");
    assert_eq!(sub.project_id, "9");
    assert_eq!(sub.updated_at.as_deref(), Some("2024-05-01T00:00:00Z"));

    let doc = serde_json::to_value(&sub).unwrap();
    assert_eq!(doc["projectId"], "9");
    assert_eq!(doc["updatedAt"], "2024-05-01T00:00:00Z");
  }

  #[test]
  fn test_unknown_fields_survive() {
    let raw = json!({"id": "b1", "name": "Amina", "household": {"size": 5}});
    let beneficiary: Beneficiary = serde_json::from_value(raw.clone()).unwrap();
    assert_eq!(serde_json::to_value(&beneficiary).unwrap(), raw);
  }

  #[test]
  fn test_project_node_flattens() {
    let project: Project = serde_json::from_value(json!({"id": "p", "name": "P"})).unwrap();
    let node = ProjectNode {
      project,
      subprojects: Vec::new(),
    };
    assert_eq!(
      serde_json::to_value(&node).unwrap(),
      json!({"id": "p", "name": "P", "subprojects": []})
    );
  }
}
