//! Core traits and types for the local store.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Keys that only exist on the offline side and never leave the store.
const OFFLINE_FIELDS: &[&str] = &["synced", "_localUpdatedAt", "localUpdatedAt"];

/// Entity tables of the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Table {
  Projects,
  Subprojects,
  Activities,
  Beneficiaries,
  FormTemplates,
  FormSubmissions,
  Users,
  Services,
  EntityServices,
  ProjectUsers,
  SubprojectUsers,
}

impl Table {
  pub const ALL: [Table; 11] = [
    Table::Projects,
    Table::Subprojects,
    Table::Activities,
    Table::Beneficiaries,
    Table::FormTemplates,
    Table::FormSubmissions,
    Table::Users,
    Table::Services,
    Table::EntityServices,
    Table::ProjectUsers,
    Table::SubprojectUsers,
  ];

  /// Persisted table name
  pub fn name(&self) -> &'static str {
    match self {
      Table::Projects => "projects",
      Table::Subprojects => "subprojects",
      Table::Activities => "activities",
      Table::Beneficiaries => "beneficiaries",
      Table::FormTemplates => "formTemplates",
      Table::FormSubmissions => "formSubmissions",
      Table::Users => "users",
      Table::Services => "services",
      Table::EntityServices => "entityServices",
      Table::ProjectUsers => "projectUsers",
      Table::SubprojectUsers => "subprojectUsers",
    }
  }

  pub fn from_name(name: &str) -> Option<Table> {
    Table::ALL.into_iter().find(|t| t.name() == name)
  }
}

impl fmt::Display for Table {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Trait for domain types that can be stored locally.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Unique identifier within the table
  fn cache_key(&self) -> String;

  /// Server-side modification timestamp (ISO 8601), if the entity tracks one
  fn updated_at(&self) -> Option<&str>;

  /// Table the entity is stored in
  fn table() -> Table;
}

/// A stored document together with its offline bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRecord<T> {
  pub data: T,
  /// `false` until the server has confirmed this state
  pub synced: bool,
  pub local_updated_at: DateTime<Utc>,
}

impl<T> CachedRecord<T> {
  /// A record as confirmed by the server.
  pub fn synced(data: T) -> Self {
    Self {
      data,
      synced: true,
      local_updated_at: Utc::now(),
    }
  }

  /// A record written locally and not yet confirmed.
  pub fn local(data: T) -> Self {
    Self {
      data,
      synced: false,
      local_updated_at: Utc::now(),
    }
  }

  pub fn into_inner(self) -> T {
    self.data
  }
}

/// Remove offline bookkeeping keys from a document.
pub fn strip_offline_fields(value: &mut Value) {
  if let Value::Object(map) = value {
    for field in OFFLINE_FIELDS {
      map.remove(*field);
    }
  }
}

/// Extract the id of a document. Numeric ids are normalized to strings.
pub fn record_id(value: &Value) -> Option<String> {
  match value.get("id")? {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Server timestamp carried by a document, if any.
pub fn document_updated_at(value: &Value) -> Option<&str> {
  value
    .get("updatedAt")
    .or_else(|| value.get("updated_at"))
    .and_then(Value::as_str)
}
