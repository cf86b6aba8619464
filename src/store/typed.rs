//! Typed access on top of the JSON document store.
//!
//! Everything returned from here is a clean domain value: the offline
//! bookkeeping (`synced`, `local_updated_at`) stays behind this boundary.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use tracing::warn;

use super::storage::LocalStore;
use super::traits::{strip_offline_fields, CachedRecord, Cacheable, Table};

/// Decode a stored document into its domain type.
pub fn decode<T: Cacheable>(mut value: Value) -> Result<T> {
  strip_offline_fields(&mut value);
  serde_json::from_value(value).map_err(|e| eyre!("Failed to deserialize {}: {}", T::table(), e))
}

/// Encode a domain value as a document.
pub fn encode<T: Cacheable>(entity: &T) -> Result<Value> {
  serde_json::to_value(entity).map_err(|e| eyre!("Failed to serialize {}: {}", T::table(), e))
}

/// Decode every record, skipping the ones that no longer match `T`.
pub(crate) fn decode_all<T: Cacheable>(records: Vec<CachedRecord<Value>>) -> Vec<T> {
  records
    .into_iter()
    .filter_map(|r| match decode(r.data) {
      Ok(entity) => Some(entity),
      Err(e) => {
        warn!(table = %T::table(), error = %e, "Skipping record that does not match its type");
        None
      }
    })
    .collect()
}

/// `store.query(table, index).equals(value)`
pub struct WhereClause<'a, S: ?Sized> {
  store: &'a S,
  table: Table,
  index: &'a str,
}

impl<S: LocalStore + ?Sized> WhereClause<'_, S> {
  pub fn equals(&self, value: impl Into<Value>) -> Result<Vec<CachedRecord<Value>>> {
    self.store.where_equals(self.table, self.index, &value.into())
  }

  /// Same as `equals`, decoded into `T`.
  pub fn equals_as<T: Cacheable>(&self, value: impl Into<Value>) -> Result<Vec<T>> {
    Ok(decode_all(self.equals(value)?))
  }
}

/// Typed helpers available on every `LocalStore`.
pub trait LocalStoreExt: LocalStore {
  fn query<'a>(&'a self, table: Table, index: &'a str) -> WhereClause<'a, Self> {
    WhereClause {
      store: self,
      table,
      index,
    }
  }

  fn get_as<T: Cacheable>(&self, id: &str) -> Result<Option<T>> {
    self
      .get(T::table(), id)?
      .map(|r| decode(r.data))
      .transpose()
  }

  fn all_as<T: Cacheable>(&self) -> Result<Vec<T>> {
    Ok(decode_all(self.all(T::table())?))
  }

  fn bulk_get_as<T: Cacheable>(&self, ids: &[String]) -> Result<Vec<T>> {
    let found = self.bulk_get(T::table(), ids)?;
    Ok(decode_all(found.into_iter().flatten().collect()))
  }

  /// Store a server-confirmed entity.
  fn put_synced<T: Cacheable>(&self, entity: &T) -> Result<()> {
    self.put(T::table(), &CachedRecord::synced(encode(entity)?))
  }

  /// Store a locally written, unconfirmed entity.
  fn put_local<T: Cacheable>(&self, entity: &T) -> Result<()> {
    self.put(T::table(), &CachedRecord::local(encode(entity)?))
  }
}

impl<S: LocalStore + ?Sized> LocalStoreExt for S {}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::{Project, Subproject};
  use crate::store::SqliteStore;
  use serde_json::json;
  use std::sync::Arc;

  #[test]
  fn test_typed_round_trip_through_dyn_store() {
    let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let project: Project = serde_json::from_value(json!({"id": "p1", "name": "Wells", "region": "North"})).unwrap();

    store.put_local(&project).unwrap();
    let loaded: Project = store.get_as("p1").unwrap().unwrap();
    assert_eq!(loaded, project);
    assert_eq!(loaded.extra.get("region"), Some(&json!("North")));
    assert!(!loaded.extra.contains_key("synced"));
  }

  #[test]
  fn test_query_equals_as() {
    let store = SqliteStore::open_in_memory().unwrap();
    for (id, project) in [("s1", "p1"), ("s2", "p2")] {
      store
        .put(Table::Subprojects, &CachedRecord::synced(json!({"id": id, "projectId": project, "name": id})))
        .unwrap();
    }

    let subprojects: Vec<Subproject> = store.query(Table::Subprojects, "projectId").equals_as("p2").unwrap();
    assert_eq!(subprojects.len(), 1);
    assert_eq!(subprojects[0].id, "s2");
  }

  #[test]
  fn test_mismatched_documents_are_skipped() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .put(Table::Projects, &CachedRecord::synced(json!({"id": "ok", "name": "Fine"})))
      .unwrap();
    store
      .put(Table::Projects, &CachedRecord::synced(json!({"id": "bad", "name": 12})))
      .unwrap();

    let projects: Vec<Project> = store.all_as().unwrap();
    assert_eq!(projects.len(), 1);
  }
}
