//! Local store trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, types::Value as SqlValue, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use super::traits::{record_id, strip_offline_fields, CachedRecord, Table};
use crate::auth::AuthEntry;
use crate::db::Database;
use crate::queue::PendingMutation;

/// Keyed, per-entity tables plus the mutation queue and auth cache.
///
/// Every operation is atomic per record; callers never rely on transactions
/// spanning several tables.
pub trait LocalStore: Send + Sync {
  /// `false` when nothing is actually persisted (online-only mode).
  fn is_persistent(&self) -> bool {
    true
  }

  fn get(&self, table: Table, id: &str) -> Result<Option<CachedRecord<Value>>>;

  /// Upsert by the document's `id`.
  fn put(&self, table: Table, record: &CachedRecord<Value>) -> Result<()>;

  /// Upsert many documents in one transaction.
  fn bulk_put(&self, table: Table, records: &[CachedRecord<Value>]) -> Result<()>;

  /// Lookup several ids at once; the result is aligned with `ids`.
  fn bulk_get(&self, table: Table, ids: &[String]) -> Result<Vec<Option<CachedRecord<Value>>>>;

  /// All documents whose top-level field `index` equals `value`.
  fn where_equals(&self, table: Table, index: &str, value: &Value)
    -> Result<Vec<CachedRecord<Value>>>;

  fn all(&self, table: Table) -> Result<Vec<CachedRecord<Value>>>;

  fn delete(&self, table: Table, id: &str) -> Result<bool>;

  fn set_synced(&self, table: Table, id: &str, synced: bool) -> Result<bool>;

  fn count(&self, table: Table) -> Result<usize>;

  fn clear_table(&self, table: Table) -> Result<()>;

  /// Empty every entity table, keeping the queue and auth cache.
  fn clear_entities(&self) -> Result<()>;

  /// Empty everything, control tables included.
  fn clear_all(&self) -> Result<()>;

  /// Store a new mutation and return its queue position.
  fn insert_mutation(&self, mutation: &PendingMutation) -> Result<i64>;

  fn list_mutations(&self) -> Result<Vec<PendingMutation>>;

  fn update_mutation(&self, mutation: &PendingMutation) -> Result<()>;

  fn delete_mutation(&self, id: &str) -> Result<bool>;

  fn count_mutations(&self) -> Result<usize>;

  fn has_mutation_for(&self, table: Table, entity_id: &str) -> Result<bool>;

  fn reassign_mutations(&self, table: Table, from: &str, to: &str) -> Result<usize>;

  fn put_auth(&self, entry: &AuthEntry) -> Result<()>;

  fn get_auth(&self, email: &str) -> Result<Option<AuthEntry>>;

  fn delete_auth(&self, email: &str) -> Result<bool>;

  fn clear_auth(&self) -> Result<()>;

  fn count_auth(&self) -> Result<usize>;

  fn get_meta(&self, key: &str) -> Result<Option<String>>;

  fn set_meta(&self, key: &str, value: &str) -> Result<()>;
}

/// Store that doesn't persist anything.
/// Used when the database cannot be opened - the app keeps running online-only.
pub struct NoopStore;

impl LocalStore for NoopStore {
  fn is_persistent(&self) -> bool {
    false
  }

  fn get(&self, _table: Table, _id: &str) -> Result<Option<CachedRecord<Value>>> {
    Ok(None) // Always miss
  }

  fn put(&self, _table: Table, _record: &CachedRecord<Value>) -> Result<()> {
    Ok(()) // Discard
  }

  fn bulk_put(&self, _table: Table, _records: &[CachedRecord<Value>]) -> Result<()> {
    Ok(())
  }

  fn bulk_get(&self, _table: Table, ids: &[String]) -> Result<Vec<Option<CachedRecord<Value>>>> {
    Ok(vec![None; ids.len()])
  }

  fn where_equals(
    &self,
    _table: Table,
    _index: &str,
    _value: &Value,
  ) -> Result<Vec<CachedRecord<Value>>> {
    Ok(Vec::new())
  }

  fn all(&self, _table: Table) -> Result<Vec<CachedRecord<Value>>> {
    Ok(Vec::new())
  }

  fn delete(&self, _table: Table, _id: &str) -> Result<bool> {
    Ok(false)
  }

  fn set_synced(&self, _table: Table, _id: &str, _synced: bool) -> Result<bool> {
    Ok(false)
  }

  fn count(&self, _table: Table) -> Result<usize> {
    Ok(0)
  }

  fn clear_table(&self, _table: Table) -> Result<()> {
    Ok(())
  }

  fn clear_entities(&self) -> Result<()> {
    Ok(())
  }

  fn clear_all(&self) -> Result<()> {
    Ok(())
  }

  fn insert_mutation(&self, _mutation: &PendingMutation) -> Result<i64> {
    // A write that cannot be persisted must not look queued
    Err(eyre!("Offline storage is unavailable, cannot queue mutation"))
  }

  fn list_mutations(&self) -> Result<Vec<PendingMutation>> {
    Ok(Vec::new())
  }

  fn update_mutation(&self, _mutation: &PendingMutation) -> Result<()> {
    Ok(())
  }

  fn delete_mutation(&self, _id: &str) -> Result<bool> {
    Ok(false)
  }

  fn count_mutations(&self) -> Result<usize> {
    Ok(0)
  }

  fn has_mutation_for(&self, _table: Table, _entity_id: &str) -> Result<bool> {
    Ok(false)
  }

  fn reassign_mutations(&self, _table: Table, _from: &str, _to: &str) -> Result<usize> {
    Ok(0)
  }

  fn put_auth(&self, _entry: &AuthEntry) -> Result<()> {
    Ok(())
  }

  fn get_auth(&self, _email: &str) -> Result<Option<AuthEntry>> {
    Ok(None)
  }

  fn delete_auth(&self, _email: &str) -> Result<bool> {
    Ok(false)
  }

  fn clear_auth(&self) -> Result<()> {
    Ok(())
  }

  fn count_auth(&self) -> Result<usize> {
    Ok(0)
  }

  fn get_meta(&self, _key: &str) -> Result<Option<String>> {
    Ok(None)
  }

  fn set_meta(&self, _key: &str, _value: &str) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based local store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let db = Database::open(path)?;
    Ok(Self {
      conn: Mutex::new(db.into_conn()),
    })
  }

  /// Open a private in-memory store.
  pub fn open_in_memory() -> Result<Self> {
    let db = Database::open_in_memory()?;
    Ok(Self {
      conn: Mutex::new(db.into_conn()),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

const RECORD_COLUMNS: &str = "data, synced, local_updated_at";

const MUTATION_COLUMNS: &str = "seq, id, entity_type, entity_id, operation, payload, endpoint, \
   method, retry_count, status, last_error, next_attempt_at, created_at";

impl LocalStore for SqliteStore {
  fn get(&self, table: Table, id: &str) -> Result<Option<CachedRecord<Value>>> {
    let conn = self.lock()?;

    let row = conn
      .query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM records WHERE table_name = ? AND id = ?"),
        params![table.name(), id],
        read_record_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} {}: {}", table, id, e))?;

    row.map(decode_record).transpose()
  }

  fn put(&self, table: Table, record: &CachedRecord<Value>) -> Result<()> {
    let conn = self.lock()?;
    write_record(&conn, table, record)
  }

  fn bulk_put(&self, table: Table, records: &[CachedRecord<Value>]) -> Result<()> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for record in records {
      write_record(&tx, table, record)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn bulk_get(&self, table: Table, ids: &[String]) -> Result<Vec<Option<CachedRecord<Value>>>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM records WHERE table_name = ? AND id = ?"
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let mut found = Vec::with_capacity(ids.len());
    for id in ids {
      let row = stmt
        .query_row(params![table.name(), id], read_record_row)
        .optional()
        .map_err(|e| eyre!("Failed to read {} {}: {}", table, id, e))?;
      found.push(row.map(decode_record).transpose()?);
    }

    Ok(found)
  }

  fn where_equals(
    &self,
    table: Table,
    index: &str,
    value: &Value,
  ) -> Result<Vec<CachedRecord<Value>>> {
    if !index.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
      return Err(eyre!("Invalid index name '{}'", index));
    }

    let conn = self.lock()?;
    let path = format!("$.{}", index);

    let rows = match to_sql_value(value) {
      Some(value) => query_records(
        &conn,
        &format!(
          "SELECT {RECORD_COLUMNS} FROM records
           WHERE table_name = ? AND json_extract(data, ?) = ?
           ORDER BY rowid"
        ),
        params![table.name(), path, value],
      )?,
      None => query_records(
        &conn,
        &format!(
          "SELECT {RECORD_COLUMNS} FROM records
           WHERE table_name = ? AND json_extract(data, ?) IS NULL
           ORDER BY rowid"
        ),
        params![table.name(), path],
      )?,
    };

    Ok(rows)
  }

  fn all(&self, table: Table) -> Result<Vec<CachedRecord<Value>>> {
    let conn = self.lock()?;
    query_records(
      &conn,
      &format!("SELECT {RECORD_COLUMNS} FROM records WHERE table_name = ? ORDER BY rowid"),
      params![table.name()],
    )
  }

  fn delete(&self, table: Table, id: &str) -> Result<bool> {
    let conn = self.lock()?;
    let changed = conn
      .execute(
        "DELETE FROM records WHERE table_name = ? AND id = ?",
        params![table.name(), id],
      )
      .map_err(|e| eyre!("Failed to delete {} {}: {}", table, id, e))?;
    Ok(changed > 0)
  }

  fn set_synced(&self, table: Table, id: &str, synced: bool) -> Result<bool> {
    let conn = self.lock()?;
    let changed = conn
      .execute(
        "UPDATE records SET synced = ?, local_updated_at = ? WHERE table_name = ? AND id = ?",
        params![synced, Utc::now().to_rfc3339(), table.name(), id],
      )
      .map_err(|e| eyre!("Failed to update sync flag of {} {}: {}", table, id, e))?;
    Ok(changed > 0)
  }

  fn count(&self, table: Table) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM records WHERE table_name = ?",
        params![table.name()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count {}: {}", table, e))?;
    Ok(count as usize)
  }

  fn clear_table(&self, table: Table) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM records WHERE table_name = ?", params![table.name()])
      .map_err(|e| eyre!("Failed to clear {}: {}", table, e))?;
    Ok(())
  }

  fn clear_entities(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM records", [])
      .map_err(|e| eyre!("Failed to clear entity tables: {}", e))?;
    Ok(())
  }

  fn clear_all(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(
        "BEGIN;
         DELETE FROM records;
         DELETE FROM pending_mutations;
         DELETE FROM auth_cache;
         DELETE FROM sync_meta;
         COMMIT;",
      )
      .map_err(|e| eyre!("Failed to clear local store: {}", e))?;
    Ok(())
  }

  fn insert_mutation(&self, mutation: &PendingMutation) -> Result<i64> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO pending_mutations (id, entity_type, entity_id, operation, payload, endpoint,
           method, retry_count, status, last_error, next_attempt_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          mutation.id,
          mutation.entity_type.name(),
          mutation.entity_id,
          mutation.operation.as_str(),
          mutation.payload.to_string(),
          mutation.endpoint,
          mutation.method.as_str(),
          mutation.retry_count,
          mutation.status.as_str(),
          mutation.last_error,
          mutation.next_attempt_at.map(|t| t.to_rfc3339()),
          mutation.created_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to queue mutation: {}", e))?;
    Ok(conn.last_insert_rowid())
  }

  fn list_mutations(&self) -> Result<Vec<PendingMutation>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(&format!(
        "SELECT {MUTATION_COLUMNS} FROM pending_mutations ORDER BY seq"
      ))
      .map_err(|e| eyre!("Failed to prepare mutation query: {}", e))?;

    let rows = stmt
      .query_map([], read_mutation_row)
      .map_err(|e| eyre!("Failed to query mutations: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read mutation: {}", e))?;

    rows.into_iter().map(decode_mutation).collect()
  }

  fn update_mutation(&self, mutation: &PendingMutation) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "UPDATE pending_mutations
         SET retry_count = ?, status = ?, last_error = ?, next_attempt_at = ?, entity_id = ?
         WHERE id = ?",
        params![
          mutation.retry_count,
          mutation.status.as_str(),
          mutation.last_error,
          mutation.next_attempt_at.map(|t| t.to_rfc3339()),
          mutation.entity_id,
          mutation.id,
        ],
      )
      .map_err(|e| eyre!("Failed to update mutation {}: {}", mutation.id, e))?;
    Ok(())
  }

  fn delete_mutation(&self, id: &str) -> Result<bool> {
    let conn = self.lock()?;
    let changed = conn
      .execute("DELETE FROM pending_mutations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete mutation {}: {}", id, e))?;
    Ok(changed > 0)
  }

  fn count_mutations(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM pending_mutations", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count mutations: {}", e))?;
    Ok(count as usize)
  }

  fn has_mutation_for(&self, table: Table, entity_id: &str) -> Result<bool> {
    let conn = self.lock()?;
    let exists: bool = conn
      .query_row(
        "SELECT EXISTS(SELECT 1 FROM pending_mutations WHERE entity_type = ? AND entity_id = ?)",
        params![table.name(), entity_id],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to look up mutations for {} {}: {}", table, entity_id, e))?;
    Ok(exists)
  }

  fn reassign_mutations(&self, table: Table, from: &str, to: &str) -> Result<usize> {
    let conn = self.lock()?;
    let changed = conn
      .execute(
        "UPDATE pending_mutations
         SET entity_id = ?3, endpoint = replace(endpoint, ?2, ?3)
         WHERE entity_type = ?1 AND entity_id = ?2",
        params![table.name(), from, to],
      )
      .map_err(|e| eyre!("Failed to reassign mutations of {} {}: {}", table, from, e))?;
    Ok(changed)
  }

  fn put_auth(&self, entry: &AuthEntry) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO auth_cache (email, password_hash, salt, token, user_data, last_login_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          entry.email,
          entry.password_hash,
          entry.salt,
          entry.token,
          entry.user_data.to_string(),
          entry.last_login_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store offline credentials: {}", e))?;
    Ok(())
  }

  fn get_auth(&self, email: &str) -> Result<Option<AuthEntry>> {
    let conn = self.lock()?;
    let row: Option<(String, String, String, String, String, String)> = conn
      .query_row(
        "SELECT email, password_hash, salt, token, user_data, last_login_at
         FROM auth_cache WHERE email = ?",
        params![email],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read offline credentials: {}", e))?;

    let Some((email, password_hash, salt, token, user_data, last_login_at)) = row else {
      return Ok(None);
    };

    Ok(Some(AuthEntry {
      email,
      password_hash,
      salt,
      token,
      user_data: serde_json::from_str(&user_data)
        .map_err(|e| eyre!("Failed to parse cached user data: {}", e))?,
      last_login_at: parse_datetime(&last_login_at)?,
    }))
  }

  fn delete_auth(&self, email: &str) -> Result<bool> {
    let conn = self.lock()?;
    let changed = conn
      .execute("DELETE FROM auth_cache WHERE email = ?", params![email])
      .map_err(|e| eyre!("Failed to delete offline credentials: {}", e))?;
    Ok(changed > 0)
  }

  fn clear_auth(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM auth_cache", [])
      .map_err(|e| eyre!("Failed to clear offline credentials: {}", e))?;
    Ok(())
  }

  fn count_auth(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM auth_cache", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count offline credentials: {}", e))?;
    Ok(count as usize)
  }

  fn get_meta(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row(
        "SELECT value FROM sync_meta WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read metadata {}: {}", key, e))
  }

  fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write metadata {}: {}", key, e))?;
    Ok(())
  }
}

type RecordRow = (String, bool, String);

fn read_record_row(row: &Row<'_>) -> rusqlite::Result<RecordRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode_record((data, synced, local_updated_at): RecordRow) -> Result<CachedRecord<Value>> {
  let data: Value =
    serde_json::from_str(&data).map_err(|e| eyre!("Failed to deserialize record: {}", e))?;
  Ok(CachedRecord {
    data,
    synced,
    local_updated_at: parse_datetime(&local_updated_at)?,
  })
}

fn query_records(
  conn: &Connection,
  sql: &str,
  params: impl rusqlite::Params,
) -> Result<Vec<CachedRecord<Value>>> {
  let mut stmt = conn
    .prepare(sql)
    .map_err(|e| eyre!("Failed to prepare record query: {}", e))?;

  let rows = stmt
    .query_map(params, read_record_row)
    .map_err(|e| eyre!("Failed to query records: {}", e))?
    .collect::<rusqlite::Result<Vec<_>>>()
    .map_err(|e| eyre!("Failed to read record: {}", e))?;

  // A single corrupt document must not hide the rest of the table
  Ok(
    rows
      .into_iter()
      .filter_map(|row| match decode_record(row) {
        Ok(record) => Some(record),
        Err(e) => {
          warn!(error = %e, "Skipping unreadable record");
          None
        }
      })
      .collect(),
  )
}

fn write_record(conn: &Connection, table: Table, record: &CachedRecord<Value>) -> Result<()> {
  let mut data = record.data.clone();
  strip_offline_fields(&mut data);
  let id = record_id(&data).ok_or_else(|| eyre!("Cannot store {} record without an id", table))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO records (table_name, id, data, synced, local_updated_at)
       VALUES (?, ?, ?, ?, ?)",
      params![
        table.name(),
        id,
        data.to_string(),
        record.synced,
        record.local_updated_at.to_rfc3339(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {} {}: {}", table, id, e))?;

  Ok(())
}

type MutationRow = (
  i64,
  String,
  String,
  String,
  String,
  String,
  String,
  String,
  u32,
  String,
  Option<String>,
  Option<String>,
  String,
);

fn read_mutation_row(row: &Row<'_>) -> rusqlite::Result<MutationRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
    row.get(7)?,
    row.get(8)?,
    row.get(9)?,
    row.get(10)?,
    row.get(11)?,
    row.get(12)?,
  ))
}

fn decode_mutation(row: MutationRow) -> Result<PendingMutation> {
  let (
    seq,
    id,
    entity_type,
    entity_id,
    operation,
    payload,
    endpoint,
    method,
    retry_count,
    status,
    last_error,
    next_attempt_at,
    created_at,
  ) = row;

  Ok(PendingMutation {
    seq,
    entity_type: Table::from_name(&entity_type)
      .ok_or_else(|| eyre!("Mutation {} targets unknown table '{}'", id, entity_type))?,
    id,
    entity_id,
    operation: operation.parse()?,
    payload: serde_json::from_str(&payload)
      .map_err(|e| eyre!("Failed to parse mutation payload: {}", e))?,
    endpoint,
    method: method.parse()?,
    retry_count,
    status: status.parse()?,
    last_error,
    next_attempt_at: next_attempt_at.as_deref().map(parse_datetime).transpose()?,
    created_at: parse_datetime(&created_at)?,
  })
}

/// Map a JSON scalar onto the SQL value `json_extract` yields for it.
fn to_sql_value(value: &Value) -> Option<SqlValue> {
  match value {
    Value::Null => None,
    Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
    Value::Number(n) => Some(match n.as_i64() {
      Some(i) => SqlValue::Integer(i),
      None => SqlValue::Real(n.as_f64().unwrap_or_default()),
    }),
    Value::String(s) => Some(SqlValue::Text(s.clone())),
    other => Some(SqlValue::Text(other.to_string())),
  }
}

/// Parse an RFC 3339 timestamp written by this store.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn store() -> SqliteStore {
    SqliteStore::open_in_memory().unwrap()
  }

  #[test]
  fn test_put_is_upsert_by_id() {
    let store = store();
    store
      .put(Table::Projects, &CachedRecord::synced(json!({"id": "p1", "name": "Old"})))
      .unwrap();
    store
      .put(Table::Projects, &CachedRecord::local(json!({"id": "p1", "name": "New"})))
      .unwrap();

    assert_eq!(store.count(Table::Projects).unwrap(), 1);
    let record = store.get(Table::Projects, "p1").unwrap().unwrap();
    assert_eq!(record.data["name"], "New");
    assert!(!record.synced);
  }

  #[test]
  fn test_put_strips_offline_fields() {
    let store = store();
    store
      .put(
        Table::Users,
        &CachedRecord::synced(json!({"id": 7, "email": "a@b.c", "synced": false, "_localUpdatedAt": "x"})),
      )
      .unwrap();

    let record = store.get(Table::Users, "7").unwrap().unwrap();
    assert_eq!(record.data, json!({"id": 7, "email": "a@b.c"}));
    assert!(record.synced);
  }

  #[test]
  fn test_put_without_id_fails() {
    let store = store();
    assert!(store
      .put(Table::Projects, &CachedRecord::synced(json!({"name": "x"})))
      .is_err());
  }

  #[test]
  fn test_tables_are_isolated() {
    let store = store();
    store
      .put(Table::Projects, &CachedRecord::synced(json!({"id": "1"})))
      .unwrap();
    store
      .put(Table::Services, &CachedRecord::synced(json!({"id": "1"})))
      .unwrap();

    store.clear_table(Table::Projects).unwrap();
    assert_eq!(store.count(Table::Projects).unwrap(), 0);
    assert_eq!(store.count(Table::Services).unwrap(), 1);
  }

  #[test]
  fn test_where_equals() {
    let store = store();
    let records: Vec<_> = [("s1", "p1"), ("s2", "p2"), ("s3", "p1")]
      .iter()
      .map(|(id, project)| CachedRecord::synced(json!({"id": id, "projectId": project})))
      .collect();
    store.bulk_put(Table::Subprojects, &records).unwrap();
    store
      .put(Table::Subprojects, &CachedRecord::synced(json!({"id": "s4", "projectId": 5})))
      .unwrap();

    let ids: Vec<_> = store
      .where_equals(Table::Subprojects, "projectId", &json!("p1"))
      .unwrap()
      .into_iter()
      .map(|r| r.data["id"].clone())
      .collect();
    assert_eq!(ids, vec![json!("s1"), json!("s3")]);

    let numeric = store
      .where_equals(Table::Subprojects, "projectId", &json!(5))
      .unwrap();
    assert_eq!(numeric.len(), 1);

    assert!(store
      .where_equals(Table::Subprojects, "projectId') OR 1=1 --", &json!("p1"))
      .is_err());
  }

  #[test]
  fn test_bulk_get_is_aligned() {
    let store = store();
    store
      .put(Table::Projects, &CachedRecord::synced(json!({"id": "a"})))
      .unwrap();

    let found = store
      .bulk_get(Table::Projects, &["missing".to_string(), "a".to_string()])
      .unwrap();
    assert_eq!(found.len(), 2);
    assert!(found[0].is_none());
    assert_eq!(found[1].as_ref().unwrap().data["id"], "a");
  }

  #[test]
  fn test_set_synced_and_delete() {
    let store = store();
    store
      .put(Table::FormSubmissions, &CachedRecord::local(json!({"id": "f1"})))
      .unwrap();

    assert!(store.set_synced(Table::FormSubmissions, "f1", true).unwrap());
    assert!(store.get(Table::FormSubmissions, "f1").unwrap().unwrap().synced);
    assert!(!store.set_synced(Table::FormSubmissions, "nope", true).unwrap());

    assert!(store.delete(Table::FormSubmissions, "f1").unwrap());
    assert!(store.get(Table::FormSubmissions, "f1").unwrap().is_none());
  }

  #[test]
  fn test_clear_entities_keeps_control_tables() {
    let store = store();
    store
      .put(Table::Projects, &CachedRecord::synced(json!({"id": "p"})))
      .unwrap();
    store.set_meta("lastSyncedAt", "2024-01-01T00:00:00Z").unwrap();

    store.clear_entities().unwrap();
    assert_eq!(store.count(Table::Projects).unwrap(), 0);
    assert!(store.get_meta("lastSyncedAt").unwrap().is_some());

    store.clear_all().unwrap();
    assert!(store.get_meta("lastSyncedAt").unwrap().is_none());
  }

  #[test]
  fn test_file_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    {
      let store = SqliteStore::open(Some(&path)).unwrap();
      store
        .put(Table::Beneficiaries, &CachedRecord::local(json!({"id": "b1"})))
        .unwrap();
    }

    let store = SqliteStore::open(Some(&path)).unwrap();
    let record = store.get(Table::Beneficiaries, "b1").unwrap().unwrap();
    assert!(!record.synced);
  }

  #[test]
  fn test_noop_store_refuses_mutations() {
    let store = NoopStore;
    assert!(!store.is_persistent());
    assert_eq!(store.count(Table::Projects).unwrap(), 0);
    assert!(store.list_mutations().unwrap().is_empty());
  }
}
