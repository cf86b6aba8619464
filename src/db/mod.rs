pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// Database connection wrapper for the offline store
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database at `path`, or at the default location
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open a private in-memory database
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("offline.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Hand the connection over to its owner
  pub fn into_conn(self) -> Connection {
    self.conn
  }
}

/// Directory holding the database and log files
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("fieldsync"))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_migrations_are_repeatable() {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().unwrap();

    let tables: i64 = db
      .conn
      .query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
         ('records', 'pending_mutations', 'auth_cache', 'sync_meta')",
        [],
        |row| row.get(0),
      )
      .unwrap();
    assert_eq!(tables, 4);
  }

  #[test]
  fn test_open_creates_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("offline.db");

    Database::open(Some(&path)).unwrap();
    assert!(path.exists());
  }
}
