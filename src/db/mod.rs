pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::Path;

/// Database connection wrapper shared by the durable store and cache storage
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database at `path`, applying pending migrations
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    let mut db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// Open a private in-memory database
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

    let mut db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  /// Current schema version (`PRAGMA user_version`)
  pub fn schema_version(&self) -> Result<u32> {
    self
      .conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))
  }

  /// Apply every migration newer than the stored version in one transaction
  fn run_migrations(&mut self) -> Result<()> {
    let current = self.schema_version()? as usize;
    if current >= schema::MIGRATIONS.len() {
      return Ok(());
    }

    let tx = self
      .conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin migration: {}", e))?;

    for (i, migration) in schema::MIGRATIONS.iter().enumerate().skip(current) {
      tx.execute_batch(migration)
        .map_err(|e| eyre!("Failed to run migration {}: {}", i + 1, e))?;
    }

    tx.pragma_update(None, "user_version", schema::MIGRATIONS.len() as u32)
      .map_err(|e| eyre!("Failed to record schema version: {}", e))?;
    tx.commit()
      .map_err(|e| eyre!("Failed to commit migrations: {}", e))?;

    tracing::debug!(
      from = current,
      to = schema::MIGRATIONS.len(),
      "database schema upgraded"
    );
    Ok(())
  }

  pub fn into_connection(self) -> Connection {
    self.conn
  }
}
