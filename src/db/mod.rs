use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::Path;

/// Open or create a SQLite database at `path` and apply `schema`.
pub fn open(path: &Path, schema: &str) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
  }

  let conn = Connection::open(path)
    .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

  run_migrations(&conn, schema)?;
  Ok(conn)
}

/// Open a throwaway in-memory database with `schema` applied.
#[cfg(test)]
pub fn open_in_memory(schema: &str) -> Result<Connection> {
  let conn =
    Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;

  run_migrations(&conn, schema)?;
  Ok(conn)
}

fn run_migrations(conn: &Connection, schema: &str) -> Result<()> {
  conn
    .execute_batch(schema)
    .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
  Ok(())
}
