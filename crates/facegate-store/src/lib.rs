//! facegate-store — SQLite persistence for enrolled users.
//!
//! One row per user: unique name, raw embedding blob, access flag. Readers
//! get an immutable [`UserSnapshot`]; after any mutation the caller takes a
//! fresh one.

use chrono::Utc;
use facegate_core::{Embedding, EnrolledUser, UserSnapshot};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("user \"{0}\" is already registered")]
    NameConflict(String),
    #[error("user name must not be empty")]
    EmptyName,
    #[error("user not found: {0}")]
    NotFound(String),
    #[error("corrupt embedding for user \"{name}\": {len} bytes is not a whole number of f32 values")]
    CorruptEmbedding { name: String, len: usize },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// User row without the embedding, for admin listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    pub id: i64,
    pub name: String,
    pub access: bool,
    pub created_at: String,
}

pub struct UserStore {
    conn: Connection,
}

impl UserStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        let store = Self { conn };
        store.ensure_schema()?;
        tracing::info!(path = %db_path.display(), "user store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS users (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL UNIQUE,
              embedding BLOB NOT NULL,
              access INTEGER NOT NULL DEFAULT 0,
              created_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// All users with embeddings, in enrollment order.
    pub fn list_enrolled_users(&self) -> Result<UserSnapshot, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, embedding, access FROM users ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, bool>(2)?,
            ))
        })?;

        let mut users = Vec::new();
        for row in rows {
            let (name, blob, access) = row?;
            let values = decode_embedding(&blob).ok_or_else(|| StoreError::CorruptEmbedding {
                name: name.clone(),
                len: blob.len(),
            })?;
            users.push(EnrolledUser {
                name,
                embedding: Embedding::new(values),
                access,
            });
        }

        tracing::debug!(count = users.len(), "loaded user snapshot");
        Ok(UserSnapshot::new(users))
    }

    /// Admin listing, in enrollment order.
    pub fn list_users(&self) -> Result<Vec<UserSummary>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, access, created_at FROM users ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(UserSummary {
                id: row.get(0)?,
                name: row.get(1)?,
                access: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn contains(&self, name: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT id FROM users WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a new user. Names are trimmed; empty and duplicate names are
    /// rejected and nothing is written.
    pub fn enroll_user(
        &self,
        name: &str,
        embedding: &Embedding,
        access: bool,
    ) -> Result<EnrolledUser, StoreError> {
        let name = validate_name(name)?;
        let created_at = Utc::now().to_rfc3339();

        let inserted = self.conn.execute(
            "INSERT INTO users(name, embedding, access, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, encode_embedding(&embedding.values), access, created_at],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(StoreError::NameConflict(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(user = name, access, dim = embedding.len(), "user enrolled");
        Ok(EnrolledUser {
            name: name.to_string(),
            embedding: embedding.clone(),
            access,
        })
    }

    pub fn set_access(&self, name: &str, access: bool) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE users SET access = ?1 WHERE name = ?2",
            params![access, name],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(name.to_string()));
        }
        tracing::info!(user = name, access, "access updated");
        Ok(())
    }

    /// Flip a user's access flag and return the new value.
    pub fn toggle_access(&self, name: &str) -> Result<bool, StoreError> {
        let current: Option<bool> = self
            .conn
            .query_row("SELECT access FROM users WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        let current = current.ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        self.set_access(name, !current)?;
        Ok(!current)
    }

    pub fn remove_user(&self, name: &str) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute("DELETE FROM users WHERE name = ?1", params![name])?;
        if changed == 0 {
            return Err(StoreError::NotFound(name.to_string()));
        }
        tracing::info!(user = name, "user removed");
        Ok(())
    }
}

/// Trim a requested user name, rejecting empty names.
pub fn validate_name(name: &str) -> Result<&str, StoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(StoreError::EmptyName);
    }
    Ok(trimmed)
}

/// Embedding blob: little-endian f32 values, no header.
pub fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`encode_embedding`]. `None` if the length is not a multiple of 4.
pub fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
