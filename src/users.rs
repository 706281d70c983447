//! User-status collaborator.
//!
//! The credential lifecycle never owns user rows; it only flips the
//! "connected" flag and asks whether a user still exists.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Sets the user's integration-connected flag.
    async fn set_connected(&self, user_id: &str, connected: bool) -> Result<()>;

    /// True when the user exists and is active.
    async fn user_exists(&self, user_id: &str) -> Result<bool>;

    /// Users currently flagged as connected.
    async fn connected_users(&self) -> Result<Vec<String>>;
}

/// SQLite-backed user directory.
///
/// # Schema
/// ```sql
/// CREATE TABLE users (
///     id TEXT PRIMARY KEY,
///     is_active INTEGER NOT NULL DEFAULT 1,
///     provider_connected INTEGER NOT NULL DEFAULT 0
/// );
/// ```
pub struct SqliteUserDirectory {
    conn: Mutex<Connection>,
}

impl SqliteUserDirectory {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open user database")?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                is_active INTEGER NOT NULL DEFAULT 1,
                provider_connected INTEGER NOT NULL DEFAULT 0
            )
            "#,
            [],
        )
        .context("Failed to create users table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates or reactivates a user.
    pub fn upsert_user(&self, user_id: &str, is_active: bool) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO users (id, is_active) VALUES (?1, ?2) \
                 ON CONFLICT(id) DO UPDATE SET is_active = excluded.is_active",
                params![user_id, is_active],
            )
            .context("Failed to upsert user")?;
        Ok(())
    }

    pub fn is_connected(&self, user_id: &str) -> Result<bool> {
        let connected: Option<bool> = self
            .lock()?
            .query_row(
                "SELECT provider_connected FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read user")?;
        Ok(connected.unwrap_or(false))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("user directory lock poisoned"))
    }
}

#[async_trait]
impl UserDirectory for SqliteUserDirectory {
    async fn set_connected(&self, user_id: &str, connected: bool) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE users SET provider_connected = ?2 WHERE id = ?1",
                params![user_id, connected],
            )
            .context("Failed to update connection flag")?;
        Ok(())
    }

    async fn user_exists(&self, user_id: &str) -> Result<bool> {
        let active: Option<bool> = self
            .lock()?
            .query_row(
                "SELECT is_active FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up user")?;
        Ok(active.unwrap_or(false))
    }

    async fn connected_users(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id FROM users WHERE provider_connected = 1 ORDER BY id")
            .context("Failed to prepare query")?;
        let users = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to execute query")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to read results")?;
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_flag_roundtrip() {
        let users = SqliteUserDirectory::open(":memory:").unwrap();
        users.upsert_user("u1", true).unwrap();
        users.upsert_user("u2", true).unwrap();

        users.set_connected("u1", true).await.unwrap();
        assert!(users.is_connected("u1").unwrap());
        assert_eq!(users.connected_users().await.unwrap(), vec!["u1".to_string()]);

        users.set_connected("u1", false).await.unwrap();
        assert!(users.connected_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_exists_requires_active() {
        let users = SqliteUserDirectory::open(":memory:").unwrap();
        users.upsert_user("active", true).unwrap();
        users.upsert_user("gone", false).unwrap();

        assert!(users.user_exists("active").await.unwrap());
        assert!(!users.user_exists("gone").await.unwrap());
        assert!(!users.user_exists("never-existed").await.unwrap());
    }
}
