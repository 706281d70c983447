//! Encrypted credential storage using SQLite.
//!
//! One row per (user, provider). Secrets are encrypted at rest using
//! AES-256-GCM; bookkeeping columns (attempts, failures, revision) are plain.

use super::{
    encryption::Cipher, Credential, CredentialRecord, SecretIntegrity, SecretState, TokenBundle,
};
use crate::error::{CryptoError, StoreError};
use crate::events::{CredentialEvent, EventSink};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const RECORD_COLUMNS: &str = r#"
    user_id, provider,
    access_token_ciphertext, refresh_token_ciphertext,
    scope, expires_at, created_at, updated_at,
    last_refresh_attempt, refresh_failure_count, last_used_at,
    revision, deleted_at, grace_period_until
"#;

/// Aggregate view of the credential table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenStatistics {
    pub total: u64,
    /// Not expired, or non-expiring
    pub valid: u64,
    pub expired: u64,
    /// Has a refresh token
    pub refreshable: u64,
    pub average_failure_count: f64,
    /// Most recent successful write
    pub last_activity: Option<DateTime<Utc>>,
}

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE oauth_credentials (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     access_token_ciphertext TEXT NOT NULL,  -- base64(nonce || ciphertext)
///     refresh_token_ciphertext TEXT,          -- base64(nonce || ciphertext)
///     scope TEXT NOT NULL,
///     expires_at TEXT,                        -- RFC 3339, NULL = never expires
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,               -- last successful store
///     last_refresh_attempt TEXT,
///     refresh_failure_count INTEGER NOT NULL,
///     last_used_at TEXT,
///     revision INTEGER NOT NULL,              -- bumped on every store
///     deleted_at TEXT,                        -- soft delete (retention)
///     grace_period_until TEXT,
///     UNIQUE(user_id, provider)
/// );
/// ```
///
/// Timestamps are written as fixed-width UTC RFC 3339 (microseconds, `Z`),
/// so text comparison in SQL is chronological.
///
/// # Concurrency
/// - Every operation is a single statement under the connection mutex; the
///   mutex is never held across an `.await`
/// - `record_failure` only applies when the row's revision still matches the
///   one observed before the refresh started. A successful `store` bumps the
///   revision, so a late failure increment can never overwrite it
/// - Soft-deleted rows are invisible to every read except `list_all`
pub struct CredentialStore {
    conn: Mutex<Connection>,
    cipher: Cipher,
    events: Arc<dyn EventSink>,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (or `:memory:`)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    /// * `events` - Sink for write events
    ///
    /// # Returns
    /// * `Ok(CredentialStore)` - Initialized store
    /// * `Err(StoreError::Crypto)` - Key is missing or invalid (fatal)
    /// * `Err(StoreError::Database)` - Database could not be opened
    pub fn open<P: AsRef<Path>>(
        db_path: P,
        encryption_key: &str,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, StoreError> {
        let cipher = Cipher::from_base64_key(encryption_key)?;
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn, cipher, events)
    }

    pub fn with_connection(
        conn: Connection,
        cipher: Cipher,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_credentials (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                access_token_ciphertext TEXT NOT NULL,
                refresh_token_ciphertext TEXT,
                scope TEXT NOT NULL DEFAULT '',
                expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_refresh_attempt TEXT,
                refresh_failure_count INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT,
                revision INTEGER NOT NULL DEFAULT 1,
                deleted_at TEXT,
                grace_period_until TEXT,
                UNIQUE(user_id, provider)
            );
            CREATE INDEX IF NOT EXISTS idx_oauth_credentials_expires
                ON oauth_credentials(expires_at);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
            events,
        })
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Stores a token bundle for a user and provider (upsert).
    ///
    /// Both secrets are encrypted before the statement is built. On conflict
    /// the secrets, scope and expiry are replaced, `refresh_failure_count` is
    /// reset to 0 and `revision` is bumped. `last_refresh_attempt` is left as
    /// it was: a refresh writes it just before calling the provider.
    ///
    /// A new issuance supersedes a pending soft delete: `deleted_at` and
    /// `grace_period_until` are cleared. Refreshes must use
    /// [`Self::store_refreshed`] instead, which never creates a row.
    ///
    /// # Returns
    /// * `Ok(Credential)` - The credential as now stored
    /// * `Err` - If encryption or the database write fails
    pub fn store(
        &self,
        user_id: &str,
        provider: &str,
        bundle: &TokenBundle,
    ) -> Result<Credential, StoreError> {
        let access_ciphertext = self.cipher.encrypt(&bundle.access_token)?;
        let refresh_ciphertext = bundle
            .refresh_token
            .as_deref()
            .map(|token| self.cipher.encrypt(token))
            .transpose()?;

        let expires_at = bundle.expires_at.map(format_ts);
        let now = format_ts(Utc::now());

        let (revision, updated_at, last_refresh_attempt): (i64, String, Option<String>) = {
            let conn = self.lock()?;
            conn.query_row(
                r#"
                INSERT INTO oauth_credentials (
                    user_id, provider,
                    access_token_ciphertext, refresh_token_ciphertext,
                    scope, expires_at, created_at, updated_at,
                    refresh_failure_count, revision
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 0, 1)
                ON CONFLICT(user_id, provider) DO UPDATE SET
                    access_token_ciphertext = excluded.access_token_ciphertext,
                    refresh_token_ciphertext = excluded.refresh_token_ciphertext,
                    scope = excluded.scope,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at,
                    refresh_failure_count = 0,
                    revision = oauth_credentials.revision + 1,
                    deleted_at = NULL,
                    grace_period_until = NULL
                RETURNING revision, updated_at, last_refresh_attempt
                "#,
                params![
                    user_id,
                    provider,
                    access_ciphertext,
                    refresh_ciphertext,
                    bundle.scope,
                    expires_at,
                    now,
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?
        };

        self.events.emit(CredentialEvent::Stored {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            revision,
        });

        Ok(Credential {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            access_token: bundle.access_token.clone(),
            refresh_token: bundle.refresh_token.clone(),
            scope: bundle.scope.clone(),
            expires_at: bundle.expires_at,
            updated_at: parse_ts(&updated_at, 1)?,
            last_refresh_attempt: parse_opt_ts(last_refresh_attempt, 2)?,
            refresh_failure_count: 0,
            revision,
        })
    }

    /// Writes a refreshed bundle over the row the refresh started from.
    ///
    /// Applies only while the live row still carries `observed_revision`. A
    /// credential deleted (or re-stored) while the provider call was in
    /// flight is left alone, so a late refresh can never resurrect it.
    ///
    /// # Returns
    /// * `Ok(Some(Credential))` - Written; failure count reset, revision bumped
    /// * `Ok(None)` - Superseded: the row is gone or has a newer revision
    pub fn store_refreshed(
        &self,
        user_id: &str,
        provider: &str,
        bundle: &TokenBundle,
        observed_revision: i64,
    ) -> Result<Option<Credential>, StoreError> {
        let access_ciphertext = self.cipher.encrypt(&bundle.access_token)?;
        let refresh_ciphertext = bundle
            .refresh_token
            .as_deref()
            .map(|token| self.cipher.encrypt(token))
            .transpose()?;

        let row: Option<(i64, String, Option<String>)> = {
            let conn = self.lock()?;
            conn.query_row(
                r#"
                UPDATE oauth_credentials
                SET access_token_ciphertext = ?4,
                    refresh_token_ciphertext = ?5,
                    scope = ?6,
                    expires_at = ?7,
                    updated_at = ?8,
                    refresh_failure_count = 0,
                    revision = revision + 1
                WHERE user_id = ?1 AND provider = ?2 AND revision = ?3 AND deleted_at IS NULL
                RETURNING revision, updated_at, last_refresh_attempt
                "#,
                params![
                    user_id,
                    provider,
                    observed_revision,
                    access_ciphertext,
                    refresh_ciphertext,
                    bundle.scope,
                    bundle.expires_at.map(format_ts),
                    format_ts(Utc::now()),
                ],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
        };

        let Some((revision, updated_at, last_refresh_attempt)) = row else {
            return Ok(None);
        };

        self.events.emit(CredentialEvent::Stored {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            revision,
        });

        Ok(Some(Credential {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            access_token: bundle.access_token.clone(),
            refresh_token: bundle.refresh_token.clone(),
            scope: bundle.scope.clone(),
            expires_at: bundle.expires_at,
            updated_at: parse_ts(&updated_at, 1)?,
            last_refresh_attempt: parse_opt_ts(last_refresh_attempt, 2)?,
            refresh_failure_count: 0,
            revision,
        }))
    }

    /// Retrieves and decrypts a credential.
    ///
    /// # Returns
    /// * `Ok(Some(Credential))` - Found and decrypted
    /// * `Ok(None)` - No live credential for this pair
    /// * `Err(StoreError::DecryptionFailed)` - Row exists but a secret is unreadable
    pub fn get(&self, user_id: &str, provider: &str) -> Result<Option<Credential>, StoreError> {
        let Some(record) = self.get_record(user_id, provider)? else {
            return Ok(None);
        };
        self.decrypt_record(record).map(Some)
    }

    /// Decrypts a record fetched earlier.
    pub fn decrypt_record(&self, record: CredentialRecord) -> Result<Credential, StoreError> {
        let corrupted = |_: CryptoError| StoreError::DecryptionFailed {
            user_id: record.user_id.clone(),
            provider: record.provider.clone(),
        };

        let access_token = self
            .cipher
            .decrypt(&record.access_token_ciphertext)
            .map_err(corrupted)?;
        let refresh_token = record
            .refresh_token_ciphertext
            .as_deref()
            .map(|c| self.cipher.decrypt(c))
            .transpose()
            .map_err(corrupted)?;

        Ok(Credential {
            access_token,
            refresh_token,
            user_id: record.user_id,
            provider: record.provider,
            scope: record.scope,
            expires_at: record.expires_at,
            updated_at: record.updated_at,
            last_refresh_attempt: record.last_refresh_attempt,
            refresh_failure_count: record.refresh_failure_count,
            revision: record.revision,
        })
    }

    /// Reads the raw row for a pair without decrypting anything.
    pub fn get_record(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM oauth_credentials \
             WHERE user_id = ?1 AND provider = ?2 AND deleted_at IS NULL"
        );
        let record = conn
            .query_row(&sql, params![user_id, provider], record_from_row)
            .optional()?;
        Ok(record)
    }

    /// Hard-deletes a credential. Deleting twice is not an error.
    ///
    /// # Returns
    /// * `Ok(true)` - A row was removed
    /// * `Ok(false)` - Nothing to remove
    pub fn delete(&self, user_id: &str, provider: &str) -> Result<bool, StoreError> {
        let rows = self.lock()?.execute(
            "DELETE FROM oauth_credentials WHERE user_id = ?1 AND provider = ?2",
            params![user_id, provider],
        )?;

        if rows > 0 {
            self.emit_deleted(user_id, provider);
        }
        Ok(rows > 0)
    }

    /// Deletes a credential only if no store happened since `revision` was read.
    ///
    /// This is the last step of the reconciliation double-check: a refresh
    /// that lands between the re-read and the delete bumps the revision and
    /// the delete becomes a no-op.
    pub fn delete_if_unchanged(
        &self,
        user_id: &str,
        provider: &str,
        revision: i64,
    ) -> Result<bool, StoreError> {
        let rows = self.lock()?.execute(
            "DELETE FROM oauth_credentials \
             WHERE user_id = ?1 AND provider = ?2 AND revision = ?3 AND deleted_at IS NULL",
            params![user_id, provider, revision],
        )?;

        if rows > 0 {
            self.emit_deleted(user_id, provider);
        }
        Ok(rows > 0)
    }

    fn emit_deleted(&self, user_id: &str, provider: &str) {
        self.events.emit(CredentialEvent::Deleted {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
        });
    }

    /// Marks the start of a refresh attempt.
    ///
    /// # Returns
    /// * `Ok(false)` - No live row (deleted concurrently)
    pub fn record_attempt(&self, user_id: &str, provider: &str) -> Result<bool, StoreError> {
        let rows = self.lock()?.execute(
            "UPDATE oauth_credentials SET last_refresh_attempt = ?3 \
             WHERE user_id = ?1 AND provider = ?2 AND deleted_at IS NULL",
            params![user_id, provider, format_ts(Utc::now())],
        )?;

        if rows > 0 {
            self.events.emit(CredentialEvent::RefreshAttempted {
                user_id: user_id.to_string(),
                provider: provider.to_string(),
            });
        }
        Ok(rows > 0)
    }

    /// Increments the failure counter for the attempt that observed `revision`.
    ///
    /// # Returns
    /// * `Ok(Some(count))` - New failure count
    /// * `Ok(None)` - Superseded: the row was re-stored (or removed) since
    ///   `revision` was read, so this failure no longer describes it
    pub fn record_failure(
        &self,
        user_id: &str,
        provider: &str,
        revision: i64,
    ) -> Result<Option<u32>, StoreError> {
        let count: Option<u32> = {
            let conn = self.lock()?;
            conn.query_row(
                r#"
                UPDATE oauth_credentials
                SET refresh_failure_count = refresh_failure_count + 1,
                    last_refresh_attempt = ?4
                WHERE user_id = ?1 AND provider = ?2 AND revision = ?3 AND deleted_at IS NULL
                RETURNING refresh_failure_count
                "#,
                params![user_id, provider, revision, format_ts(Utc::now())],
                |row| row.get(0),
            )
            .optional()?
        };

        let event = match count {
            Some(failure_count) => CredentialEvent::FailureRecorded {
                user_id: user_id.to_string(),
                provider: provider.to_string(),
                failure_count,
            },
            None => CredentialEvent::FailureSuperseded {
                user_id: user_id.to_string(),
                provider: provider.to_string(),
            },
        };
        self.events.emit(event);

        Ok(count)
    }

    /// Records that the access token was used for an API call.
    pub fn touch_last_used(&self, user_id: &str, provider: &str) -> Result<bool, StoreError> {
        let rows = self.lock()?.execute(
            "UPDATE oauth_credentials SET last_used_at = ?3 \
             WHERE user_id = ?1 AND provider = ?2 AND deleted_at IS NULL",
            params![user_id, provider, format_ts(Utc::now())],
        )?;
        Ok(rows > 0)
    }

    /// Retention hook: hides a credential from this subsystem until the
    /// retention job hard-deletes it.
    pub fn soft_delete(
        &self,
        user_id: &str,
        provider: &str,
        grace_period: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let rows = self.lock()?.execute(
            "UPDATE oauth_credentials SET deleted_at = ?3, grace_period_until = ?4 \
             WHERE user_id = ?1 AND provider = ?2 AND deleted_at IS NULL",
            params![
                user_id,
                provider,
                format_ts(now),
                format_ts(now + grace_period)
            ],
        )?;
        Ok(rows > 0)
    }

    /// Credentials due for a background refresh.
    ///
    /// Expiry falls within `window` from now (already-expired included), a
    /// refresh token exists, and the failure count is still below
    /// `failure_threshold`. Ordered soonest-expiring first.
    pub fn expiring_within(
        &self,
        window: Duration,
        failure_threshold: u32,
    ) -> Result<Vec<CredentialRecord>, StoreError> {
        let cutoff = format_ts(Utc::now() + window);
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM oauth_credentials \
             WHERE deleted_at IS NULL \
               AND expires_at IS NOT NULL AND expires_at <= ?1 \
               AND refresh_token_ciphertext IS NOT NULL \
               AND refresh_failure_count < ?2 \
             ORDER BY expires_at, user_id, provider"
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![cutoff, failure_threshold], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Every live row, raw.
    pub fn list_records(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM oauth_credentials \
             WHERE deleted_at IS NULL ORDER BY user_id, provider"
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Lists all (user_id, provider) pairs, soft-deleted rows included.
    pub fn list_all(&self) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT user_id, provider FROM oauth_credentials ORDER BY user_id, provider")?;
        let pairs = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, String)>, _>>()?;
        Ok(pairs)
    }

    /// Providers with a live credential for a user.
    pub fn list_by_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT provider FROM oauth_credentials \
             WHERE user_id = ?1 AND deleted_at IS NULL ORDER BY provider",
        )?;
        let providers = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(providers)
    }

    pub fn statistics(&self) -> Result<TokenStatistics, StoreError> {
        let now = format_ts(Utc::now());
        let conn = self.lock()?;
        let stats = conn.query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN expires_at IS NULL OR expires_at > ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN expires_at IS NOT NULL AND expires_at <= ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN refresh_token_ciphertext IS NOT NULL THEN 1 ELSE 0 END), 0),
                COALESCE(AVG(refresh_failure_count), 0.0),
                MAX(updated_at)
            FROM oauth_credentials
            WHERE deleted_at IS NULL
            "#,
            params![now],
            |row| {
                Ok(TokenStatistics {
                    total: row.get::<_, i64>(0)? as u64,
                    valid: row.get::<_, i64>(1)? as u64,
                    expired: row.get::<_, i64>(2)? as u64,
                    refreshable: row.get::<_, i64>(3)? as u64,
                    average_failure_count: row.get(4)?,
                    last_activity: parse_opt_ts(row.get(5)?, 5)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// Attempts to decrypt both secrets of a record.
    pub fn verify_secrets(&self, record: &CredentialRecord) -> SecretIntegrity {
        let check = |ciphertext: &str| match self.cipher.decrypt(ciphertext) {
            Ok(_) => SecretState::Readable,
            Err(_) => SecretState::Corrupted,
        };

        SecretIntegrity {
            access: check(&record.access_token_ciphertext),
            refresh: record
                .refresh_token_ciphertext
                .as_deref()
                .map(check)
                .unwrap_or(SecretState::Absent),
        }
    }

    /// Number of live credentials. Doubles as a reachability probe.
    pub fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM oauth_credentials WHERE deleted_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(value: Option<String>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(&v, idx)).transpose()
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<CredentialRecord> {
    Ok(CredentialRecord {
        user_id: row.get(0)?,
        provider: row.get(1)?,
        access_token_ciphertext: row.get(2)?,
        refresh_token_ciphertext: row.get(3)?,
        scope: row.get(4)?,
        expires_at: parse_opt_ts(row.get(5)?, 5)?,
        created_at: parse_ts(&row.get::<_, String>(6)?, 6)?,
        updated_at: parse_ts(&row.get::<_, String>(7)?, 7)?,
        last_refresh_attempt: parse_opt_ts(row.get(8)?, 8)?,
        refresh_failure_count: row.get(9)?,
        last_used_at: parse_opt_ts(row.get(10)?, 10)?,
        revision: row.get(11)?,
        deleted_at: parse_opt_ts(row.get(12)?, 12)?,
        grace_period_until: parse_opt_ts(row.get(13)?, 13)?,
    })
}
