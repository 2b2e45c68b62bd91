//! SQLite-backed encrypted account store
//!
//! The store is the single durable resource shared across request paths.
//! Records are sealed with the caller key when one is configured; a `meta`
//! table carries the schema version and a key-check token so a wrong key is
//! caught at open time, not on first record read. Writers to the same account
//! are serialized through a per-record lock; distinct accounts do not block
//! each other.

use super::crypto::RecordCipher;
use crate::domain::account::Account;
use crate::domain::dialog::Dialog;
use crate::domain::shared::{EngineError, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SCHEMA_VERSION: &str = "1";
const KEY_CHECK_PLAINTEXT: &[u8] = b"sipis-key-check";

#[derive(Debug)]
pub struct Store {
    pool: SqlitePool,
    cipher: Option<RecordCipher>,
    record_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Store {
    /// Open (creating schema if absent) the store at `path`, optionally
    /// encrypted with the supplied 16-byte key.
    pub async fn open(path: &str, key: Option<[u8; 16]>) -> Result<Self> {
        info!(path, encrypted = key.is_some(), "opening account store");

        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            cipher: key.map(|k| RecordCipher::new(&k)),
            record_locks: Mutex::new(HashMap::new()),
        };

        store.init_schema().await?;
        store.verify_key().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                record BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dialogs (
                call_id TEXT PRIMARY KEY,
                record BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        match self.get_meta("schema_version").await? {
            None => {
                self.set_meta("schema_version", SCHEMA_VERSION).await?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(EngineError::Schema(format!(
                    "store schema version {} is incompatible with {}",
                    v, SCHEMA_VERSION
                )));
            }
        }
        Ok(())
    }

    /// Validate the configured key against the key-check token written on
    /// first open, so a mismatch fails here rather than yielding garbage.
    async fn verify_key(&self) -> Result<()> {
        let existing = self.get_meta("key_check").await?;
        match (&self.cipher, existing) {
            (Some(cipher), Some(token)) => {
                let opened = cipher.open_base64(&token)?;
                if opened != KEY_CHECK_PLAINTEXT {
                    return Err(EngineError::Decryption(
                        "key-check token mismatch".to_string(),
                    ));
                }
                Ok(())
            }
            (Some(cipher), None) => {
                let token = cipher.seal_base64(KEY_CHECK_PLAINTEXT)?;
                self.set_meta("key_check", &token).await
            }
            (None, Some(token)) => {
                if token != "plaintext" {
                    return Err(EngineError::Decryption(
                        "store is encrypted but no key was supplied".to_string(),
                    ));
                }
                Ok(())
            }
            (None, None) => self.set_meta("key_check", "plaintext").await,
        }
    }

    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Per-account write lock; writers to distinct accounts proceed in parallel.
    async fn record_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.record_locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn encode<T: serde::Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let plain = serde_json::to_vec(value)
            .map_err(|e| EngineError::Storage(format!("record encode failed: {}", e)))?;
        match &self.cipher {
            Some(cipher) => cipher.seal(&plain),
            None => Ok(plain),
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, record: &[u8]) -> Result<T> {
        let plain = match &self.cipher {
            Some(cipher) => cipher.open(record)?,
            None => record.to_vec(),
        };
        serde_json::from_slice(&plain)
            .map_err(|e| EngineError::Storage(format!("record decode failed: {}", e)))
    }

    pub async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT record FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let record: Vec<u8> = row.get("record");
                Ok(Some(self.decode(&record)?))
            }
            None => Ok(None),
        }
    }

    /// Insert or update one account record; idempotent on account identity.
    pub async fn upsert_account(&self, account: &Account) -> Result<()> {
        let lock = self.record_lock(&account.id).await;
        let _guard = lock.lock().await;

        let record = self.encode(account)?;
        sqlx::query(
            "INSERT INTO accounts (id, record, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at",
        )
        .bind(&account.id)
        .bind(record)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(account = %account.id, state = ?account.state, "account persisted");
        Ok(())
    }

    pub async fn delete_account(&self, id: &str) -> Result<()> {
        let lock = self.record_lock(id).await;
        let _guard = lock.lock().await;

        sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        debug!(account = id, "account deleted");
        Ok(())
    }

    /// Snapshot of all account records. Records that fail to decode are
    /// skipped with a warning rather than poisoning the whole listing.
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query("SELECT id, record FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut accounts = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let record: Vec<u8> = row.get("record");
            match self.decode::<Account>(&record) {
                Ok(account) => accounts.push(account),
                Err(EngineError::Decryption(e)) => {
                    // A wrong key is caught at open; a per-record tag failure
                    // here means the record itself is damaged.
                    return Err(EngineError::Decryption(e));
                }
                Err(e) => {
                    warn!(account = %id, error = %e, "skipping undecodable account record");
                }
            }
        }
        Ok(accounts)
    }

    /// Persist in-flight dialogs for resumption (`stop(RememberInstances)`).
    pub async fn save_dialogs(&self, dialogs: &[Dialog]) -> Result<()> {
        self.clear_dialogs().await?;
        for dialog in dialogs {
            let record = self.encode(dialog)?;
            sqlx::query("INSERT INTO dialogs (call_id, record) VALUES (?, ?)")
                .bind(&dialog.call_id)
                .bind(record)
                .execute(&self.pool)
                .await?;
        }
        debug!(count = dialogs.len(), "dialog snapshot saved");
        Ok(())
    }

    /// Load and consume any remembered dialog snapshot.
    pub async fn take_dialogs(&self) -> Result<Vec<Dialog>> {
        let rows = sqlx::query("SELECT record FROM dialogs")
            .fetch_all(&self.pool)
            .await?;
        let mut dialogs = Vec::with_capacity(rows.len());
        for row in rows {
            let record: Vec<u8> = row.get("record");
            dialogs.push(self.decode(&record)?);
        }
        self.clear_dialogs().await?;
        Ok(dialogs)
    }

    pub async fn clear_dialogs(&self) -> Result<()> {
        sqlx::query("DELETE FROM dialogs").execute(&self.pool).await?;
        Ok(())
    }

    /// Flush and release the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
