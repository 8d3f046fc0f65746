//! libSQL backend — async `Store` trait implementation.
//!
//! Stores a single connection that is reused for all operations.
//! `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::providers::ProviderKind;
use crate::store::migrations;
use crate::store::traits::{ActivityRecord, ProviderConnection, Rule, Store, WatchLease};

/// libSQL store backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Open(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    // Try SQLite datetime() output without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Parse a provider string from the DB.
fn str_to_provider(s: &str) -> Result<ProviderKind, StoreError> {
    s.parse()
        .map_err(|_| StoreError::Query(format!("Unknown provider in row: {s}")))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<i64>` to libsql Value.
fn opt_integer(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a ProviderConnection.
fn row_to_connection(row: &libsql::Row) -> Result<ProviderConnection, StoreError> {
    let q = |e: libsql::Error| StoreError::Query(format!("connection row parse: {e}"));
    let provider_str: String = row.get(1).map_err(q)?;
    let expires_str: Option<String> = row.get(5).ok();
    let connected_str: String = row.get(6).map_err(q)?;

    Ok(ProviderConnection {
        user_id: row.get(0).map_err(q)?,
        provider: str_to_provider(&provider_str)?,
        email: row.get(2).map_err(q)?,
        access_token_enc: row.get(3).ok(),
        refresh_token_enc: row.get(4).ok(),
        token_expires_at: parse_optional_datetime(&expires_str),
        connected_at: parse_datetime(&connected_str),
        watch_expires_at_ms: row.get(7).ok(),
    })
}

/// Map a libsql Row to a Rule.
fn row_to_rule(row: &libsql::Row) -> Result<Rule, StoreError> {
    let q = |e: libsql::Error| StoreError::Query(format!("rule row parse: {e}"));
    let id_str: String = row.get(0).map_err(q)?;
    let enabled: i64 = row.get(5).map_err(q)?;

    Ok(Rule {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        user_id: row.get(1).map_err(q)?,
        name: row.get(2).map_err(q)?,
        prompt: row.get(3).map_err(q)?,
        destination: row.get(4).map_err(q)?,
        enabled: enabled != 0,
        order: row.get(6).map_err(q)?,
    })
}

/// Map a libsql Row to an ActivityRecord.
fn row_to_activity(row: &libsql::Row) -> Result<ActivityRecord, StoreError> {
    let q = |e: libsql::Error| StoreError::Query(format!("activity row parse: {e}"));
    let processed_str: String = row.get(2).map_err(q)?;
    let provider_str: String = row.get(6).map_err(q)?;

    Ok(ActivityRecord {
        user_id: row.get(0).map_err(q)?,
        key: row.get(1).map_err(q)?,
        processed_at: parse_datetime(&processed_str),
        subject: row.get(3).map_err(q)?,
        rule_applied: row.get(4).map_err(q)?,
        destination: row.get(5).map_err(q)?,
        provider: str_to_provider(&provider_str)?,
        message_id: row.get(7).map_err(q)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

const CONNECTION_COLUMNS: &str = "user_id, provider, email, access_token_enc, refresh_token_enc, token_expires_at, connected_at, watch_expires_at_ms";

const ACTIVITY_COLUMNS: &str =
    "user_id, row_key, processed_at, subject, rule_applied, destination, provider, message_id";

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Connections ─────────────────────────────────────────────────

    async fn upsert_connection(&self, connection: &ProviderConnection) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO connections (user_id, provider, email, access_token_enc, refresh_token_enc, token_expires_at, connected_at, watch_expires_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                connection.user_id.as_str(),
                connection.provider.as_str(),
                connection.email.as_str(),
                opt_text_owned(connection.access_token_enc.clone()),
                opt_text_owned(connection.refresh_token_enc.clone()),
                opt_text_owned(connection.token_expires_at.map(|d| d.to_rfc3339())),
                connection.connected_at.to_rfc3339(),
                opt_integer(connection.watch_expires_at_ms),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("upsert_connection: {e}")))?;

        debug!(user_id = %connection.user_id, provider = %connection.provider, "Connection upserted");
        Ok(())
    }

    async fn get_connection(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> Result<Option<ProviderConnection>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CONNECTION_COLUMNS} FROM connections WHERE user_id = ?1 AND provider = ?2"
                ),
                params![user_id, provider.as_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_connection: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_connection(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_connection: {e}"))),
        }
    }

    async fn delete_connection(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "DELETE FROM connections WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider.as_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete_connection: {e}")))?;
        Ok(())
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn upsert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO rules (id, user_id, name, prompt, destination, enabled, sort_order) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rule.id.to_string(),
                rule.user_id.as_str(),
                rule.name.as_str(),
                rule.prompt.as_str(),
                rule.destination.as_str(),
                if rule.enabled { 1i64 } else { 0i64 },
                rule.order,
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("upsert_rule: {e}")))?;

        debug!(rule_id = %rule.id, name = %rule.name, "Rule upserted");
        Ok(())
    }

    async fn list_rules(&self, user_id: &str) -> Result<Vec<Rule>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id, user_id, name, prompt, destination, enabled, sort_order FROM rules WHERE user_id = ?1 ORDER BY sort_order ASC",
                params![user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }

    async fn delete_rule(&self, user_id: &str, rule_id: Uuid) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "DELETE FROM rules WHERE user_id = ?1 AND id = ?2",
                params![user_id, rule_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete_rule: {e}")))?;
        Ok(())
    }

    // ── Processed messages ──────────────────────────────────────────

    async fn is_processed(
        &self,
        provider: ProviderKind,
        message_id: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM processed_messages WHERE provider = ?1 AND message_id = ?2",
                params![provider.as_str(), message_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("is_processed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count > 0)
            }
            _ => Ok(false),
        }
    }

    async fn mark_processed(
        &self,
        provider: ProviderKind,
        message_id: &str,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO processed_messages (provider, message_id, processed_at) VALUES (?1, ?2, ?3)",
                params![provider.as_str(), message_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_processed: {e}")))?;
        Ok(())
    }

    // ── Activity ────────────────────────────────────────────────────

    async fn append_activity(
        &self,
        record: &ActivityRecord,
        cap: usize,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO activity ({ACTIVITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                record.user_id.as_str(),
                record.key.as_str(),
                record.processed_at.to_rfc3339(),
                record.subject.as_str(),
                record.rule_applied.as_str(),
                record.destination.as_str(),
                record.provider.as_str(),
                record.message_id.as_str(),
            ],
        )
        .await
        .map_err(|e| StoreError::Query(format!("append_activity insert: {e}")))?;

        // Row keys sort newest-first; everything past `cap` is the oldest
        // overflow. Not transactional with the insert, so a concurrent append
        // can leave the log briefly over cap. The next append trims it.
        let mut rows = conn
            .query(
                "SELECT row_key FROM activity WHERE user_id = ?1 ORDER BY row_key ASC",
                params![record.user_id.as_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_activity enumerate: {e}")))?;

        let mut keys: Vec<String> = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(key) = row.get::<String>(0) {
                keys.push(key);
            }
        }

        for key in keys.iter().skip(cap) {
            conn.execute(
                "DELETE FROM activity WHERE user_id = ?1 AND row_key = ?2",
                params![record.user_id.as_str(), key.as_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_activity trim: {e}")))?;
        }

        if keys.len() > cap {
            debug!(
                user_id = %record.user_id,
                trimmed = keys.len() - cap,
                "Activity log trimmed to cap"
            );
        }
        Ok(())
    }

    async fn list_activity(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ACTIVITY_COLUMNS} FROM activity WHERE user_id = ?1 ORDER BY row_key ASC LIMIT ?2"
                ),
                params![user_id, limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_activity: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            records.push(row_to_activity(&row)?);
        }
        Ok(records)
    }

    // ── Email index ─────────────────────────────────────────────────

    async fn upsert_email_index(
        &self,
        provider: ProviderKind,
        email: &str,
        user_id: &str,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO user_email_index (provider, email, user_id) VALUES (?1, ?2, ?3)",
                params![provider.as_str(), email.to_lowercase(), user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert_email_index: {e}")))?;
        Ok(())
    }

    async fn lookup_user_by_email(
        &self,
        provider: ProviderKind,
        email: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT user_id FROM user_email_index WHERE provider = ?1 AND email = ?2",
                params![provider.as_str(), email.to_lowercase()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("lookup_user_by_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let user_id: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("lookup_user_by_email: {e}")))?;
                Ok(Some(user_id))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("lookup_user_by_email: {e}"))),
        }
    }

    async fn delete_email_index(
        &self,
        provider: ProviderKind,
        email: &str,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "DELETE FROM user_email_index WHERE provider = ?1 AND email = ?2",
                params![provider.as_str(), email.to_lowercase()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete_email_index: {e}")))?;
        Ok(())
    }

    // ── Watch leases ────────────────────────────────────────────────

    async fn upsert_watch_lease(
        &self,
        user_id: &str,
        expires_at_ms: i64,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO watch_leases (user_id, expires_at_ms, updated_at) VALUES (?1, ?2, ?3)",
                params![user_id, expires_at_ms, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert_watch_lease: {e}")))?;
        Ok(())
    }

    async fn list_watch_leases(&self) -> Result<Vec<WatchLease>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT user_id, expires_at_ms, updated_at FROM watch_leases ORDER BY user_id ASC",
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_watch_leases: {e}")))?;

        let mut leases = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let q = |e: libsql::Error| StoreError::Query(format!("watch lease row parse: {e}"));
            let updated_str: String = row.get(2).map_err(q)?;
            leases.push(WatchLease {
                user_id: row.get(0).map_err(q)?,
                expires_at_ms: row.get(1).map_err(q)?,
                updated_at: parse_datetime(&updated_str),
            });
        }
        Ok(leases)
    }

    async fn delete_watch_lease(&self, user_id: &str) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "DELETE FROM watch_leases WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete_watch_lease: {e}")))?;
        Ok(())
    }
}
