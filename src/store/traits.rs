//! Unified `Store` trait — single async interface for all persistence.
//!
//! Every entity is mutated exclusively through this trait; the pipeline and
//! background tasks hold an `Arc<dyn Store>` and no other storage state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::providers::ProviderKind;
use crate::store::activity_key::activity_key;

/// A user's connection to a mail provider. Tokens are stored as envelope
/// blobs (base64); an undecryptable token reads as absent, never as an error.
#[derive(Debug, Clone)]
pub struct ProviderConnection {
    pub user_id: String,
    pub provider: ProviderKind,
    /// The provider account's email address, as reported by the provider.
    pub email: String,
    pub access_token_enc: Option<String>,
    pub refresh_token_enc: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub connected_at: DateTime<Utc>,
    /// Push-lease expiry mirror (Gmail only), epoch millis.
    pub watch_expires_at_ms: Option<i64>,
}

/// A user's classification rule. Evaluation order is ascending `order`;
/// names are unique per user, case-insensitively.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    /// Free-text match condition handed to the classifier.
    pub prompt: String,
    /// Label name (Gmail) or folder name (M365) to apply on match.
    pub destination: String,
    pub enabled: bool,
    pub order: i64,
}

/// One entry of the capped per-user audit trail.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub user_id: String,
    /// Reverse-chronological storage key; ascending scan = newest first.
    pub key: String,
    pub processed_at: DateTime<Utc>,
    pub subject: String,
    /// Matched rule name, or "NONE".
    pub rule_applied: String,
    pub destination: String,
    pub provider: ProviderKind,
    pub message_id: String,
}

impl ActivityRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: &str,
        processed_at: DateTime<Utc>,
        subject: &str,
        rule_applied: &str,
        destination: &str,
        provider: ProviderKind,
        message_id: &str,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            key: activity_key(processed_at, message_id),
            processed_at,
            subject: subject.to_string(),
            rule_applied: rule_applied.to_string(),
            destination: destination.to_string(),
            provider,
            message_id: message_id.to_string(),
        }
    }
}

/// A Gmail push-watch lease.
#[derive(Debug, Clone)]
pub struct WatchLease {
    pub user_id: String,
    /// Lease expiry, epoch millis.
    pub expires_at_ms: i64,
    pub updated_at: DateTime<Utc>,
}

/// Backend-agnostic persistence trait covering all entities.
#[async_trait]
pub trait Store: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Connections ─────────────────────────────────────────────────

    /// Insert or fully overwrite a connection record.
    async fn upsert_connection(&self, connection: &ProviderConnection) -> Result<(), StoreError>;

    async fn get_connection(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> Result<Option<ProviderConnection>, StoreError>;

    async fn delete_connection(
        &self,
        user_id: &str,
        provider: ProviderKind,
    ) -> Result<(), StoreError>;

    // ── Rules ───────────────────────────────────────────────────────

    async fn upsert_rule(&self, rule: &Rule) -> Result<(), StoreError>;

    /// All of a user's rules, ascending by `order`.
    async fn list_rules(&self, user_id: &str) -> Result<Vec<Rule>, StoreError>;

    async fn delete_rule(&self, user_id: &str, rule_id: Uuid) -> Result<(), StoreError>;

    // ── Processed messages ──────────────────────────────────────────

    async fn is_processed(
        &self,
        provider: ProviderKind,
        message_id: &str,
    ) -> Result<bool, StoreError>;

    /// Idempotent upsert of the dedup marker.
    async fn mark_processed(
        &self,
        provider: ProviderKind,
        message_id: &str,
    ) -> Result<(), StoreError>;

    // ── Activity ────────────────────────────────────────────────────

    /// Insert a record, then trim the user's log back to `cap` entries by
    /// deleting the oldest. The trim is not transactional with the insert;
    /// concurrent appends may transiently exceed the cap.
    async fn append_activity(&self, record: &ActivityRecord, cap: usize)
    -> Result<(), StoreError>;

    /// Newest-first activity for a user.
    async fn list_activity(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>, StoreError>;

    // ── Email index ─────────────────────────────────────────────────

    /// Map a provider account email to a user. The email is normalized to
    /// lowercase on write and lookup.
    async fn upsert_email_index(
        &self,
        provider: ProviderKind,
        email: &str,
        user_id: &str,
    ) -> Result<(), StoreError>;

    async fn lookup_user_by_email(
        &self,
        provider: ProviderKind,
        email: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn delete_email_index(
        &self,
        provider: ProviderKind,
        email: &str,
    ) -> Result<(), StoreError>;

    // ── Watch leases ────────────────────────────────────────────────

    async fn upsert_watch_lease(&self, user_id: &str, expires_at_ms: i64)
    -> Result<(), StoreError>;

    async fn list_watch_leases(&self) -> Result<Vec<WatchLease>, StoreError>;

    async fn delete_watch_lease(&self, user_id: &str) -> Result<(), StoreError>;
}
