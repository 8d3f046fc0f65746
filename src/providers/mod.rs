//! Mail-provider capability traits and the provider registry.
//!
//! Providers are pure I/O against the vendor REST APIs and carry no
//! business logic.
//! The pipeline composes them through `MailProvider`; push-capable providers
//! additionally expose `MailWatch`.

mod gmail;
mod m365;

pub use gmail::GmailProvider;
pub use m365::GraphProvider;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProviderError;

// ── Provider kinds ──────────────────────────────────────────────────

/// The closed set of supported mail providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Gmail,
    M365,
}

impl ProviderKind {
    /// Canonical name used in storage keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "Gmail",
            Self::M365 => "M365",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    /// Case-insensitive; unknown names are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gmail" => Ok(Self::Gmail),
            "m365" => Ok(Self::M365),
            _ => Err(ProviderError::UnknownKind(s.to_string())),
        }
    }
}

// ── Value types ─────────────────────────────────────────────────────

/// Message content needed for classification.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub from: String,
    pub subject: String,
    pub body_snippet: String,
}

/// Result of a successful token-refresh call.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Seconds until the new token expires.
    pub expires_in: Option<u64>,
    /// Present only when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
}

// ── Capability traits ───────────────────────────────────────────────

/// Core capabilities every mail provider implements.
#[async_trait]
pub trait MailProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Fetch message content. `Ok(None)` means the provider reported
    /// not-found or otherwise refused the fetch without a transport error.
    async fn fetch_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<Option<FetchedMessage>, ProviderError>;

    /// Apply the named action (label or move) to a message and report
    /// whether the provider accepted it. Resolving the destination name to a
    /// provider-internal id is the provider's job, and the action must be
    /// idempotent.
    async fn apply_action(
        &self,
        access_token: &str,
        message_id: &str,
        destination: &str,
    ) -> Result<bool, ProviderError>;

    /// Exchange a refresh token for a new access token. `Ok(None)` means the
    /// provider rejected the refresh (bad grant, missing client config).
    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<RefreshedToken>, ProviderError>;

    /// Push-watch capability; `None` for providers without one.
    fn watch(&self) -> Option<&dyn MailWatch> {
        None
    }
}

/// Push-watch capabilities: change listing and lease renewal.
#[async_trait]
pub trait MailWatch: Send + Sync {
    /// List message ids added since `checkpoint`, following pagination.
    async fn list_new_message_ids(
        &self,
        access_token: &str,
        checkpoint: &str,
    ) -> Result<Vec<String>, ProviderError>;

    /// Renew the push lease. Returns the new expiry in epoch millis.
    async fn renew_watch(&self, access_token: &str) -> Result<i64, ProviderError>;
}

// ── Registry ────────────────────────────────────────────────────────

/// Provider lookup by kind. Built once at startup and shared.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn MailProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn MailProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn MailProvider>> {
        self.providers.get(&kind).cloned()
    }
}
