//! Microsoft 365 provider — Graph API client for message fetch and
//! folder moves.
//!
//! Graph returns HTML bodies for most tenants; the fetch path strips tags
//! down to plain text before the message reaches classification.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::MicrosoftOauthConfig;
use crate::error::ProviderError;
use crate::providers::{FetchedMessage, MailProvider, ProviderKind, RefreshedToken};

const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0/me";

const PROVIDER: &str = "M365";

static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Microsoft 365 provider — talks to the Graph API.
pub struct GraphProvider {
    client: reqwest::Client,
    oauth: Option<MicrosoftOauthConfig>,
}

impl GraphProvider {
    pub fn new(oauth: Option<MicrosoftOauthConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            oauth,
        }
    }

    /// Resolve a folder display name to its id, case-insensitively.
    async fn folder_id(
        &self,
        access_token: &str,
        name: &str,
    ) -> Result<Option<String>, ProviderError> {
        let resp = self
            .client
            .get(format!("{GRAPH_API_BASE}/mailFolders?$top=100"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                provider: PROVIDER,
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            warn!(status = %resp.status(), "Graph folder listing failed");
            return Ok(None);
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                provider: PROVIDER,
                reason: e.to_string(),
            }
        })?;

        let id = body
            .get("value")
            .and_then(serde_json::Value::as_array)
            .and_then(|folders| {
                folders.iter().find(|f| {
                    f.get("displayName")
                        .and_then(serde_json::Value::as_str)
                        .is_some_and(|n| n.eq_ignore_ascii_case(name))
                })
            })
            .and_then(|f| f.get("id"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        Ok(id)
    }
}

#[async_trait]
impl MailProvider for GraphProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::M365
    }

    async fn fetch_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<Option<FetchedMessage>, ProviderError> {
        let resp = self
            .client
            .get(format!(
                "{GRAPH_API_BASE}/messages/{message_id}?$select=from,subject,body"
            ))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                provider: PROVIDER,
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            debug!(status = %resp.status(), message_id, "Graph message fetch failed");
            return Ok(None);
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                provider: PROVIDER,
                reason: e.to_string(),
            }
        })?;

        Ok(Some(FetchedMessage {
            from: sender_display(body.get("from")),
            subject: body
                .get("subject")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
            body_snippet: body_text(body.get("body")),
        }))
    }

    async fn apply_action(
        &self,
        access_token: &str,
        message_id: &str,
        destination: &str,
    ) -> Result<bool, ProviderError> {
        let Some(folder_id) = self.folder_id(access_token, destination).await? else {
            warn!(destination, "Graph folder not found; action skipped");
            return Ok(false);
        };

        let resp = self
            .client
            .post(format!("{GRAPH_API_BASE}/messages/{message_id}/move"))
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "destinationId": folder_id }))
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                provider: PROVIDER,
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            warn!(status = %resp.status(), message_id, "Graph message move failed");
            return Ok(false);
        }
        Ok(true)
    }

    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<RefreshedToken>, ProviderError> {
        let Some(oauth) = &self.oauth else {
            debug!("Microsoft OAuth client not configured; cannot refresh");
            return Ok(None);
        };

        let tenant = oauth.tenant_id.as_deref().unwrap_or("common");
        let url = format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token");

        let resp = self
            .client
            .post(url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", oauth.client_id.as_str()),
                ("client_secret", oauth.client_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                provider: PROVIDER,
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            warn!(status = %resp.status(), "Microsoft token refresh rejected");
            return Ok(None);
        }

        match resp.json::<TokenResponse>().await {
            Ok(token) => Ok(Some(RefreshedToken {
                access_token: token.access_token,
                expires_in: token.expires_in,
                refresh_token: token.refresh_token,
            })),
            Err(e) => {
                warn!("Microsoft token response unreadable: {e}");
                Ok(None)
            }
        }
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

// ── Helper functions ────────────────────────────────────────────────

/// Format Graph's `from` property as `Name <address>`, or the bare address
/// when no display name is set.
fn sender_display(from: Option<&serde_json::Value>) -> String {
    let Some(email) = from.and_then(|f| f.get("emailAddress")) else {
        return String::new();
    };
    let name = email
        .get("name")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    let address = email
        .get("address")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();

    if name.is_empty() {
        address.to_string()
    } else {
        format!("{name} <{address}>")
    }
}

/// Extract plain text from Graph's `body` property, stripping HTML when the
/// content type says so.
fn body_text(body: Option<&serde_json::Value>) -> String {
    let Some(body) = body else {
        return String::new();
    };
    let content = body
        .get("content")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    let content_type = body
        .get("contentType")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();

    if content_type.eq_ignore_ascii_case("html") {
        strip_html(content)
    } else {
        content.to_string()
    }
}

/// Replace tags with spaces, then collapse whitespace runs.
fn strip_html(html: &str) -> String {
    let without_tags = HTML_TAG.replace_all(html, " ");
    WHITESPACE_RUN
        .replace_all(&without_tags, " ")
        .trim()
        .to_string()
}
