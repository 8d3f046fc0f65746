//! Gmail provider — REST client for message fetch, labeling, history
//! listing, and push-watch renewal.
//!
//! Every call takes a caller-supplied OAuth bearer token; this module never
//! stores credentials.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::GoogleOauthConfig;
use crate::error::ProviderError;
use crate::providers::{FetchedMessage, MailProvider, MailWatch, ProviderKind, RefreshedToken};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const PROVIDER: &str = "Gmail";

/// Gmail provider — talks to the Gmail REST API.
pub struct GmailProvider {
    client: reqwest::Client,
    oauth: Option<GoogleOauthConfig>,
    pubsub_topic: Option<String>,
}

impl GmailProvider {
    pub fn new(oauth: Option<GoogleOauthConfig>, pubsub_topic: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            oauth,
            pubsub_topic,
        }
    }

    /// Resolve a label name to its id, case-insensitively.
    async fn label_id(
        &self,
        access_token: &str,
        name: &str,
    ) -> Result<Option<String>, ProviderError> {
        let resp = self
            .client
            .get(format!("{GMAIL_API_BASE}/labels"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                provider: PROVIDER,
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            warn!(status = %resp.status(), "Gmail label listing failed");
            return Ok(None);
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                provider: PROVIDER,
                reason: e.to_string(),
            }
        })?;

        let id = body
            .get("labels")
            .and_then(serde_json::Value::as_array)
            .and_then(|labels| {
                labels.iter().find(|l| {
                    l.get("name")
                        .and_then(serde_json::Value::as_str)
                        .is_some_and(|n| n.eq_ignore_ascii_case(name))
                })
            })
            .and_then(|l| l.get("id"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);

        Ok(id)
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn fetch_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<Option<FetchedMessage>, ProviderError> {
        let resp = self
            .client
            .get(format!("{GMAIL_API_BASE}/messages/{message_id}?format=full"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                provider: PROVIDER,
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            debug!(status = %resp.status(), message_id, "Gmail message fetch failed");
            return Ok(None);
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                provider: PROVIDER,
                reason: e.to_string(),
            }
        })?;

        let payload = body.get("payload");
        let from = header_value(payload, "From");
        let subject = header_value(payload, "Subject");

        // Prefer the provider snippet; fall back to the raw payload body
        let snippet = body
            .get("snippet")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let body_snippet = if snippet.is_empty() {
            payload
                .and_then(|p| p.get("body"))
                .and_then(|b| b.get("data"))
                .and_then(serde_json::Value::as_str)
                .and_then(decode_body_data)
                .unwrap_or_default()
        } else {
            snippet.to_string()
        };

        Ok(Some(FetchedMessage {
            from,
            subject,
            body_snippet,
        }))
    }

    async fn apply_action(
        &self,
        access_token: &str,
        message_id: &str,
        destination: &str,
    ) -> Result<bool, ProviderError> {
        let Some(label_id) = self.label_id(access_token, destination).await? else {
            warn!(destination, "Gmail label not found; action skipped");
            return Ok(false);
        };

        let resp = self
            .client
            .post(format!("{GMAIL_API_BASE}/messages/{message_id}/modify"))
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "addLabelIds": [label_id] }))
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                provider: PROVIDER,
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            warn!(status = %resp.status(), message_id, "Gmail label apply failed");
            return Ok(false);
        }
        Ok(true)
    }

    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<Option<RefreshedToken>, ProviderError> {
        let Some(oauth) = &self.oauth else {
            debug!("Google OAuth client not configured; cannot refresh");
            return Ok(None);
        };

        let resp = self
            .client
            .post(GOOGLE_TOKEN_URL)
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
            warn!(status = %resp.status(), "Google token refresh rejected");
            return Ok(None);
        }

        match resp.json::<TokenResponse>().await {
            Ok(token) => Ok(Some(RefreshedToken {
                access_token: token.access_token,
                expires_in: token.expires_in,
                refresh_token: token.refresh_token,
            })),
            Err(e) => {
                warn!("Google token response unreadable: {e}");
                Ok(None)
            }
        }
    }

    fn watch(&self) -> Option<&dyn MailWatch> {
        Some(self)
    }
}

#[async_trait]
impl MailWatch for GmailProvider {
    async fn list_new_message_ids(
        &self,
        access_token: &str,
        checkpoint: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{GMAIL_API_BASE}/history?startHistoryId={checkpoint}&historyTypes=messageAdded"
            );
            if let Some(token) = &page_token {
                url.push_str("&pageToken=");
                url.push_str(token);
            }

            let resp = self
                .client
                .get(&url)
                .bearer_auth(access_token)
                .send()
                .await
                .map_err(|e| ProviderError::Request {
                    provider: PROVIDER,
                    reason: e.to_string(),
                })?;

            // A failed page ends the walk; whatever was collected still gets
            // processed, the rest arrives with the next notification.
            if !resp.status().is_success() {
                warn!(status = %resp.status(), "Gmail history listing stopped early");
                return Ok(ids);
            }

            let page: HistoryPage = resp.json().await.map_err(|e| {
                ProviderError::InvalidResponse {
                    provider: PROVIDER,
                    reason: e.to_string(),
                }
            })?;

            for entry in page.history {
                for added in entry.messages_added {
                    if let Some(message) = added.message {
                        if !message.id.is_empty() {
                            ids.push(message.id);
                        }
                    }
                }
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(ids)
    }

    async fn renew_watch(&self, access_token: &str) -> Result<i64, ProviderError> {
        let Some(topic) = &self.pubsub_topic else {
            return Err(ProviderError::Request {
                provider: PROVIDER,
                reason: "pubsub topic not configured".to_string(),
            });
        };

        let resp = self
            .client
            .post(format!("{GMAIL_API_BASE}/watch"))
            .bearer_auth(access_token)
            .json(&serde_json::json!({ "topicName": topic }))
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                provider: PROVIDER,
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(ProviderError::Status {
                provider: PROVIDER,
                status: resp.status().as_u16(),
            });
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| {
            ProviderError::InvalidResponse {
                provider: PROVIDER,
                reason: e.to_string(),
            }
        })?;

        Ok(parse_expiration(&body))
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

#[derive(Debug, Deserialize)]
struct HistoryPage {
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(rename = "messagesAdded", default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: Option<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    #[serde(default)]
    id: String,
}

// ── Helper functions ────────────────────────────────────────────────

/// Look up a MIME header in the message payload, case-insensitively.
fn header_value(payload: Option<&serde_json::Value>, name: &str) -> String {
    payload
        .and_then(|p| p.get("headers"))
        .and_then(serde_json::Value::as_array)
        .and_then(|headers| {
            headers.iter().find(|h| {
                h.get("name")
                    .and_then(serde_json::Value::as_str)
                    .is_some_and(|n| n.eq_ignore_ascii_case(name))
            })
        })
        .and_then(|h| h.get("value"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Decode Gmail's base64url body encoding (unpadded, `-`/`_` alphabet).
fn decode_body_data(data: &str) -> Option<String> {
    let normalized = data.replace('-', "+").replace('_', "/");
    let padded = match normalized.len() % 4 {
        2 => format!("{normalized}=="),
        3 => format!("{normalized}="),
        _ => normalized,
    };
    let bytes = BASE64.decode(padded).ok()?;
    String::from_utf8(bytes).ok()
}

/// Pull the watch expiration out of a /watch response. Gmail documents it as
/// an epoch-millis string but emits a bare number in some responses.
fn parse_expiration(body: &serde_json::Value) -> i64 {
    match body.get("expiration") {
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
        Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}
