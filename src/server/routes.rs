//! REST endpoints for pipeline ingress.
//!
//! The Gmail webhook distinguishes a malformed envelope (rejected with 400
//! so the publisher can see its mistake) from processing trouble after the
//! envelope was understood (always acknowledged with 200, since a non-ack
//! would only make Pub/Sub hammer the endpoint with redeliveries; failures
//! surface in logs and the next notification retries the history walk).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::pipeline::MessageProcessor;
use crate::providers::{ProviderKind, ProviderRegistry};
use crate::store::Store;
use crate::tokens::TokenResolver;

/// Shared state for ingress routes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub tokens: Arc<TokenResolver>,
    pub registry: Arc<ProviderRegistry>,
    pub processor: Arc<MessageProcessor>,
}

/// Build the ingress routes.
pub fn ingress_routes(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/api/process", post(process_message))
        .route("/webhook/gmail", post(gmail_push))
        .with_state(state)
}

// ── Liveness ────────────────────────────────────────────────────────

/// GET /ping
async fn ping() -> impl IntoResponse {
    info!("Ping invoked");
    "pong"
}

// ── Manual processing ───────────────────────────────────────────────

#[derive(Deserialize)]
struct ProcessParams {
    #[serde(rename = "userId")]
    user_id: Option<String>,
    provider: Option<String>,
    #[serde(rename = "messageId")]
    message_id: Option<String>,
}

/// POST /api/process?userId=&provider=&messageId=
///
/// Manual entry point that runs the pipeline inline for one message. Used
/// for M365 (which has no push webhook here) and for testing Gmail without
/// Pub/Sub. The terminal state lands in the logs, not the response.
async fn process_message(
    State(state): State<AppState>,
    Query(params): Query<ProcessParams>,
) -> impl IntoResponse {
    let user_id = params.user_id.unwrap_or_default();
    let provider = params.provider.unwrap_or_default();
    let message_id = params.message_id.unwrap_or_default();

    if user_id.is_empty() || provider.is_empty() || message_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "Missing userId, provider, or messageId (query params)",
        );
    }

    let Ok(provider) = provider.parse::<ProviderKind>() else {
        return (StatusCode::BAD_REQUEST, "Provider must be Gmail or M365");
    };

    match state.processor.process(&user_id, provider, &message_id).await {
        Ok(outcome) => {
            info!(user_id, %provider, message_id, ?outcome, "Manual processing finished");
            (StatusCode::ACCEPTED, "Accepted")
        }
        Err(e) => {
            error!(user_id, %provider, message_id, "Manual processing failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Processing failed")
        }
    }
}

// ── Gmail push webhook ──────────────────────────────────────────────

/// POST /webhook/gmail
///
/// Gmail Pub/Sub push. The envelope's base64 payload names the watched
/// account and a history checkpoint; every message id added since that
/// checkpoint runs through the pipeline, one at a time.
async fn gmail_push(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let (email, history_id) = match parse_push_envelope(&body) {
        Ok(parts) => parts,
        Err(reason) => {
            warn!(reason, "Invalid Gmail push payload");
            return (StatusCode::BAD_REQUEST, reason);
        }
    };

    let user_id = match state.store.lookup_user_by_email(ProviderKind::Gmail, &email).await {
        Ok(Some(user_id)) => user_id,
        Ok(None) => {
            warn!(email, "No user found for Gmail address");
            return (StatusCode::OK, "OK");
        }
        Err(e) => {
            warn!(email, "Email index lookup failed: {e}");
            return (StatusCode::OK, "OK");
        }
    };

    let access_token = match state.tokens.access_token(&user_id, ProviderKind::Gmail).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            warn!(user_id, "No access token for user");
            return (StatusCode::OK, "OK");
        }
        Err(e) => {
            warn!(user_id, "Token resolution failed: {e}");
            return (StatusCode::OK, "OK");
        }
    };

    let Some(provider) = state.registry.get(ProviderKind::Gmail) else {
        warn!("Gmail provider not registered");
        return (StatusCode::OK, "OK");
    };
    let Some(watch) = provider.watch() else {
        warn!("Gmail provider has no push-watch support");
        return (StatusCode::OK, "OK");
    };

    let message_ids = match watch.list_new_message_ids(&access_token, &history_id).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(user_id, history_id, "Gmail history listing failed: {e}");
            return (StatusCode::OK, "OK");
        }
    };

    info!(user_id, count = message_ids.len(), "Gmail push received");
    for message_id in &message_ids {
        if let Err(e) = state
            .processor
            .process(&user_id, ProviderKind::Gmail, message_id)
            .await
        {
            warn!(user_id, %message_id, "Message processing failed: {e}");
        }
    }

    (StatusCode::OK, "OK")
}

/// Split a Pub/Sub push envelope into (emailAddress, historyId).
fn parse_push_envelope(body: &str) -> Result<(String, String), &'static str> {
    if body.trim().is_empty() {
        return Err("Empty body");
    }
    let envelope: Value = serde_json::from_str(body).map_err(|_| "Invalid payload")?;
    let Some(message) = envelope.get("message") else {
        return Err("Missing message");
    };
    let Some(data) = message.get("data") else {
        return Err("Missing message.data");
    };

    let data_b64 = data.as_str().unwrap_or("");
    if data_b64.is_empty() {
        return Err("Empty message.data");
    }

    let decoded = BASE64
        .decode(data_b64)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or("Invalid payload")?;
    let payload: Value = serde_json::from_str(&decoded).map_err(|_| "Invalid payload")?;

    let email = payload
        .get("emailAddress")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    // Gmail sends historyId as a number; some relays re-encode it as a string
    let history_id = match payload.get("historyId") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };

    if email.is_empty() || history_id.is_empty() {
        return Err("Missing emailAddress or historyId in payload");
    }

    Ok((email, history_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(payload: Value) -> String {
        serde_json::json!({
            "message": { "data": BASE64.encode(payload.to_string()) }
        })
        .to_string()
    }

    #[test]
    fn envelope_with_string_history_id_parses() {
        let body = envelope(serde_json::json!({
            "emailAddress": "alice@example.com",
            "historyId": "12345"
        }));
        let (email, history_id) = parse_push_envelope(&body).unwrap();
        assert_eq!(email, "alice@example.com");
        assert_eq!(history_id, "12345");
    }

    #[test]
    fn envelope_with_numeric_history_id_parses() {
        let body = envelope(serde_json::json!({
            "emailAddress": "alice@example.com",
            "historyId": 9_876_543_210u64
        }));
        let (_, history_id) = parse_push_envelope(&body).unwrap();
        assert_eq!(history_id, "9876543210");
    }

    #[test]
    fn email_is_trimmed() {
        let body = envelope(serde_json::json!({
            "emailAddress": "  alice@example.com  ",
            "historyId": "1"
        }));
        let (email, _) = parse_push_envelope(&body).unwrap();
        assert_eq!(email, "alice@example.com");
    }

    #[test]
    fn empty_body_is_rejected() {
        assert_eq!(parse_push_envelope(""), Err("Empty body"));
        assert_eq!(parse_push_envelope("   \n"), Err("Empty body"));
    }

    #[test]
    fn missing_message_is_rejected() {
        assert_eq!(parse_push_envelope("{}"), Err("Missing message"));
    }

    #[test]
    fn missing_data_is_rejected() {
        assert_eq!(
            parse_push_envelope(r#"{"message": {}}"#),
            Err("Missing message.data")
        );
    }

    #[test]
    fn empty_data_is_rejected() {
        assert_eq!(
            parse_push_envelope(r#"{"message": {"data": ""}}"#),
            Err("Empty message.data")
        );
    }

    #[test]
    fn garbage_base64_is_rejected() {
        assert_eq!(
            parse_push_envelope(r#"{"message": {"data": "%%%not-base64%%%"}}"#),
            Err("Invalid payload")
        );
    }

    #[test]
    fn non_json_body_is_rejected() {
        assert_eq!(parse_push_envelope("not json at all"), Err("Invalid payload"));
    }

    #[test]
    fn payload_without_email_is_rejected() {
        let body = envelope(serde_json::json!({ "historyId": "12345" }));
        assert_eq!(
            parse_push_envelope(&body),
            Err("Missing emailAddress or historyId in payload")
        );
    }

    #[test]
    fn payload_without_history_id_is_rejected() {
        let body = envelope(serde_json::json!({ "emailAddress": "alice@example.com" }));
        assert_eq!(
            parse_push_envelope(&body),
            Err("Missing emailAddress or historyId in payload")
        );
    }
}
