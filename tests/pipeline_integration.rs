//! Integration tests for the HTTP ingress.
//!
//! Each test spins up an Axum server on a random port backed by an
//! in-memory store, a stub mail provider, and a stub classifier, then
//! exercises the REST contract with a real HTTP client.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::time::timeout;
use uuid::Uuid;

use mailsieve::classifier::RuleClassifier;
use mailsieve::config::PipelineConfig;
use mailsieve::crypto::{LocalKeyWrapper, TokenCipher};
use mailsieve::error::{ClassifierError, ProviderError};
use mailsieve::pipeline::MessageProcessor;
use mailsieve::providers::{
    FetchedMessage, MailProvider, MailWatch, ProviderKind, ProviderRegistry, RefreshedToken,
};
use mailsieve::server::{AppState, ingress_routes};
use mailsieve::store::{LibSqlStore, ProviderConnection, Rule, Store};
use mailsieve::tokens::TokenResolver;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Stub Gmail provider: fixed message content, every action sticks, history
/// listing returns a canned id set.
struct StubProvider {
    history_ids: Vec<String>,
    applied: Mutex<Vec<(String, String)>>,
}

impl StubProvider {
    fn new(history_ids: &[&str]) -> Self {
        Self {
            history_ids: history_ids.iter().map(|s| s.to_string()).collect(),
            applied: Mutex::new(Vec::new()),
        }
    }

    fn applied(&self) -> Vec<(String, String)> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailProvider for StubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn fetch_message(
        &self,
        _access_token: &str,
        _message_id: &str,
    ) -> Result<Option<FetchedMessage>, ProviderError> {
        Ok(Some(FetchedMessage {
            from: "alice@company.com".to_string(),
            subject: "Quarterly report".to_string(),
            body_snippet: "numbers attached".to_string(),
        }))
    }

    async fn apply_action(
        &self,
        _access_token: &str,
        message_id: &str,
        destination: &str,
    ) -> Result<bool, ProviderError> {
        self.applied
            .lock()
            .unwrap()
            .push((message_id.to_string(), destination.to_string()));
        Ok(true)
    }

    async fn refresh_access_token(
        &self,
        _refresh_token: &str,
    ) -> Result<Option<RefreshedToken>, ProviderError> {
        Ok(None)
    }

    fn watch(&self) -> Option<&dyn MailWatch> {
        Some(self)
    }
}

#[async_trait]
impl MailWatch for StubProvider {
    async fn list_new_message_ids(
        &self,
        _access_token: &str,
        _checkpoint: &str,
    ) -> Result<Vec<String>, ProviderError> {
        Ok(self.history_ids.clone())
    }

    async fn renew_watch(&self, _access_token: &str) -> Result<i64, ProviderError> {
        Ok((Utc::now() + chrono::Duration::days(7)).timestamp_millis())
    }
}

/// Stub classifier that always gives the same answer.
struct StubClassifier {
    answer: Option<String>,
}

#[async_trait]
impl RuleClassifier for StubClassifier {
    async fn classify(
        &self,
        _from: &str,
        _subject: &str,
        _body_snippet: &str,
        _rules: &[Rule],
    ) -> Result<Option<String>, ClassifierError> {
        Ok(self.answer.clone())
    }
}

struct TestServer {
    port: u16,
    store: Arc<LibSqlStore>,
    cipher: Arc<TokenCipher>,
    provider: Arc<StubProvider>,
}

/// Start a server on a random port with the given classifier answer and
/// canned Gmail history.
async fn start_server(answer: Option<&str>, history_ids: &[&str]) -> TestServer {
    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());

    let key = SecretString::from(BASE64.encode([3u8; 32]));
    let wrapper = LocalKeyWrapper::from_config(&key).unwrap();
    let cipher = Arc::new(TokenCipher::new(Arc::new(wrapper)));

    let provider = Arc::new(StubProvider::new(history_ids));
    let mut registry = ProviderRegistry::new();
    registry.register(provider.clone());
    let registry = Arc::new(registry);

    let tokens = Arc::new(TokenResolver::new(
        store.clone(),
        cipher.clone(),
        registry.clone(),
    ));
    let classifier: Arc<dyn RuleClassifier> = Arc::new(StubClassifier {
        answer: answer.map(String::from),
    });
    let processor = Arc::new(MessageProcessor::new(
        store.clone(),
        tokens.clone(),
        registry.clone(),
        classifier,
        PipelineConfig::default(),
    ));

    let app = ingress_routes(AppState {
        store: store.clone(),
        tokens,
        registry,
        processor,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        port,
        store,
        cipher,
        provider,
    }
}

/// Seed a Gmail connection with a fresh token, plus the email-index entry
/// that routes push notifications to the user.
async fn seed_gmail_user(ts: &TestServer, user_id: &str, email: &str) {
    let access_enc = ts.cipher.encrypt_string("live-token").await.unwrap();
    ts.store
        .upsert_connection(&ProviderConnection {
            user_id: user_id.to_string(),
            provider: ProviderKind::Gmail,
            email: email.to_string(),
            access_token_enc: Some(access_enc),
            refresh_token_enc: None,
            token_expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            connected_at: Utc::now(),
            watch_expires_at_ms: None,
        })
        .await
        .unwrap();
    ts.store
        .upsert_email_index(ProviderKind::Gmail, email, user_id)
        .await
        .unwrap();
}

async fn seed_rule(ts: &TestServer, user_id: &str, name: &str, destination: &str) {
    ts.store
        .upsert_rule(&Rule {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            prompt: format!("emails that belong in {destination}"),
            destination: destination.to_string(),
            enabled: true,
            order: 0,
        })
        .await
        .unwrap();
}

/// Pub/Sub push envelope wrapping `{emailAddress, historyId}`.
fn push_envelope(email: &str, history_id: serde_json::Value) -> String {
    let payload = serde_json::json!({
        "emailAddress": email,
        "historyId": history_id,
    });
    serde_json::json!({
        "message": { "data": BASE64.encode(payload.to_string()) }
    })
    .to_string()
}

// ── Liveness ─────────────────────────────────────────────────────────

#[tokio::test]
async fn ping_returns_pong() {
    timeout(TEST_TIMEOUT, async {
        let ts = start_server(None, &[]).await;

        let resp = reqwest::get(format!("http://127.0.0.1:{}/ping", ts.port))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "pong");
    })
    .await
    .expect("test timed out");
}

// ── Manual processing ────────────────────────────────────────────────

#[tokio::test]
async fn process_requires_all_query_params() {
    timeout(TEST_TIMEOUT, async {
        let ts = start_server(None, &[]).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!(
                "http://127.0.0.1:{}/api/process?userId=u1&provider=Gmail",
                ts.port
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert!(resp.text().await.unwrap().contains("Missing"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn process_rejects_unknown_provider() {
    timeout(TEST_TIMEOUT, async {
        let ts = start_server(None, &[]).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!(
                "http://127.0.0.1:{}/api/process?userId=u1&provider=imap&messageId=m1",
                ts.port
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(resp.text().await.unwrap(), "Provider must be Gmail or M365");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn process_runs_the_pipeline() {
    timeout(TEST_TIMEOUT, async {
        let ts = start_server(Some("Work"), &[]).await;
        seed_gmail_user(&ts, "u1", "alice@example.com").await;
        seed_rule(&ts, "u1", "Work", "Work folder").await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!(
                // Lowercase provider name: parsing is case-insensitive
                "http://127.0.0.1:{}/api/process?userId=u1&provider=gmail&messageId=m1",
                ts.port
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        assert_eq!(resp.text().await.unwrap(), "Accepted");

        assert_eq!(
            ts.provider.applied(),
            vec![("m1".to_string(), "Work folder".to_string())]
        );
        assert!(ts.store.is_processed(ProviderKind::Gmail, "m1").await.unwrap());

        let activity = ts.store.list_activity("u1", 10).await.unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].rule_applied, "Work");
        assert_eq!(activity[0].subject, "Quarterly report");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn process_is_idempotent_across_requests() {
    timeout(TEST_TIMEOUT, async {
        let ts = start_server(Some("Work"), &[]).await;
        seed_gmail_user(&ts, "u1", "alice@example.com").await;
        seed_rule(&ts, "u1", "Work", "Work folder").await;

        let client = reqwest::Client::new();
        let url = format!(
            "http://127.0.0.1:{}/api/process?userId=u1&provider=Gmail&messageId=m1",
            ts.port
        );
        for _ in 0..2 {
            let resp = client.post(&url).send().await.unwrap();
            assert_eq!(resp.status(), 202);
        }

        // Second request was absorbed by the idempotency guard
        assert_eq!(ts.provider.applied().len(), 1);
        assert_eq!(ts.store.list_activity("u1", 10).await.unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}

// ── Gmail webhook ────────────────────────────────────────────────────

#[tokio::test]
async fn webhook_rejects_malformed_envelope() {
    timeout(TEST_TIMEOUT, async {
        let ts = start_server(None, &[]).await;
        let url = format!("http://127.0.0.1:{}/webhook/gmail", ts.port);

        let client = reqwest::Client::new();
        for body in ["", "{}", "not json", r#"{"message": {}}"#] {
            let resp = client.post(&url).body(body).send().await.unwrap();
            assert_eq!(resp.status(), 400, "body: {body:?}");
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_acks_unknown_address() {
    timeout(TEST_TIMEOUT, async {
        let ts = start_server(None, &["h1"]).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://127.0.0.1:{}/webhook/gmail", ts.port))
            .body(push_envelope("stranger@example.com", "42".into()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "OK");
        assert!(ts.provider.applied().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_acks_when_token_missing() {
    timeout(TEST_TIMEOUT, async {
        let ts = start_server(Some("Work"), &["h1"]).await;
        // Email index exists, but the connection has no usable token
        ts.store
            .upsert_connection(&ProviderConnection {
                user_id: "u1".to_string(),
                provider: ProviderKind::Gmail,
                email: "alice@example.com".to_string(),
                access_token_enc: None,
                refresh_token_enc: None,
                token_expires_at: None,
                connected_at: Utc::now(),
                watch_expires_at_ms: None,
            })
            .await
            .unwrap();
        ts.store
            .upsert_email_index(ProviderKind::Gmail, "alice@example.com", "u1")
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://127.0.0.1:{}/webhook/gmail", ts.port))
            .body(push_envelope("alice@example.com", "42".into()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(ts.provider.applied().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_processes_every_history_message() {
    timeout(TEST_TIMEOUT, async {
        let ts = start_server(Some("Work"), &["h1", "h2"]).await;
        seed_gmail_user(&ts, "u1", "alice@example.com").await;
        seed_rule(&ts, "u1", "Work", "Work folder").await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://127.0.0.1:{}/webhook/gmail", ts.port))
            .body(push_envelope("alice@example.com", "42".into()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        assert_eq!(
            ts.provider.applied(),
            vec![
                ("h1".to_string(), "Work folder".to_string()),
                ("h2".to_string(), "Work folder".to_string()),
            ]
        );
        assert!(ts.store.is_processed(ProviderKind::Gmail, "h1").await.unwrap());
        assert!(ts.store.is_processed(ProviderKind::Gmail, "h2").await.unwrap());
        assert_eq!(ts.store.list_activity("u1", 10).await.unwrap().len(), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_accepts_numeric_history_id() {
    timeout(TEST_TIMEOUT, async {
        let ts = start_server(Some("Work"), &["h1"]).await;
        seed_gmail_user(&ts, "u1", "alice@example.com").await;
        seed_rule(&ts, "u1", "Work", "Work folder").await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("http://127.0.0.1:{}/webhook/gmail", ts.port))
            .body(push_envelope(
                "alice@example.com",
                serde_json::json!(9_876_543_210u64),
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(ts.provider.applied().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_redelivery_is_idempotent() {
    timeout(TEST_TIMEOUT, async {
        let ts = start_server(Some("Work"), &["h1"]).await;
        seed_gmail_user(&ts, "u1", "alice@example.com").await;
        seed_rule(&ts, "u1", "Work", "Work folder").await;

        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/webhook/gmail", ts.port);
        for _ in 0..2 {
            let resp = client
                .post(&url)
                .body(push_envelope("alice@example.com", "42".into()))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
        }

        assert_eq!(ts.provider.applied().len(), 1);
        assert_eq!(ts.store.list_activity("u1", 10).await.unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}
