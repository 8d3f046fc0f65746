//! Rule classification — asks a chat-completions model to pick one rule.
//!
//! The model sees the message envelope plus every enabled rule and must
//! answer with exactly one rule name or NONE. Anything it says that does not
//! resolve to a configured rule reads as no-match; the pipeline never acts
//! on free-form model output.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::ClassifierConfig;
use crate::error::ClassifierError;
use crate::store::Rule;

/// Picks at most one rule for a message.
#[async_trait]
pub trait RuleClassifier: Send + Sync {
    /// Returns the winning rule name as the model wrote it, or `None` when no
    /// rule applies. Transport and HTTP errors surface as errors; an
    /// unparseable response body reads as no-match.
    async fn classify(
        &self,
        from: &str,
        subject: &str,
        body_snippet: &str,
        rules: &[Rule],
    ) -> Result<Option<String>, ClassifierError>;
}

/// Chat-completions backed classifier (OpenAI-compatible endpoints,
/// including Azure deployments).
pub struct OpenAiClassifier {
    client: reqwest::Client,
    config: ClassifierConfig,
}

impl OpenAiClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl RuleClassifier for OpenAiClassifier {
    async fn classify(
        &self,
        from: &str,
        subject: &str,
        body_snippet: &str,
        rules: &[Rule],
    ) -> Result<Option<String>, ClassifierError> {
        if rules.is_empty() {
            return Ok(None);
        }

        let mut request = serde_json::json!({
            "messages": [
                { "role": "system", "content": build_system_prompt() },
                { "role": "user", "content": build_user_prompt(from, subject, body_snippet, rules) }
            ],
            "max_tokens": 100,
            "temperature": 0,
        });
        if let Some(model) = &self.config.model {
            request["model"] = serde_json::Value::String(model.clone());
        }

        let resp = self
            .client
            .post(&self.config.url)
            .header("api-key", self.config.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| ClassifierError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ClassifierError::Status(resp.status().as_u16()));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| ClassifierError::Request(e.to_string()))?;
        let Ok(body) = serde_json::from_str::<serde_json::Value>(&text) else {
            debug!("Classifier response is not JSON; treating as no match");
            return Ok(None);
        };

        Ok(parse_rule_response(&body, rules))
    }
}

/// Classifier used when no model endpoint is configured. Never matches, so
/// every message records a NONE outcome and stays where it is.
pub struct NoopClassifier;

#[async_trait]
impl RuleClassifier for NoopClassifier {
    async fn classify(
        &self,
        _from: &str,
        _subject: &str,
        _body_snippet: &str,
        _rules: &[Rule],
    ) -> Result<Option<String>, ClassifierError> {
        debug!("No classifier configured; message will not match any rule");
        Ok(None)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt() -> String {
    "You are a classifier. You will be given an email (from, subject, body snippet) and a list of rules. Each rule has a name and a prompt describing when it applies.\n\
     You must respond with exactly ONE of:\n\
     - The rule name (exactly as given) if that rule applies to the email, OR\n\
     - The word NONE if no rule applies.\n\n\
     Respond with nothing else: only the rule name or NONE. No explanation, no punctuation, no extra text."
        .to_string()
}

fn build_user_prompt(from: &str, subject: &str, body_snippet: &str, rules: &[Rule]) -> String {
    let mut prompt = String::with_capacity(512);

    prompt.push_str("## Email\n");
    prompt.push_str(&format!("From: {from}\n"));
    prompt.push_str(&format!("Subject: {subject}\n"));
    prompt.push_str("Body (snippet):\n");
    prompt.push_str(body_snippet);
    prompt.push_str("\n\n");
    prompt.push_str("## Rules (respond with exactly one rule name or NONE)\n");
    for rule in rules {
        prompt.push_str(&format!("- {}: {}\n", rule.name, rule.prompt));
    }
    prompt.push('\n');
    prompt.push_str("Your response (one rule name or NONE):\n");

    prompt
}

// ── Response parsing ────────────────────────────────────────────────

/// Extract a rule name from a chat-completions response. The cascade is
/// strict: trimmed content, then its first line, matched case-insensitively
/// against the rule names. Everything else is no-match.
fn parse_rule_response(body: &serde_json::Value, rules: &[Rule]) -> Option<String> {
    let content = body
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()?
        .trim();

    if content.is_empty() || content.eq_ignore_ascii_case("NONE") {
        return None;
    }

    let matches_rule =
        |candidate: &str| rules.iter().any(|r| r.name.trim().eq_ignore_ascii_case(candidate));

    if matches_rule(content) {
        return Some(content.to_string());
    }

    let first_line = content.split(['\n', '\r']).next().unwrap_or("").trim();
    if !first_line.is_empty() && matches_rule(first_line) {
        return Some(first_line.to_string());
    }

    None
}
