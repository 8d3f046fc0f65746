//! Message processor — runs one message through the full triage pipeline.
//!
//! Flow:
//! 1. Idempotency guard — duplicates stop here
//! 2. Token resolution — no token, no work
//! 3. Provider fetch of (from, subject, body snippet)
//! 4. Classification against the user's enabled rules
//! 5. Provider action with the matched rule's destination
//! 6. Activity record, then processed mark
//!
//! **Core invariant: a message is marked processed only after its action
//! stuck and its activity record is written.** A failed action records
//! nothing, so redelivery reruns the whole pipeline for that message. The
//! provider action is idempotent, which is what makes that retry safe.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::classifier::RuleClassifier;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::providers::{ProviderKind, ProviderRegistry};
use crate::store::{ActivityRecord, Rule, Store};
use crate::tokens::TokenResolver;

/// Terminal state of a single pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Blank ids or an unregistered provider; nothing to do.
    Skipped,
    /// The idempotency guard had already seen this message.
    AlreadyProcessed,
    /// No usable access token; message left for redelivery.
    TokenUnavailable,
    /// The provider could not produce the message.
    FetchFailed,
    /// A rule matched but the provider action did not stick. Nothing was
    /// recorded; redelivery reruns the pipeline.
    ActionFailed,
    /// Activity recorded and message marked processed.
    Completed { rule_applied: String },
}

/// Message processor — the core of the pipeline.
///
/// Holds every collaborator behind a trait object so the pipeline itself
/// stays provider- and model-agnostic.
pub struct MessageProcessor {
    store: Arc<dyn Store>,
    tokens: Arc<TokenResolver>,
    registry: Arc<ProviderRegistry>,
    classifier: Arc<dyn RuleClassifier>,
    config: PipelineConfig,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        tokens: Arc<TokenResolver>,
        registry: Arc<ProviderRegistry>,
        classifier: Arc<dyn RuleClassifier>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            tokens,
            registry,
            classifier,
            config,
        }
    }

    /// Process one message for one user. Duplicate deliveries are absorbed
    /// by the idempotency guard; every failure before the final record
    /// leaves the message untouched for redelivery.
    pub async fn process(
        &self,
        user_id: &str,
        provider: ProviderKind,
        message_id: &str,
    ) -> Result<ProcessOutcome, PipelineError> {
        if user_id.is_empty() || message_id.is_empty() {
            warn!("Process skipped: missing user or message id");
            return Ok(ProcessOutcome::Skipped);
        }

        // Step 1: idempotency guard
        if self.store.is_processed(provider, message_id).await? {
            debug!(message_id, "Message already processed");
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        // Step 2: access token
        let Some(access_token) = self.tokens.access_token(user_id, provider).await? else {
            warn!(user_id, %provider, "No access token; message left unprocessed");
            return Ok(ProcessOutcome::TokenUnavailable);
        };

        let Some(provider_impl) = self.registry.get(provider) else {
            warn!(%provider, "Provider not registered");
            return Ok(ProcessOutcome::Skipped);
        };

        // Step 3: fetch
        let fetched = match provider_impl.fetch_message(&access_token, message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                warn!(message_id, %provider, "Could not fetch message");
                return Ok(ProcessOutcome::FetchFailed);
            }
            Err(e) => {
                warn!(message_id, %provider, "Message fetch failed: {e}");
                return Ok(ProcessOutcome::FetchFailed);
            }
        };

        let body_snippet = truncate_body(&fetched.body_snippet, self.config.body_truncation_chars);

        // Step 4: rules, then classification
        let rules = self.store.list_rules(user_id).await?;
        let enabled: Vec<Rule> = rules.into_iter().filter(|r| r.enabled).collect();

        if enabled.is_empty() {
            debug!(user_id, "No enabled rules; forcing no-match");
            return self
                .record_and_mark(user_id, provider, message_id, &fetched.subject, "NONE", "")
                .await;
        }

        let matched_name = self
            .classifier
            .classify(&fetched.from, &fetched.subject, &body_snippet, &enabled)
            .await?;

        // First enabled rule whose name matches, case-insensitively. The
        // activity record keeps the name exactly as the classifier wrote it.
        let matched_rule = matched_name
            .as_deref()
            .and_then(|name| enabled.iter().find(|r| r.name.eq_ignore_ascii_case(name)));
        let rule_applied = matched_name.as_deref().unwrap_or("NONE");
        let destination = matched_rule.map(|r| r.destination.as_str()).unwrap_or("");

        // Step 5: apply
        if let Some(rule) = matched_rule {
            let applied = match provider_impl
                .apply_action(&access_token, message_id, &rule.destination)
                .await
            {
                Ok(applied) => applied,
                Err(e) => {
                    warn!(rule = %rule.name, message_id, "Provider action failed: {e}");
                    false
                }
            };
            if !applied {
                warn!(rule = %rule.name, message_id, "Could not apply rule; message left for redelivery");
                return Ok(ProcessOutcome::ActionFailed);
            }
        }

        // Step 6: record, then mark
        self.record_and_mark(
            user_id,
            provider,
            message_id,
            &fetched.subject,
            rule_applied,
            destination,
        )
        .await
    }

    async fn record_and_mark(
        &self,
        user_id: &str,
        provider: ProviderKind,
        message_id: &str,
        subject: &str,
        rule_applied: &str,
        destination: &str,
    ) -> Result<ProcessOutcome, PipelineError> {
        let record = ActivityRecord::new(
            user_id,
            Utc::now(),
            subject,
            rule_applied,
            destination,
            provider,
            message_id,
        );
        self.store
            .append_activity(&record, self.config.activity_cap)
            .await?;
        self.store.mark_processed(provider, message_id).await?;

        info!(message_id, rule = rule_applied, "Message processed");
        Ok(ProcessOutcome::Completed {
            rule_applied: rule_applied.to_string(),
        })
    }
}

/// Truncate a body snippet to the configured character limit. A non-positive
/// limit disables truncation.
fn truncate_body(body: &str, limit: i64) -> String {
    if limit <= 0 {
        return body.to_string();
    }
    body.chars().take(limit as usize).collect()
}
