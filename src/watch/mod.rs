//! Gmail push-watch renewal — keeps push leases alive ahead of expiry.
//!
//! Gmail watch registrations lapse after about a week, so a daily sweep
//! re-registers every lease expiring within the next day. Leases that fail
//! to renew are retried on the next sweep; push delivery degrades quietly
//! in the meantime rather than erroring.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WatchConfig;
use crate::error::Error;
use crate::providers::{ProviderKind, ProviderRegistry};
use crate::store::Store;
use crate::tokens::TokenResolver;

/// Leases expiring within this window are renewed by the sweep.
const RENEWAL_HORIZON_HOURS: i64 = 24;

/// Renews Gmail push-watch leases that are close to expiry.
pub struct WatchRenewer {
    store: Arc<dyn Store>,
    tokens: Arc<TokenResolver>,
    registry: Arc<ProviderRegistry>,
    config: WatchConfig,
}

impl WatchRenewer {
    pub fn new(
        store: Arc<dyn Store>,
        tokens: Arc<TokenResolver>,
        registry: Arc<ProviderRegistry>,
        config: WatchConfig,
    ) -> Self {
        Self {
            store,
            tokens,
            registry,
            config,
        }
    }

    /// Renew every lease expiring within the horizon. Returns the number of
    /// leases actually renewed.
    ///
    /// A lease that cannot be renewed (no token, provider refusal) is skipped
    /// with a warning and picked up again on the next sweep. Storage failures
    /// abort the sweep.
    pub async fn renew_due_leases(&self) -> Result<usize, Error> {
        let topic = self
            .config
            .pubsub_topic
            .as_deref()
            .map(str::trim)
            .unwrap_or("");
        if topic.is_empty() {
            debug!("No Pub/Sub topic configured; skipping watch renewal");
            return Ok(0);
        }

        let Some(provider) = self.registry.get(ProviderKind::Gmail) else {
            debug!("Gmail provider not registered; skipping watch renewal");
            return Ok(0);
        };
        let Some(watch) = provider.watch() else {
            debug!("Gmail provider has no push-watch support; skipping watch renewal");
            return Ok(0);
        };

        let threshold =
            (Utc::now() + chrono::Duration::hours(RENEWAL_HORIZON_HOURS)).timestamp_millis();
        let due: Vec<_> = self
            .store
            .list_watch_leases()
            .await?
            .into_iter()
            .filter(|lease| lease.expires_at_ms < threshold)
            .collect();

        if due.is_empty() {
            return Ok(0);
        }
        info!(count = due.len(), "Checking Gmail watch leases for renewal");

        let mut renewed = 0usize;
        for lease in due {
            let user_id = lease.user_id.as_str();

            let Some(token) = self.tokens.access_token(user_id, ProviderKind::Gmail).await? else {
                warn!(user_id, "No access token; skipping watch renewal");
                continue;
            };

            let expires_at_ms = match watch.renew_watch(&token).await {
                Ok(ms) => ms,
                Err(e) => {
                    warn!(user_id, "Watch renewal failed: {e}");
                    continue;
                }
            };
            if expires_at_ms <= 0 {
                // Watch accepted but no expiration came back; keep the old
                // lease so the next sweep tries again.
                debug!(user_id, "Watch renewed without expiration; lease unchanged");
                continue;
            }

            self.store.upsert_watch_lease(user_id, expires_at_ms).await?;
            if let Some(mut connection) = self
                .store
                .get_connection(user_id, ProviderKind::Gmail)
                .await?
            {
                connection.watch_expires_at_ms = Some(expires_at_ms);
                self.store.upsert_connection(&connection).await?;
            }

            info!(user_id, expires_at_ms, "Renewed Gmail watch");
            renewed += 1;
        }

        Ok(renewed)
    }
}

/// Next fire time of a cron expression, if it has one.
pub fn next_cron_fire(schedule: &str) -> Result<Option<DateTime<Utc>>, String> {
    let cron_schedule =
        cron::Schedule::from_str(schedule).map_err(|e| format!("invalid cron: {e}"))?;
    Ok(cron_schedule.upcoming(Utc).next())
}

/// Spawn the renewal sweep as a background task firing on the configured
/// cron schedule.
///
/// Returns a `JoinHandle` and shutdown flag. The flag is checked after each
/// wakeup, so flipping it stops the task at its next fire.
pub fn spawn_watch_renewal(renewer: Arc<WatchRenewer>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(cron = %renewer.config.renewal_cron, "Watch renewal scheduled");

        loop {
            let next = match next_cron_fire(&renewer.config.renewal_cron) {
                Ok(Some(next)) => next,
                Ok(None) => {
                    warn!("Renewal cron has no upcoming fire; watch renewal stopped");
                    return;
                }
                Err(e) => {
                    error!("Bad renewal cron expression: {e}; watch renewal stopped");
                    return;
                }
            };

            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Watch renewal shutting down");
                return;
            }

            match renewer.renew_due_leases().await {
                Ok(count) if count > 0 => info!(count, "Watch renewal sweep complete"),
                Ok(_) => {}
                Err(e) => error!("Watch renewal sweep failed: {e}"),
            }
        }
    });

    (handle, shutdown_flag)
}
