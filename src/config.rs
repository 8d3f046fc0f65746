//! Configuration types, built from environment variables.

use secrecy::SecretString;

use crate::error::ConfigError;

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum characters of body snippet passed to the classifier.
    /// Zero or negative disables truncation.
    pub body_truncation_chars: i64,
    /// Maximum activity records kept per user.
    pub activity_cap: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            body_truncation_chars: 1000,
            activity_cap: 50,
        }
    }
}

impl PipelineConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let body_truncation_chars: i64 = std::env::var("MAILSIEVE_BODY_TRUNCATION_CHARS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.body_truncation_chars);

        let activity_cap: usize = std::env::var("MAILSIEVE_ACTIVITY_CAP")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.activity_cap);

        Self {
            body_truncation_chars,
            activity_cap,
        }
    }
}

/// Classification-oracle configuration (OpenAI-style chat completions).
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Full URL of the chat-completions endpoint.
    pub url: String,
    pub api_key: SecretString,
    /// Model name sent in the request body; omitted when `None`
    /// (Azure-style deployments encode the model in the URL).
    pub model: Option<String>,
}

impl ClassifierConfig {
    /// Build config from environment variables.
    /// Returns `None` if `CLASSIFIER_URL` is not set (classification disabled;
    /// every message then files as no-match).
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("CLASSIFIER_URL").ok()?;
        let api_key = std::env::var("CLASSIFIER_API_KEY").unwrap_or_default();
        let model = std::env::var("CLASSIFIER_MODEL").ok();

        Some(Self {
            url,
            api_key: SecretString::from(api_key),
            model,
        })
    }
}

/// OAuth client credentials for Google token refresh.
#[derive(Debug, Clone)]
pub struct GoogleOauthConfig {
    pub client_id: String,
    pub client_secret: SecretString,
}

impl GoogleOauthConfig {
    /// Returns `None` if `GOOGLE_CLIENT_ID` is not set (refresh disabled;
    /// the resolver then degrades to stale tokens).
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("GOOGLE_CLIENT_ID").ok()?;
        let client_secret = std::env::var("GOOGLE_CLIENT_SECRET").unwrap_or_default();

        Some(Self {
            client_id,
            client_secret: SecretString::from(client_secret),
        })
    }
}

/// OAuth client credentials for Microsoft token refresh.
#[derive(Debug, Clone)]
pub struct MicrosoftOauthConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    /// Azure AD tenant; the multi-tenant `common` endpoint is used when unset.
    pub tenant_id: Option<String>,
}

impl MicrosoftOauthConfig {
    /// Returns `None` if `MS_CLIENT_ID` is not set.
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("MS_CLIENT_ID").ok()?;
        let client_secret = std::env::var("MS_CLIENT_SECRET").unwrap_or_default();
        let tenant_id = std::env::var("MS_TENANT_ID").ok();

        Some(Self {
            client_id,
            client_secret: SecretString::from(client_secret),
            tenant_id,
        })
    }
}

/// Gmail push-watch configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Pub/Sub topic watch requests subscribe to. Renewal runs are skipped
    /// entirely when unset.
    pub pubsub_topic: Option<String>,
    /// Cron expression for the daily renewal sweep.
    pub renewal_cron: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            pubsub_topic: None,
            renewal_cron: "0 0 2 * * *".to_string(),
        }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let pubsub_topic = std::env::var("GMAIL_PUBSUB_TOPIC").ok();
        let renewal_cron = std::env::var("MAILSIEVE_WATCH_CRON")
            .unwrap_or_else(|_| Self::default().renewal_cron);

        Self {
            pubsub_topic,
            renewal_cron,
        }
    }
}

/// Master-key source for envelope encryption. Chosen once at startup; blobs
/// written under one mode cannot be read under the other.
#[derive(Debug, Clone)]
pub enum MasterKeyConfig {
    /// Remote key-management service (HashiCorp Vault transit engine).
    Vault {
        addr: String,
        token: SecretString,
        key_name: String,
    },
    /// Local AES master key, base64-encoded 32 bytes. INSECURE: the key sits
    /// next to the data it protects. Dev profiles only.
    Local { key_base64: SecretString },
}

impl MasterKeyConfig {
    /// Vault wins when both are configured.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(addr) = std::env::var("VAULT_ADDR") {
            let token = std::env::var("VAULT_TOKEN")
                .map_err(|_| ConfigError::MissingEnvVar("VAULT_TOKEN".to_string()))?;
            let key_name = std::env::var("VAULT_TRANSIT_KEY")
                .unwrap_or_else(|_| "mailsieve-tokens".to_string());
            return Ok(Self::Vault {
                addr,
                token: SecretString::from(token),
                key_name,
            });
        }

        if let Ok(key) = std::env::var("MAILSIEVE_LOCAL_MASTER_KEY") {
            return Ok(Self::Local {
                key_base64: SecretString::from(key),
            });
        }

        Err(ConfigError::MissingEnvVar(
            "VAULT_ADDR or MAILSIEVE_LOCAL_MASTER_KEY".to_string(),
        ))
    }
}
