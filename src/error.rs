//! Error types for mailsieve.

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("No provider configured for {0}")]
    ProviderNotConfigured(String),
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Envelope-encryption errors.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid master key: {0}")]
    InvalidMasterKey(String),

    #[error("Key wrap failed: {0}")]
    Wrap(String),

    #[error("Key unwrap failed: {0}")]
    Unwrap(String),

    #[error("Malformed envelope blob: {0}")]
    MalformedBlob(String),

    #[error("Cipher operation failed: {0}")]
    Cipher(String),
}

/// Mail-provider errors (fetch, apply, refresh, watch).
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    UnknownKind(String),

    #[error("{provider} request failed: {reason}")]
    Request { provider: &'static str, reason: String },

    #[error("{provider} returned HTTP {status}")]
    Status { provider: &'static str, status: u16 },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: &'static str, reason: String },
}

/// Access-token resolution errors.
///
/// Only infrastructure failures surface here; a missing, undecryptable, or
/// unrefreshable token is reported as an absent token, not an error.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Classification-oracle errors. Transport failures propagate to the caller;
/// unparseable oracle output does not (it reads as "no match").
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Oracle request failed: {0}")]
    Request(String),

    #[error("Oracle returned HTTP {0}")]
    Status(u16),
}

/// Pipeline orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Token resolution failed: {0}")]
    Token(#[from] TokenError),

    #[error("Classification failed: {0}")]
    Classifier(#[from] ClassifierError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
