//! mailsieve — idempotent email-triage pipeline.

pub mod classifier;
pub mod config;
pub mod crypto;
pub mod error;
pub mod pipeline;
pub mod providers;
pub mod server;
pub mod store;
pub mod tokens;
pub mod watch;
