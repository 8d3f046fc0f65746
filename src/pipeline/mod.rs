//! Per-message triage pipeline.
//!
//! Every message id, whether it arrived by push notification or manual
//! reprocess, flows through the same orchestrator:
//! 1. idempotency guard
//! 2. token resolution
//! 3. provider fetch
//! 4. classification against the user's enabled rules
//! 5. provider action (label or move)
//! 6. activity record, then processed mark
//!
//! Nothing is recorded for a message until its action has stuck, so any
//! failed run is rerun in full on redelivery.

pub mod processor;

pub use processor::{MessageProcessor, ProcessOutcome};
