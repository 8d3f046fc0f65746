//! HTTP ingress — liveness probe, manual processing, and the Gmail push
//! webhook.

pub mod routes;

pub use routes::{AppState, ingress_routes};
