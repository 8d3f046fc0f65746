//! Persistence layer — libSQL-backed storage for connections, rules,
//! dedup markers, activity, and watch leases.

pub mod activity_key;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use activity_key::activity_key;
pub use libsql_backend::LibSqlStore;
pub use traits::{ActivityRecord, ProviderConnection, Rule, Store, WatchLease};
