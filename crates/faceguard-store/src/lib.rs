//! faceguard-store: SQLite persistence for enrolled users and the access log.

pub mod store;

pub use store::{AccessLogRecord, Store, StoreError, StoreStats, User};
