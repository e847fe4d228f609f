//! Subscription persistence and concurrency control for shared-airspace
//! awareness.
//!
//! This crate owns the subscription invariants: compare-and-swap writes,
//! cell-overlap search, per-cell quota counting and notification index
//! advancement.

pub mod clock;
pub mod context;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{CancelHandle, QueryContext};
pub use db::{open_db, open_db_in_memory, open_db_with_config, DbError, StoreConfig};
pub use logging::{default_log_level, init_logging, logging_status, LogConfig};
pub use model::cell::{CellError, CellId, CellValidator, S2CellValidator};
pub use model::subscription::{
    Owner, Subscription, SubscriptionId, SubscriptionValidationError, Version,
};
pub use repo::subscription_repo::{
    RepoError, RepoResult, SqliteSubscriptionRepository, SubscriptionRepository,
};
pub use service::subscription_service::{
    QuotaPolicy, ServiceError, ServiceResult, SubscriptionService,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
