//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the subscription data access contract.
//! - Isolate SQLite query details from service orchestration.
//!
//! # Invariants
//! - Repository writes run `Subscription::validate()` and cell validation
//!   before persistence.
//! - Repository APIs return semantic errors (`NotFound`, `VersionConflict`,
//!   `BadRequest`) in addition to DB transport errors.

pub mod subscription_repo;
