//! Subscription domain model.
//!
//! # Responsibility
//! - Define the subscription record and its concurrency token.
//! - Define spatial cell identifiers and their storage codec.
//!
//! # Invariants
//! - Every subscription is identified by a stable `SubscriptionId`.
//! - Cell coverage has set semantics; order carries no meaning.

pub mod cell;
pub mod subscription;
