//! Service layer orchestrating repository operations.
//!
//! # Responsibility
//! - Apply admission policy (per-cell quota) on top of raw persistence.
//! - Keep callers independent from the concrete storage backend.

pub mod subscription_service;
