//! Subscription use-case service.
//!
//! # Responsibility
//! - Provide stable entry points for API-layer callers.
//! - Enforce the per-owner, per-cell subscription quota on creation.
//! - Delegate persistence to repository implementations.
//!
//! # Invariants
//! - Service APIs never bypass repository validation/CAS contracts.
//! - Service layer remains storage-agnostic.
//! - Conflicts are surfaced, never retried here.

use crate::context::QueryContext;
use crate::model::cell::CellId;
use crate::model::subscription::{Owner, Subscription, SubscriptionId};
use crate::repo::subscription_repo::{RepoError, SubscriptionRepository};
use log::info;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Default cap on an owner's active subscriptions over any single cell.
pub const DEFAULT_MAX_SUBSCRIPTIONS_PER_CELL: u32 = 10;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Admission policy for new subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub max_subscriptions_per_cell: u32,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            max_subscriptions_per_cell: DEFAULT_MAX_SUBSCRIPTIONS_PER_CELL,
        }
    }
}

#[derive(Debug)]
pub enum ServiceError {
    Repo(RepoError),
    /// Creating one more subscription would exceed the per-cell quota.
    QuotaExceeded {
        owner: Owner,
        limit: u32,
        current: u32,
    },
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repo(err) => write!(f, "{err}"),
            Self::QuotaExceeded {
                owner,
                limit,
                current,
            } => write!(
                f,
                "owner {owner} already has {current} subscriptions in one cell (limit {limit})"
            ),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::QuotaExceeded { .. } => None,
        }
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Use-case service wrapper for subscription operations.
pub struct SubscriptionService<R: SubscriptionRepository> {
    repo: R,
    quota: QuotaPolicy,
}

impl<R: SubscriptionRepository> SubscriptionService<R> {
    /// Creates a service with the default quota policy.
    pub fn new(repo: R) -> Self {
        Self::with_quota(repo, QuotaPolicy::default())
    }

    pub fn with_quota(repo: R, quota: QuotaPolicy) -> Self {
        Self { repo, quota }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Creates a subscription after checking the owner's per-cell quota.
    ///
    /// The count and the insert are separate statements, so owners racing
    /// their own creates can overshoot the limit by the number of racers.
    pub fn create_subscription(
        &self,
        ctx: &QueryContext,
        subscription: &Subscription,
    ) -> ServiceResult<Subscription> {
        let current = self.repo.max_subscription_count_in_cells_by_owner(
            ctx,
            &subscription.cells,
            &subscription.owner,
        )?;
        let limit = self.quota.max_subscriptions_per_cell;
        if current >= limit {
            info!(
                "event=subscription_create module=service status=rejected reason=quota owner={} current={} limit={}",
                subscription.owner, current, limit
            );
            return Err(ServiceError::QuotaExceeded {
                owner: subscription.owner.clone(),
                limit,
                current,
            });
        }

        Ok(self.repo.insert_subscription(ctx, subscription)?)
    }

    /// Creates unversioned subscriptions and CAS-updates versioned ones.
    pub fn put_subscription(
        &self,
        ctx: &QueryContext,
        subscription: &Subscription,
    ) -> ServiceResult<Subscription> {
        if subscription.is_persisted() {
            return Ok(self.repo.update_subscription(ctx, subscription)?);
        }
        self.create_subscription(ctx, subscription)
    }

    pub fn get_subscription(
        &self,
        ctx: &QueryContext,
        id: SubscriptionId,
    ) -> ServiceResult<Subscription> {
        Ok(self.repo.get_subscription(ctx, id)?)
    }

    /// Deletes with the caller's owner and last known version.
    pub fn delete_subscription(
        &self,
        ctx: &QueryContext,
        subscription: &Subscription,
    ) -> ServiceResult<Subscription> {
        Ok(self.repo.delete_subscription(ctx, subscription)?)
    }

    /// Active subscriptions overlapping `cells`, optionally for one owner.
    pub fn search_subscriptions(
        &self,
        ctx: &QueryContext,
        cells: &[CellId],
        owner: Option<&Owner>,
    ) -> ServiceResult<Vec<Subscription>> {
        let found = match owner {
            Some(owner) => self.repo.search_subscriptions_by_owner(ctx, cells, owner)?,
            None => self.repo.search_subscriptions(ctx, cells)?,
        };
        Ok(found)
    }

    /// Marks a change in `cells`: advances every overlapping active
    /// subscription and returns them with their new indexes, ready for
    /// notification delivery by the caller.
    pub fn notify_cells(
        &self,
        ctx: &QueryContext,
        cells: &[CellId],
    ) -> ServiceResult<Vec<Subscription>> {
        Ok(self.repo.advance_notification_indexes(ctx, cells)?)
    }
}
