//! Subscription domain model.
//!
//! # Responsibility
//! - Define the subscription record persisted by the repository layer.
//! - Define the opaque `Version` token used for compare-and-swap writes.
//!
//! # Invariants
//! - `id` and `owner` never change after the first successful insert.
//! - `version == None` means the record has never been persisted.
//! - `notification_index` only grows.
//! - `end_time` should not be earlier than `start_time` when both are set.

use crate::model::cell::CellId;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

static CALLBACK_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://[^\s/?#]+[^\s]*$").expect("valid callback url regex"));

/// Stable identifier of a subscription.
pub type SubscriptionId = Uuid;

/// Identity of the actor that registered a subscription.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Owner(String);

impl Owner {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Owner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Owner {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Owner {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque concurrency token naming one written state of a subscription row.
///
/// Callers may only compare tokens and carry them back to the store. The
/// string form is stable so API layers can round-trip it through clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Version(i64);

impl Version {
    /// Wraps the store-assigned token: a microsecond-scaled write time,
    /// bumped past every token the store handed out before.
    pub(crate) fn from_write_timestamp(micros: i64) -> Self {
        Self(micros)
    }

    pub(crate) fn write_timestamp(self) -> i64 {
        self.0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Version {
    type Err = SubscriptionValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(value, 16)
            .map(|raw| Self(raw as i64))
            .map_err(|_| SubscriptionValidationError::InvalidVersion(value.to_string()))
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Version {
    type Error = SubscriptionValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Client-registered interest in changes inside a set of cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub owner: Owner,
    /// Notification callback target.
    pub url: String,
    /// Advanced by the store whenever search traffic touches `cells`.
    pub notification_index: u32,
    pub cells: Vec<CellId>,
    /// Unix epoch milliseconds.
    pub start_time: Option<i64>,
    /// Unix epoch milliseconds. Subscriptions without an end are never active.
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

impl Subscription {
    /// Creates an unpersisted subscription with a generated stable ID.
    pub fn new(owner: impl Into<Owner>, url: impl Into<String>, cells: Vec<CellId>) -> Self {
        Self::with_id(Uuid::new_v4(), owner, url, cells)
    }

    /// Creates an unpersisted subscription with a caller-provided ID.
    ///
    /// API layers use this when the client chose the identifier.
    pub fn with_id(
        id: SubscriptionId,
        owner: impl Into<Owner>,
        url: impl Into<String>,
        cells: Vec<CellId>,
    ) -> Self {
        Self {
            id,
            owner: owner.into(),
            url: url.into(),
            notification_index: 0,
            cells,
            start_time: None,
            end_time: None,
            version: None,
        }
    }

    /// Sets the validity window, both bounds in epoch milliseconds.
    pub fn with_window(mut self, start_time: Option<i64>, end_time: Option<i64>) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    pub fn is_persisted(&self) -> bool {
        self.version.is_some()
    }

    /// Whether search, quota and notification operations would consider this
    /// subscription at `now_ms`.
    pub fn is_active_at(&self, now_ms: i64) -> bool {
        self.end_time.is_some_and(|end| end >= now_ms)
    }

    /// Checks field-level invariants that do not need the store.
    pub fn validate(&self) -> Result<(), SubscriptionValidationError> {
        if self.owner.as_str().trim().is_empty() {
            return Err(SubscriptionValidationError::EmptyOwner);
        }
        if !CALLBACK_URL_RE.is_match(&self.url) {
            return Err(SubscriptionValidationError::InvalidUrl(self.url.clone()));
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if end < start {
                return Err(SubscriptionValidationError::InvalidWindow { start, end });
            }
        }
        Ok(())
    }
}

/// Field-level validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionValidationError {
    EmptyOwner,
    InvalidUrl(String),
    InvalidWindow { start: i64, end: i64 },
    InvalidVersion(String),
}

impl Display for SubscriptionValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyOwner => write!(f, "subscription owner must not be empty"),
            Self::InvalidUrl(url) => write!(f, "invalid subscription callback url `{url}`"),
            Self::InvalidWindow { start, end } => {
                write!(f, "subscription ends at {end} before it starts at {start}")
            }
            Self::InvalidVersion(value) => write!(f, "invalid version token `{value}`"),
        }
    }
}

impl Error for SubscriptionValidationError {}
