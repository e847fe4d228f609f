//! Subscription repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide lifecycle, spatial search, quota and notification APIs over
//!   canonical `subscriptions` storage.
//! - Keep SQL, cell encoding and row mapping inside the persistence boundary.
//!
//! # Invariants
//! - Every write is a single statement; SQLite statement atomicity is the
//!   only concurrency control. No in-process locks are held.
//! - Update/Delete are compare-and-swap on `updated_at`, the version token.
//! - Version tokens are unique across the store and strictly increasing.
//! - Search, quota and notification paths only see rows with
//!   `ends_at >= now`, where `now` comes from the injected clock.
//! - Cell overlap is answered through the `subscription_cells` index table.

use crate::clock::{Clock, SystemClock};
use crate::context::QueryContext;
use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::cell::{
    decode_cells, encode_cells, CellError, CellId, CellValidator, S2CellValidator,
};
use crate::model::subscription::{
    Owner, Subscription, SubscriptionId, SubscriptionValidationError, Version,
};
use log::{debug, warn};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

const SUBSCRIPTION_FIELDS: &str =
    "id, owner, url, notification_index, cells, starts_at, ends_at, updated_at";

/// Next version token: the statement's wall-clock time (SQLite resolves
/// `julianday('now')` to milliseconds, scaled here to microseconds) or one
/// past the store-wide `version_clock`, whichever is larger. Triggers move
/// the clock forward inside the same writing statement.
const NEXT_VERSION_SQL: &str = "MAX(
    CAST((julianday('now') - 2440587.5) * 86400000000.0 AS INTEGER),
    (SELECT last_version + 1 FROM version_clock WHERE id = 1)
)";

/// Restricts `subscriptions` to rows sharing a cell with the JSON array
/// bound at `?1`.
const OVERLAPS_CELLS_SQL: &str = "id IN (
    SELECT subscription_id
    FROM subscription_cells
    WHERE cell_id IN (SELECT value FROM json_each(?1))
)";

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for subscription persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    /// Field-level validation failed before any write.
    Validation(SubscriptionValidationError),
    /// A cell failed legality checks before any write.
    Cell(CellError),
    /// Storage or connectivity failure, passed through.
    Db(DbError),
    /// Structurally invalid request, e.g. an empty search area.
    BadRequest(String),
    NotFound(SubscriptionId),
    AlreadyExists(SubscriptionId),
    /// CAS rejected: the stored version moved on.
    VersionConflict {
        id: SubscriptionId,
        current: Version,
    },
    /// CAS rejected: the subscription belongs to someone else.
    OwnerMismatch(SubscriptionId),
    /// A uniqueness-guaranteed query returned several rows.
    InvariantViolation(String),
    /// The caller's context expired before or during the statement.
    Cancelled,
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
    InvalidData(String),
}

impl RepoError {
    /// Whether re-reading and resubmitting could succeed.
    pub fn is_retryable_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Cell(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::BadRequest(message) => write!(f, "bad request: {message}"),
            Self::NotFound(id) => write!(f, "subscription not found: {id}"),
            Self::AlreadyExists(id) => write!(f, "subscription already exists: {id}"),
            Self::VersionConflict { id, current } => write!(
                f,
                "subscription {id} was modified concurrently; current version is {current}"
            ),
            Self::OwnerMismatch(id) => write!(f, "subscription {id} is owned by another actor"),
            Self::InvariantViolation(message) => {
                write!(f, "subscription store invariant violated: {message}")
            }
            Self::Cancelled => write!(f, "subscription query cancelled"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "subscription repository requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "subscription repository requires table `{table}`")
            }
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "subscription repository requires column `{column}` in table `{table}`"
            ),
            Self::InvalidData(message) => write!(f, "invalid persisted subscription: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Cell(err) => Some(err),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SubscriptionValidationError> for RepoError {
    fn from(value: SubscriptionValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<CellError> for RepoError {
    fn from(value: CellError) -> Self {
        Self::Cell(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        match value {
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.code == ErrorCode::OperationInterrupted =>
            {
                Self::Cancelled
            }
            other => Self::Db(DbError::Sqlite(other)),
        }
    }
}

/// Repository interface for subscription storage.
///
/// Every method takes the caller's [`QueryContext`]; a done context aborts
/// the call with [`RepoError::Cancelled`].
pub trait SubscriptionRepository {
    /// Loads one subscription by id.
    fn get_subscription(&self, ctx: &QueryContext, id: SubscriptionId)
        -> RepoResult<Subscription>;
    /// Persists a new subscription. `version` must be `None`.
    fn insert_subscription(
        &self,
        ctx: &QueryContext,
        subscription: &Subscription,
    ) -> RepoResult<Subscription>;
    /// Overwrites a subscription if its stored version still equals
    /// `subscription.version`.
    fn update_subscription(
        &self,
        ctx: &QueryContext,
        subscription: &Subscription,
    ) -> RepoResult<Subscription>;
    /// Removes a subscription if id, owner and version all match; returns
    /// the removed state.
    fn delete_subscription(
        &self,
        ctx: &QueryContext,
        subscription: &Subscription,
    ) -> RepoResult<Subscription>;
    /// Active subscriptions sharing at least one cell with `cells`.
    fn search_subscriptions(
        &self,
        ctx: &QueryContext,
        cells: &[CellId],
    ) -> RepoResult<Vec<Subscription>>;
    /// Same as [`Self::search_subscriptions`], restricted to `owner`.
    fn search_subscriptions_by_owner(
        &self,
        ctx: &QueryContext,
        cells: &[CellId],
        owner: &Owner,
    ) -> RepoResult<Vec<Subscription>>;
    /// Highest number of `owner`'s active subscriptions covering any one of
    /// `cells`, or 0.
    fn max_subscription_count_in_cells_by_owner(
        &self,
        ctx: &QueryContext,
        cells: &[CellId],
        owner: &Owner,
    ) -> RepoResult<u32>;
    /// Increments `notification_index` of every active subscription
    /// overlapping `cells` by one and returns the updated rows.
    fn advance_notification_indexes(
        &self,
        ctx: &QueryContext,
        cells: &[CellId],
    ) -> RepoResult<Vec<Subscription>>;
}

/// SQLite-backed subscription repository.
///
/// Borrows a migrated connection; concurrent callers should each hold their
/// own connection to the same database.
pub struct SqliteSubscriptionRepository<'conn> {
    conn: &'conn Connection,
    clock: Arc<dyn Clock>,
    cell_validator: Arc<dyn CellValidator>,
}

impl<'conn> SqliteSubscriptionRepository<'conn> {
    /// Constructs a repository from a migrated/ready connection, using the
    /// system clock and the default S2 cell rules.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_subscription_connection_ready(conn)?;
        Ok(Self {
            conn,
            clock: Arc::new(SystemClock),
            cell_validator: Arc::new(S2CellValidator::default()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cell_validator(mut self, cell_validator: Arc<dyn CellValidator>) -> Self {
        self.cell_validator = cell_validator;
        self
    }

    /// Runs a statement expected to yield any number of subscription rows.
    fn process(
        &self,
        ctx: &QueryContext,
        sql: &str,
        bind_values: Vec<Value>,
    ) -> RepoResult<Vec<Subscription>> {
        if ctx.is_done() {
            return Err(RepoError::Cancelled);
        }
        let _guard = ctx.interrupt_guard(self.conn);

        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut subscriptions = Vec::new();
        while let Some(row) = rows.next()? {
            subscriptions.push(parse_subscription_row(row)?);
        }
        Ok(subscriptions)
    }

    /// Runs a statement expected to yield at most one subscription row.
    ///
    /// `Ok(None)` means zero rows.
    fn process_one(
        &self,
        ctx: &QueryContext,
        sql: &str,
        bind_values: Vec<Value>,
    ) -> RepoResult<Option<Subscription>> {
        let mut subscriptions = self.process(ctx, sql, bind_values)?;
        if subscriptions.len() > 1 {
            return Err(RepoError::InvariantViolation(format!(
                "query returned {} subscriptions",
                subscriptions.len()
            )));
        }
        Ok(subscriptions.pop())
    }

    /// Explains why a CAS statement touched no row.
    ///
    /// The read happens after the failed write, so it only reports the state
    /// at that later moment.
    fn classify_cas_miss(
        &self,
        ctx: &QueryContext,
        subscription: &Subscription,
    ) -> RepoResult<RepoError> {
        if ctx.is_done() {
            return Err(RepoError::Cancelled);
        }
        let _guard = ctx.interrupt_guard(self.conn);

        let stored = self
            .conn
            .query_row(
                "SELECT owner, updated_at FROM subscriptions WHERE id = ?1;",
                [subscription.id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        let outcome = match stored {
            None => RepoError::NotFound(subscription.id),
            Some((owner, _)) if owner != subscription.owner.as_str() => {
                RepoError::OwnerMismatch(subscription.id)
            }
            Some((_, updated_at)) => RepoError::VersionConflict {
                id: subscription.id,
                current: Version::from_write_timestamp(updated_at),
            },
        };
        warn!(
            "event=subscription_cas module=repo status=rejected id={} reason={}",
            subscription.id,
            cas_miss_reason(&outcome)
        );
        Ok(outcome)
    }

    fn validate_for_write(&self, subscription: &Subscription) -> RepoResult<()> {
        subscription.validate()?;
        for cell in &subscription.cells {
            self.cell_validator.validate_cell(*cell)?;
        }
        Ok(())
    }

    fn now_value(&self) -> Value {
        Value::Integer(self.clock.now_ms())
    }
}

impl SubscriptionRepository for SqliteSubscriptionRepository<'_> {
    fn get_subscription(
        &self,
        ctx: &QueryContext,
        id: SubscriptionId,
    ) -> RepoResult<Subscription> {
        let sql = format!("SELECT {SUBSCRIPTION_FIELDS} FROM subscriptions WHERE id = ?1;");
        self.process_one(ctx, &sql, vec![Value::Text(id.to_string())])?
            .ok_or(RepoError::NotFound(id))
    }

    fn insert_subscription(
        &self,
        ctx: &QueryContext,
        subscription: &Subscription,
    ) -> RepoResult<Subscription> {
        if subscription.version.is_some() {
            return Err(RepoError::BadRequest(
                "insert requires a subscription without a version".to_string(),
            ));
        }
        self.validate_for_write(subscription)?;

        let sql = format!(
            "INSERT INTO subscriptions ({SUBSCRIPTION_FIELDS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, {NEXT_VERSION_SQL})
             RETURNING {SUBSCRIPTION_FIELDS};"
        );
        let inserted = self
            .process_one(ctx, &sql, write_bind_values(subscription)?)
            .map_err(|err| match err {
                RepoError::Db(DbError::Sqlite(ref sqlite_err))
                    if is_primary_key_violation(sqlite_err) =>
                {
                    RepoError::AlreadyExists(subscription.id)
                }
                other => other,
            })?
            .ok_or_else(|| {
                RepoError::InvariantViolation("insert returned no row".to_string())
            })?;

        debug!(
            "event=subscription_insert module=repo status=ok id={} cells={}",
            inserted.id,
            inserted.cells.len()
        );
        Ok(inserted)
    }

    fn update_subscription(
        &self,
        ctx: &QueryContext,
        subscription: &Subscription,
    ) -> RepoResult<Subscription> {
        let Some(version) = subscription.version else {
            return Err(RepoError::BadRequest(
                "update requires the last known version".to_string(),
            ));
        };
        self.validate_for_write(subscription)?;

        // Owner is part of the match, never rewritten. The counter can only
        // move forward even if the caller carries a stale index.
        let sql = format!(
            "UPDATE subscriptions
             SET
                url = ?3,
                notification_index = MAX(notification_index, ?4),
                cells = ?5,
                starts_at = ?6,
                ends_at = ?7,
                updated_at = {NEXT_VERSION_SQL}
             WHERE id = ?1
               AND owner = ?2
               AND updated_at = ?8
             RETURNING {SUBSCRIPTION_FIELDS};"
        );
        let mut bind_values = write_bind_values(subscription)?;
        bind_values.push(Value::Integer(version.write_timestamp()));

        match self.process_one(ctx, &sql, bind_values)? {
            Some(updated) => {
                debug!(
                    "event=subscription_update module=repo status=ok id={}",
                    updated.id
                );
                Ok(updated)
            }
            None => Err(self.classify_cas_miss(ctx, subscription)?),
        }
    }

    fn delete_subscription(
        &self,
        ctx: &QueryContext,
        subscription: &Subscription,
    ) -> RepoResult<Subscription> {
        let Some(version) = subscription.version else {
            return Err(RepoError::BadRequest(
                "delete requires the last known version".to_string(),
            ));
        };

        let sql = format!(
            "DELETE FROM subscriptions
             WHERE id = ?1
               AND owner = ?2
               AND updated_at = ?3
             RETURNING {SUBSCRIPTION_FIELDS};"
        );
        let bind_values = vec![
            Value::Text(subscription.id.to_string()),
            Value::Text(subscription.owner.as_str().to_string()),
            Value::Integer(version.write_timestamp()),
        ];

        match self.process_one(ctx, &sql, bind_values)? {
            Some(deleted) => {
                debug!(
                    "event=subscription_delete module=repo status=ok id={}",
                    deleted.id
                );
                Ok(deleted)
            }
            None => Err(self.classify_cas_miss(ctx, subscription)?),
        }
    }

    fn search_subscriptions(
        &self,
        ctx: &QueryContext,
        cells: &[CellId],
    ) -> RepoResult<Vec<Subscription>> {
        let cells_json = search_area(cells)?;
        let sql = format!(
            "SELECT {SUBSCRIPTION_FIELDS}
             FROM subscriptions
             WHERE {}
               AND ends_at >= ?2;",
            OVERLAPS_CELLS_SQL
        );
        self.process(ctx, &sql, vec![Value::Text(cells_json), self.now_value()])
    }

    fn search_subscriptions_by_owner(
        &self,
        ctx: &QueryContext,
        cells: &[CellId],
        owner: &Owner,
    ) -> RepoResult<Vec<Subscription>> {
        let cells_json = search_area(cells)?;
        let sql = format!(
            "SELECT {SUBSCRIPTION_FIELDS}
             FROM subscriptions
             WHERE {}
               AND owner = ?2
               AND ends_at >= ?3;",
            OVERLAPS_CELLS_SQL
        );
        self.process(
            ctx,
            &sql,
            vec![
                Value::Text(cells_json),
                Value::Text(owner.as_str().to_string()),
                self.now_value(),
            ],
        )
    }

    fn max_subscription_count_in_cells_by_owner(
        &self,
        ctx: &QueryContext,
        cells: &[CellId],
        owner: &Owner,
    ) -> RepoResult<u32> {
        if cells.is_empty() {
            return Ok(0);
        }
        if ctx.is_done() {
            return Err(RepoError::Cancelled);
        }
        let _guard = ctx.interrupt_guard(self.conn);

        let max: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(per_cell), 0)
             FROM (
                SELECT COUNT(*) AS per_cell
                FROM subscriptions s
                JOIN subscription_cells sc ON sc.subscription_id = s.id
                WHERE s.owner = ?1
                  AND s.ends_at >= ?2
                  AND sc.cell_id IN (SELECT value FROM json_each(?3))
                GROUP BY sc.cell_id
             );",
            params![owner.as_str(), self.clock.now_ms(), encode_cells(cells)?],
            |row| row.get(0),
        )?;

        u32::try_from(max)
            .map_err(|_| RepoError::InvalidData(format!("per-cell count {max} out of range")))
    }

    fn advance_notification_indexes(
        &self,
        ctx: &QueryContext,
        cells: &[CellId],
    ) -> RepoResult<Vec<Subscription>> {
        if cells.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "UPDATE subscriptions
             SET notification_index = notification_index + 1
             WHERE {}
               AND ends_at >= ?2
             RETURNING {SUBSCRIPTION_FIELDS};",
            OVERLAPS_CELLS_SQL
        );
        let advanced = self.process(
            ctx,
            &sql,
            vec![Value::Text(encode_cells(cells)?), self.now_value()],
        )?;

        debug!(
            "event=subscription_advance module=repo status=ok cells={} advanced={}",
            cells.len(),
            advanced.len()
        );
        Ok(advanced)
    }
}

/// Bind values `?1..?7` shared by insert and update.
fn write_bind_values(subscription: &Subscription) -> RepoResult<Vec<Value>> {
    Ok(vec![
        Value::Text(subscription.id.to_string()),
        Value::Text(subscription.owner.as_str().to_string()),
        Value::Text(subscription.url.clone()),
        Value::Integer(i64::from(subscription.notification_index)),
        Value::Text(encode_cells(&subscription.cells)?),
        optional_integer(subscription.start_time),
        optional_integer(subscription.end_time),
    ])
}

fn optional_integer(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

fn search_area(cells: &[CellId]) -> RepoResult<String> {
    if cells.is_empty() {
        return Err(RepoError::BadRequest("no location provided".to_string()));
    }
    Ok(encode_cells(cells)?)
}

fn is_primary_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn cas_miss_reason(err: &RepoError) -> &'static str {
    match err {
        RepoError::NotFound(_) => "not_found",
        RepoError::OwnerMismatch(_) => "owner_mismatch",
        RepoError::VersionConflict { .. } => "version_conflict",
        _ => "other",
    }
}

/// Maps one row in `SUBSCRIPTION_FIELDS` order.
fn parse_subscription_row(row: &Row<'_>) -> RepoResult<Subscription> {
    let id_text: String = row.get(0)?;
    let id = Uuid::parse_str(&id_text).map_err(|_| {
        RepoError::InvalidData(format!("invalid uuid value `{id_text}` in subscriptions.id"))
    })?;

    let index: i64 = row.get(3)?;
    let notification_index = u32::try_from(index).map_err(|_| {
        RepoError::InvalidData(format!(
            "invalid notification_index `{index}` for subscription {id}"
        ))
    })?;

    let cells_text: String = row.get(4)?;
    let cells = decode_cells(&cells_text)?;

    Ok(Subscription {
        id,
        owner: Owner::new(row.get::<_, String>(1)?),
        url: row.get(2)?,
        notification_index,
        cells,
        start_time: row.get(5)?,
        end_time: row.get(6)?,
        version: Some(Version::from_write_timestamp(row.get(7)?)),
    })
}

fn ensure_subscription_connection_ready(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    for table in ["subscriptions", "subscription_cells", "version_clock"] {
        if !table_exists(conn, table)? {
            return Err(RepoError::MissingRequiredTable(table));
        }
    }

    for column in [
        "id",
        "owner",
        "url",
        "notification_index",
        "cells",
        "starts_at",
        "ends_at",
        "updated_at",
    ] {
        if !table_has_column(conn, "subscriptions", column)? {
            return Err(RepoError::MissingRequiredColumn {
                table: "subscriptions",
                column,
            });
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM pragma_table_info(?1)
            WHERE name = ?2
        );",
        [table, column],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}
