//! Per-call cancellation and deadline propagation.
//!
//! # Responsibility
//! - Carry a caller's deadline and/or cancel flag into repository calls.
//! - Abort an in-flight SQLite statement once the context is done.
//!
//! # Invariants
//! - A done context never starts a new statement.
//! - The interrupt hook is removed when the guarding call returns.

use rusqlite::Connection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// VM instructions between two cancellation checks.
const INTERRUPT_CHECK_INTERVAL_OPS: i32 = 1_000;

/// Cancellation scope for one or more repository calls.
///
/// Cloning shares the cancel flag, so a clone handed to another thread is
/// cancelled together with the original.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    deadline: Option<Instant>,
    cancelled: Option<Arc<AtomicBool>>,
}

/// Handle that cancels every context created from the same
/// [`QueryContext::cancellable`] call.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

impl QueryContext {
    /// Context that never expires.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancelled: None,
        }
    }

    /// Context plus the handle that cancels it.
    pub fn cancellable() -> (Self, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = Self {
            deadline: None,
            cancelled: Some(Arc::clone(&flag)),
        };
        (ctx, CancelHandle { flag })
    }

    /// Child context bounded additionally by `timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancelled: self.cancelled.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the deadline passed or cancellation was requested.
    pub fn is_done(&self) -> bool {
        is_done(self.deadline, self.cancelled.as_deref())
    }

    /// Installs an interrupt hook on `conn` for the guard's lifetime.
    ///
    /// Background contexts install nothing.
    pub(crate) fn interrupt_guard<'c>(&self, conn: &'c Connection) -> InterruptGuard<'c> {
        if self.deadline.is_none() && self.cancelled.is_none() {
            return InterruptGuard { conn: None };
        }

        let deadline = self.deadline;
        let cancelled = self.cancelled.clone();
        conn.progress_handler(
            INTERRUPT_CHECK_INTERVAL_OPS,
            Some(move || is_done(deadline, cancelled.as_deref())),
        );
        InterruptGuard { conn: Some(conn) }
    }
}

fn is_done(deadline: Option<Instant>, cancelled: Option<&AtomicBool>) -> bool {
    if cancelled.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
        return true;
    }
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// Removes the interrupt hook installed by [`QueryContext::interrupt_guard`].
pub(crate) struct InterruptGuard<'c> {
    conn: Option<&'c Connection>,
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn {
            conn.progress_handler(0, None::<fn() -> bool>);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::QueryContext;
    use std::time::{Duration, Instant};

    #[test]
    fn background_context_is_never_done() {
        assert!(!QueryContext::background().is_done());
    }

    #[test]
    fn expired_deadline_is_done() {
        let ctx = QueryContext::with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(ctx.is_done());
    }

    #[test]
    fn cancel_handle_reaches_clones() {
        let (ctx, handle) = QueryContext::cancellable();
        let clone = ctx.clone();
        assert!(!clone.is_done());
        handle.cancel();
        assert!(ctx.is_done());
        assert!(clone.is_done());
    }

    #[test]
    fn child_keeps_the_earlier_deadline() {
        let parent = QueryContext::with_timeout(Duration::from_millis(10));
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
