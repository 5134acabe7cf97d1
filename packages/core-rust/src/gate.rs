//! Creation gate and in-flight drain tracking.
//!
//! Every manager owns a [`CreationGate`]: a boolean circuit breaker plus two
//! [`InFlight`] counters. One counts calls currently inside
//! `create_and_start`, the other counts units created but not yet completed.
//! Counters are held through RAII [`InFlightGuard`]s, so a creation path that
//! bails out early (or panics) still releases its slot.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{LifecycleError, Result, UnitKind};

/// Counter of in-flight work with an awaitable "became idle" signal.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one unit of in-flight work, released when the guard drops.
    #[must_use]
    pub fn guard(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves once the counter is zero. Returns immediately if it already is.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the
            // await is not missed.
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII guard that decrements its [`InFlight`] counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// Circuit breaker plus drain counters guarding unit creation.
#[derive(Debug)]
pub struct CreationGate {
    unit: UnitKind,
    open: AtomicBool,
    creating: Arc<InFlight>,
    live: Arc<InFlight>,
}

impl CreationGate {
    /// Creates an open gate for units of kind `unit`.
    #[must_use]
    pub fn new(unit: UnitKind) -> Self {
        Self {
            unit,
            open: AtomicBool::new(true),
            creating: Arc::new(InFlight::new()),
            live: Arc::new(InFlight::new()),
        }
    }

    /// Opens or closes the gate. Idempotent.
    pub fn allow_to_create(&self, allow: bool) {
        self.open.store(allow, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Enters a creation call.
    ///
    /// The slot is registered before the gate is checked, so once
    /// [`wait`](Self::wait) observes zero creating calls after the gate was
    /// closed, no creation can still be in flight.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::CreationDisabled`] if the gate is closed.
    pub fn enter(&self) -> Result<InFlightGuard> {
        let guard = self.creating.guard();
        if self.is_open() {
            Ok(guard)
        } else {
            Err(LifecycleError::CreationDisabled { unit: self.unit })
        }
    }

    /// Registers a successfully created unit until the guard is dropped.
    #[must_use]
    pub fn track_live(&self) -> InFlightGuard {
        self.live.guard()
    }

    /// Calls currently inside `create_and_start`.
    #[must_use]
    pub fn creating_count(&self) -> usize {
        self.creating.count()
    }

    /// Units created and not yet completed.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.count()
    }

    /// Resolves once no creation call is in flight and no created unit
    /// remains incomplete.
    pub async fn wait(&self) {
        self.creating.wait_idle().await;
        self.live.wait_idle().await;
    }

    /// Resolves once no creation call is in flight.
    pub async fn wait_creating(&self) {
        self.creating.wait_idle().await;
    }

    /// Permanently closes the gate after a failed creation or completion and
    /// hands the error back.
    pub(crate) fn trip(&self, err: LifecycleError) -> LifecycleError {
        self.allow_to_create(false);
        tracing::error!(unit = %self.unit, error = %err, "creation gate closed");
        err
    }
}

/// A live unit in a manager's bookkeeping. Dropping the entry releases the
/// unit's slot in the gate's live counter.
#[derive(Debug)]
pub(crate) struct Tracked<T> {
    pub(crate) unit: Arc<T>,
    _live: InFlightGuard,
}

impl<T> Tracked<T> {
    pub(crate) fn new(unit: Arc<T>, live: InFlightGuard) -> Self {
        Self { unit, _live: live }
    }
}
