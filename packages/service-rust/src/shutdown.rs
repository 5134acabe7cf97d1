//! Process shutdown controller.
//!
//! Uses `ArcSwap` for lock-free health state transitions and a `watch`
//! channel to fan the stop signal out to every listener. Implements
//! [`ShutdownHook`], so fatal escalations from the lifecycle engine land here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use causeway_core::ShutdownHook;
use tokio::sync::watch;

/// Service health state, transitioned by the shutdown controller.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Backbone built, not yet serving.
    Starting,
    /// Accepting new transactions.
    Ready,
    /// Creation gates closed, waiting for live units to complete.
    Draining,
    /// Every manager drained.
    Stopped,
}

/// Why shutdown was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Orderly stop requested by the embedding service or a signal.
    Requested,
    /// A lifecycle event could not be recorded.
    Fatal,
}

/// Coordinates process shutdown.
///
/// 1. Health probes read [`health_state`](Self::health_state)
/// 2. [`trigger_shutdown`](Self::trigger_shutdown) (or [`ShutdownHook::stop`])
///    moves to `Draining` and signals every receiver, once
/// 3. The embedding service awaits [`wait_for_shutdown`](Self::wait_for_shutdown),
///    drains the backbone and calls [`set_stopped`](Self::set_stopped)
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    triggered: AtomicBool,
    reason: ArcSwap<Option<StopReason>>,
    health_state: Arc<ArcSwap<HealthState>>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            triggered: AtomicBool::new(false),
            reason: ArcSwap::from_pointee(None),
            health_state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
        }
    }

    /// Transitions to `Ready` unless shutdown already began.
    pub fn set_ready(&self) {
        if !self.is_triggered() {
            self.health_state.store(Arc::new(HealthState::Ready));
        }
    }

    /// Transitions to `Stopped` after a completed drain.
    pub fn set_stopped(&self) {
        self.health_state.store(Arc::new(HealthState::Stopped));
    }

    /// Returns a receiver that flips to `true` when shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Moves to `Draining` and signals every receiver.
    ///
    /// Only the first call has any effect; returns whether this call was it.
    pub fn trigger_shutdown(&self, reason: StopReason) -> bool {
        if self.triggered.swap(true, Ordering::AcqRel) {
            tracing::debug!(?reason, "shutdown already in progress");
            return false;
        }
        self.reason.store(Arc::new(Some(reason)));
        self.health_state.store(Arc::new(HealthState::Draining));
        // Receivers may have been dropped.
        let _ = self.shutdown_signal.send(true);
        match reason {
            StopReason::Fatal => tracing::error!(?reason, "shutdown triggered"),
            StopReason::Requested => tracing::info!(?reason, "shutdown triggered"),
        }
        true
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Reason passed to the first [`trigger_shutdown`](Self::trigger_shutdown).
    #[must_use]
    pub fn stop_reason(&self) -> Option<StopReason> {
        **self.reason.load()
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// Returns a shared handle to the health state for probes.
    #[must_use]
    pub fn health_state_handle(&self) -> Arc<ArcSwap<HealthState>> {
        Arc::clone(&self.health_state)
    }

    /// Resolves once shutdown is triggered, by the hook or by Ctrl-C.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_receiver();
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = rx.wait_for(|stop| *stop) => {}
            () = ctrl_c => {
                self.trigger_shutdown(StopReason::Requested);
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHook for ShutdownController {
    fn stop(&self) {
        self.trigger_shutdown(StopReason::Fatal);
    }
}
