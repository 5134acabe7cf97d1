//! Request, response and outbound-call audit entries.
//!
//! These entries have no lifecycle of their own; they are recorded with
//! [`AuditPhase::Observed`] on the context's audit logger and share its
//! fail-fast contract.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use causeway_core::{
    AuditPhase, CallEntry, LifecycleContext, LogEntry, RequestEntry, ResponseEntry,
};

use crate::context::OperationContext;

/// The audit logger rejected an entry. The failure has already been
/// escalated as fatal.
#[derive(Debug, thiserror::Error)]
#[error("could not record {kind} audit entry")]
pub struct AuditError {
    pub kind: &'static str,
    #[source]
    pub source: anyhow::Error,
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Records observed traffic through a [`LifecycleContext`]'s audit logger.
#[derive(Debug, Clone)]
pub struct AuditRecorder {
    ctx: Arc<LifecycleContext>,
}

impl AuditRecorder {
    #[must_use]
    pub fn new(ctx: Arc<LifecycleContext>) -> Self {
        Self { ctx }
    }

    /// Request entry for `ctx`, stamped with the context clock.
    #[must_use]
    pub fn request_entry(
        &self,
        ctx: &OperationContext,
        method: impl Into<String>,
        target: impl Into<String>,
    ) -> RequestEntry {
        RequestEntry {
            correlation: ctx.correlation(),
            method: method.into(),
            target: target.into(),
            received_at: self.ctx.now(),
            user_id: ctx.user_id().map(str::to_owned),
            client_id: ctx.client_id().map(str::to_owned),
        }
    }

    /// # Errors
    ///
    /// Returns [`AuditError`] if the audit logger fails.
    pub async fn request(&self, entry: RequestEntry) -> Result<(), AuditError> {
        self.record(LogEntry::Request(entry)).await
    }

    /// # Errors
    ///
    /// Returns [`AuditError`] if the audit logger fails.
    pub async fn response(&self, entry: ResponseEntry) -> Result<(), AuditError> {
        self.record(LogEntry::Response(entry)).await
    }

    /// # Errors
    ///
    /// Returns [`AuditError`] if the audit logger fails.
    pub async fn call(&self, entry: CallEntry) -> Result<(), AuditError> {
        self.record(LogEntry::Call(entry)).await
    }

    /// Runs `call`, then records a [`CallEntry`] with its duration and
    /// outcome. The call's own result is returned unchanged; an audit
    /// failure is escalated as fatal and logged, not mixed into it.
    pub async fn observe_call<T, E, Fut>(
        &self,
        ctx: &OperationContext,
        service: &str,
        method: &str,
        call: Fut,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = call.await;
        let entry = CallEntry {
            correlation: ctx.correlation(),
            service: service.to_owned(),
            method: method.to_owned(),
            elapsed_ms: millis(started.elapsed()),
            succeeded: result.is_ok(),
        };
        if let Err(err) = self.call(entry).await {
            tracing::warn!(service, method, error = %err, "outbound call left unaudited");
        }
        result
    }

    async fn record(&self, entry: LogEntry) -> Result<(), AuditError> {
        match self
            .ctx
            .audit_logger()
            .record(AuditPhase::Observed, &entry)
            .await
        {
            Ok(()) => Ok(()),
            Err(source) => {
                let err = AuditError {
                    kind: entry.kind(),
                    source,
                };
                self.ctx.escalator().fatal(&entry, &err);
                Err(err)
            }
        }
    }
}
