use std::fmt;
use std::sync::Arc;

use crate::clock::{ClockSource, SystemClock};
use crate::entry::LogEntry;
use crate::error::{LifecycleError, UnitKind};
use crate::escalation::Escalator;
use crate::gate::CreationGate;
use crate::ids::SessionId;
use crate::sinks::TracingSink;
use crate::traits::{ActionLogger, AuditLogger, OperationLogger, ShutdownHook, TransactionLogger};

/// Default number of striped sequence lanes per id generator.
pub const DEFAULT_SEQUENCE_LANES: usize = 8;

/// Process-wide dependencies of the lifecycle engine.
///
/// Built once at bootstrap and shared by every manager through `Arc`; there
/// are no package-level singletons.
pub struct LifecycleContext {
    session_id: SessionId,
    sequence_lanes: usize,
    clock: Arc<dyn ClockSource>,
    transaction_logger: Arc<dyn TransactionLogger>,
    action_logger: Arc<dyn ActionLogger>,
    operation_logger: Arc<dyn OperationLogger>,
    audit_logger: Arc<dyn AuditLogger>,
    escalator: Escalator,
}

impl fmt::Debug for LifecycleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleContext")
            .field("session_id", &self.session_id)
            .field("sequence_lanes", &self.sequence_lanes)
            .finish_non_exhaustive()
    }
}

impl LifecycleContext {
    /// Starts a builder with tracing sinks, the system clock and no shutdown
    /// hook.
    #[must_use]
    pub fn builder(session_id: SessionId) -> LifecycleContextBuilder {
        LifecycleContextBuilder::new(session_id)
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn sequence_lanes(&self) -> usize {
        self.sequence_lanes
    }

    /// Current wall-clock time in milliseconds.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    #[must_use]
    pub fn transaction_logger(&self) -> &dyn TransactionLogger {
        self.transaction_logger.as_ref()
    }

    #[must_use]
    pub fn action_logger(&self) -> &dyn ActionLogger {
        self.action_logger.as_ref()
    }

    #[must_use]
    pub fn operation_logger(&self) -> &dyn OperationLogger {
        self.operation_logger.as_ref()
    }

    #[must_use]
    pub fn audit_logger(&self) -> &dyn AuditLogger {
        self.audit_logger.as_ref()
    }

    #[must_use]
    pub fn escalator(&self) -> &Escalator {
        &self.escalator
    }

    /// Closes `gate`, wraps `source` as a durability error and escalates it as
    /// fatal. Returns the error for the caller to propagate.
    pub(crate) fn durability_failure(
        &self,
        gate: &CreationGate,
        unit: UnitKind,
        entry: &LogEntry,
        source: anyhow::Error,
    ) -> LifecycleError {
        let err = gate.trip(LifecycleError::Durability {
            unit,
            id: entry.id().unwrap_or_default(),
            source,
        });
        self.escalator.fatal(entry, &err);
        err
    }
}

/// Builder for [`LifecycleContext`].
pub struct LifecycleContextBuilder {
    session_id: SessionId,
    sequence_lanes: usize,
    clock: Arc<dyn ClockSource>,
    transaction_logger: Arc<dyn TransactionLogger>,
    action_logger: Arc<dyn ActionLogger>,
    operation_logger: Arc<dyn OperationLogger>,
    audit_logger: Arc<dyn AuditLogger>,
    escalator: Escalator,
}

impl LifecycleContextBuilder {
    fn new(session_id: SessionId) -> Self {
        let tracing_sink = Arc::new(TracingSink);
        Self {
            session_id,
            sequence_lanes: DEFAULT_SEQUENCE_LANES,
            clock: Arc::new(SystemClock),
            transaction_logger: tracing_sink.clone(),
            action_logger: tracing_sink.clone(),
            operation_logger: tracing_sink.clone(),
            audit_logger: tracing_sink,
            escalator: Escalator::default(),
        }
    }

    /// Number of striped lanes for transaction and action id generators.
    #[must_use]
    pub fn sequence_lanes(mut self, lanes: usize) -> Self {
        self.sequence_lanes = lanes;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn transaction_logger(mut self, logger: Arc<dyn TransactionLogger>) -> Self {
        self.transaction_logger = logger;
        self
    }

    #[must_use]
    pub fn action_logger(mut self, logger: Arc<dyn ActionLogger>) -> Self {
        self.action_logger = logger;
        self
    }

    #[must_use]
    pub fn operation_logger(mut self, logger: Arc<dyn OperationLogger>) -> Self {
        self.operation_logger = logger;
        self
    }

    #[must_use]
    pub fn audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    /// Uses one sink for all four logger roles.
    #[must_use]
    pub fn sink<S>(self, sink: Arc<S>) -> Self
    where
        S: TransactionLogger + ActionLogger + OperationLogger + AuditLogger + 'static,
    {
        self.transaction_logger(sink.clone())
            .action_logger(sink.clone())
            .operation_logger(sink.clone())
            .audit_logger(sink)
    }

    #[must_use]
    pub fn shutdown_hook(mut self, hook: Arc<dyn ShutdownHook>) -> Self {
        self.escalator = Escalator::new(hook);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<LifecycleContext> {
        Arc::new(LifecycleContext {
            session_id: self.session_id,
            sequence_lanes: self.sequence_lanes,
            clock: self.clock,
            transaction_logger: self.transaction_logger,
            action_logger: self.action_logger,
            operation_logger: self.operation_logger,
            audit_logger: self.audit_logger,
            escalator: self.escalator,
        })
    }
}
