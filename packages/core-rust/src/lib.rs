//! Causeway Core: striped sequences, 128-bit correlation ids, and the
//! transaction/action/operation lifecycle engine.
//!
//! Every manager receives an explicitly constructed [`LifecycleContext`]
//! (session id, clock, sinks, escalator); the crate holds no process-wide
//! state.

pub mod action;
pub mod clock;
pub mod context;
pub mod entry;
pub mod error;
pub mod escalation;
pub mod gate;
pub mod ids;
mod lifecycle;
pub mod operation;
pub mod sequence;
pub mod sinks;
pub mod traits;
pub mod transaction;
pub mod types;

pub use action::{Action, ActionManager, ActionRecord, ActionSpec};
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use context::{LifecycleContext, LifecycleContextBuilder, DEFAULT_SEQUENCE_LANES};
pub use entry::{CallEntry, Correlation, LogEntry, RequestEntry, ResponseEntry};
pub use error::{ErrorClass, LifecycleError, Result, UnitKind, Violation};
pub use escalation::Escalator;
pub use ids::{
    ActionId, ActionIdGenerator, OperationId, OperationIdGenerator, SessionId, TransactionId,
    TransactionIdGenerator, MAX_OPERATIONS_PER_ACTION,
};
pub use operation::{Operation, OperationManager, OperationRecord, OperationSpec};
pub use sequence::{Sequence, StripedSequence};
pub use sinks::{FanoutAuditLogger, MemorySink, TracingSink};
pub use traits::{
    ActionLogger, AuditLogger, AuditPhase, OperationLogger, ShutdownHook, TransactionLogger,
};
pub use transaction::{Transaction, TransactionManager, TransactionRecord};
pub use types::{Descriptor, Param, Status};
