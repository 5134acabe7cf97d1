use async_trait::async_trait;
use serde::Serialize;

use crate::action::Action;
use crate::entry::LogEntry;
use crate::operation::Operation;
use crate::transaction::Transaction;

/// Durable sink for transaction lifecycle events.
/// Implementations: message-bus adapters (external), [`TracingSink`](crate::sinks::TracingSink),
/// [`MemorySink`](crate::sinks::MemorySink) (tests).
///
/// Any error is a durability failure: the calling manager closes its gate and
/// escalates.
#[async_trait]
pub trait TransactionLogger: Send + Sync {
    /// Persist a freshly started transaction.
    async fn log_transaction(&self, transaction: &Transaction) -> anyhow::Result<()>;
}

/// Durable sink for action lifecycle events, called once on start and once on
/// completion.
#[async_trait]
pub trait ActionLogger: Send + Sync {
    async fn log_action(&self, action: &Action) -> anyhow::Result<()>;
}

/// Durable sink for operation lifecycle events, called once on start and once
/// on completion.
#[async_trait]
pub trait OperationLogger: Send + Sync {
    async fn log_operation(&self, operation: &Operation) -> anyhow::Result<()>;
}

/// Which lifecycle moment an audit record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditPhase {
    Created,
    Completed,
    /// Requests, responses and outbound calls, which have no lifecycle.
    Observed,
}

/// Generic structured logger for human-readable audit events.
/// Same fail-fast contract as the typed loggers.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn record(&self, phase: AuditPhase, entry: &LogEntry) -> anyhow::Result<()>;
}

/// Process shutdown capability invoked by fatal escalation.
///
/// Called from a detached task; implementations must not assume they run on
/// the caller's thread and should tolerate repeated calls.
pub trait ShutdownHook: Send + Sync {
    fn stop(&self);
}
