//! Built-in sink implementations.
//!
//! - [`TracingSink`]: emits every event as a structured `tracing` event. Never
//!   fails. The default for all four roles.
//! - [`MemorySink`]: ordered in-memory recorder with per-channel failure
//!   switches, used to test embedding services.
//! - [`FanoutAuditLogger`]: forwards audit records to several loggers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::action::Action;
use crate::entry::LogEntry;
use crate::ids::TransactionId;
use crate::operation::Operation;
use crate::traits::{ActionLogger, AuditLogger, AuditPhase, OperationLogger, TransactionLogger};
use crate::transaction::Transaction;
use crate::types::Status;

const AUDIT_TARGET: &str = "causeway::audit";

fn phase_of(completed: bool) -> AuditPhase {
    if completed {
        AuditPhase::Completed
    } else {
        AuditPhase::Created
    }
}

// ---------------------------------------------------------------------------
// TracingSink
// ---------------------------------------------------------------------------

/// Writes lifecycle events to the `causeway::audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl TransactionLogger for TracingSink {
    async fn log_transaction(&self, transaction: &Transaction) -> anyhow::Result<()> {
        tracing::info!(
            target: AUDIT_TARGET,
            transaction_id = %transaction.id(),
            session_id = %transaction.id().session_id(),
            start_time = transaction.start_time(),
            "transaction"
        );
        Ok(())
    }
}

#[async_trait]
impl ActionLogger for TracingSink {
    async fn log_action(&self, action: &Action) -> anyhow::Result<()> {
        let descriptor = action.descriptor();
        tracing::info!(
            target: AUDIT_TARGET,
            action_id = %action.id(),
            transaction_id = %action.transaction_id(),
            parent_action_id = ?action.parent_action_id(),
            kind = %descriptor.kind,
            category = %descriptor.category,
            group = %descriptor.group,
            background = action.is_background(),
            status = %action.status(),
            elapsed = ?action.elapsed(),
            "action"
        );
        Ok(())
    }
}

#[async_trait]
impl OperationLogger for TracingSink {
    async fn log_operation(&self, operation: &Operation) -> anyhow::Result<()> {
        let descriptor = operation.descriptor();
        tracing::info!(
            target: AUDIT_TARGET,
            operation_id = %operation.id(),
            action_id = %operation.action_id(),
            parent_operation_id = ?operation.parent_operation_id(),
            kind = %descriptor.kind,
            category = %descriptor.category,
            group = %descriptor.group,
            status = %operation.status(),
            elapsed = ?operation.elapsed(),
            "operation"
        );
        Ok(())
    }
}

#[async_trait]
impl AuditLogger for TracingSink {
    async fn record(&self, phase: AuditPhase, entry: &LogEntry) -> anyhow::Result<()> {
        tracing::info!(
            target: AUDIT_TARGET,
            phase = ?phase,
            entry_kind = entry.kind(),
            id = ?entry.id(),
            entry = %entry.to_json(),
            "{} {}",
            entry.kind(),
            match phase {
                AuditPhase::Created => "created",
                AuditPhase::Completed => "completed",
                AuditPhase::Observed => "observed",
            }
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Which logger role an event came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Transactions = 0,
    Actions = 1,
    Operations = 2,
    Audit = 3,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transactions => "transactions",
            Self::Actions => "actions",
            Self::Operations => "operations",
            Self::Audit => "audit",
        })
    }
}

/// One event captured by a [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub channel: Channel,
    /// For typed loggers: `Created` while the unit is in progress,
    /// `Completed` once it reached a terminal status.
    pub phase: AuditPhase,
    pub kind: &'static str,
    pub id: Option<String>,
    /// Unit status at the time of the call; `None` for transactions and
    /// request/response/call entries.
    pub status: Option<Status>,
}

/// Records every successful call in order. A failing channel returns an
/// error and records nothing.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<RecordedEvent>>,
    failing: [AtomicBool; 4],
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call on `channel` fail (or succeed again).
    pub fn set_failing(&self, channel: Channel, failing: bool) {
        self.failing[channel as usize].store(failing, Ordering::SeqCst);
    }

    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn events_on(&self, channel: Channel) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.channel == channel)
            .cloned()
            .collect()
    }

    /// Ids of the transactions logged so far, in order.
    #[must_use]
    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.events_on(Channel::Transactions)
            .into_iter()
            .filter_map(|event| event.id?.parse().ok())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: RecordedEvent) -> anyhow::Result<()> {
        if self.failing[event.channel as usize].load(Ordering::SeqCst) {
            anyhow::bail!("{} channel is failing", event.channel);
        }
        self.events.lock().push(event);
        Ok(())
    }
}

#[async_trait]
impl TransactionLogger for MemorySink {
    async fn log_transaction(&self, transaction: &Transaction) -> anyhow::Result<()> {
        self.push(RecordedEvent {
            channel: Channel::Transactions,
            phase: AuditPhase::Created,
            kind: "transaction",
            id: Some(transaction.id().to_string()),
            status: None,
        })
    }
}

#[async_trait]
impl ActionLogger for MemorySink {
    async fn log_action(&self, action: &Action) -> anyhow::Result<()> {
        self.push(RecordedEvent {
            channel: Channel::Actions,
            phase: phase_of(action.is_completed()),
            kind: "action",
            id: Some(action.id().to_string()),
            status: Some(action.status()),
        })
    }
}

#[async_trait]
impl OperationLogger for MemorySink {
    async fn log_operation(&self, operation: &Operation) -> anyhow::Result<()> {
        self.push(RecordedEvent {
            channel: Channel::Operations,
            phase: phase_of(operation.is_completed()),
            kind: "operation",
            id: Some(operation.id().to_string()),
            status: Some(operation.status()),
        })
    }
}

#[async_trait]
impl AuditLogger for MemorySink {
    async fn record(&self, phase: AuditPhase, entry: &LogEntry) -> anyhow::Result<()> {
        let status = match entry {
            LogEntry::Action(action) => Some(action.status()),
            LogEntry::Operation(operation) => Some(operation.status()),
            _ => None,
        };
        self.push(RecordedEvent {
            channel: Channel::Audit,
            phase,
            kind: entry.kind(),
            id: entry.id(),
            status,
        })
    }
}

// ---------------------------------------------------------------------------
// FanoutAuditLogger
// ---------------------------------------------------------------------------

/// Audit logger that forwards each record to every registered logger.
///
/// All loggers are attempted even after one fails; the first error is
/// returned.
#[derive(Default)]
pub struct FanoutAuditLogger {
    loggers: Vec<Arc<dyn AuditLogger>>,
}

impl fmt::Debug for FanoutAuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutAuditLogger")
            .field("loggers", &self.loggers.len())
            .finish()
    }
}

impl FanoutAuditLogger {
    #[must_use]
    pub fn new(loggers: Vec<Arc<dyn AuditLogger>>) -> Self {
        Self { loggers }
    }

    /// Adds a logger after construction.
    pub fn add(&mut self, logger: Arc<dyn AuditLogger>) {
        self.loggers.push(logger);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

#[async_trait]
impl AuditLogger for FanoutAuditLogger {
    async fn record(&self, phase: AuditPhase, entry: &LogEntry) -> anyhow::Result<()> {
        let mut first_error = None;
        for logger in &self.loggers {
            if let Err(err) = logger.record(phase, entry).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
