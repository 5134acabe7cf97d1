//! Top-level causality unit and its process-wide factory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use serde::Serialize;

use crate::context::LifecycleContext;
use crate::entry::LogEntry;
use crate::error::{LifecycleError, Result, UnitKind, Violation};
use crate::gate::CreationGate;
use crate::ids::{SessionId, TransactionId, TransactionIdGenerator};

/// Correlates all work done for one inbound request.
///
/// Created and started in one step by [`TransactionManager::create_and_start`];
/// it is never completed explicitly, its lifetime ends with the last `Arc`.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    created_at: u64,
    start_time: OnceLock<u64>,
    started: AtomicBool,
}

/// Serializable snapshot of a [`Transaction`].
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub session_id: SessionId,
    pub created_at: u64,
    pub start_time: Option<u64>,
    pub started: bool,
}

impl Transaction {
    fn new(id: TransactionId, created_at: u64) -> Self {
        Self {
            id,
            created_at,
            start_time: OnceLock::new(),
            started: AtomicBool::new(false),
        }
    }

    fn start(&self, now: u64) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(LifecycleError::usage(
                UnitKind::Transaction,
                self.id,
                Violation::AlreadyStarted,
            ));
        }
        let _ = self.start_time.set(now);
        Ok(())
    }

    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    #[must_use]
    pub fn start_time(&self) -> Option<u64> {
        self.start_time.get().copied()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn record(&self) -> TransactionRecord {
        TransactionRecord {
            id: self.id,
            session_id: self.id.session_id(),
            created_at: self.created_at,
            start_time: self.start_time(),
            started: self.is_started(),
        }
    }
}

/// Factory for transactions, guarded by a creation gate.
#[derive(Debug)]
pub struct TransactionManager {
    ctx: Arc<LifecycleContext>,
    ids: TransactionIdGenerator,
    gate: CreationGate,
}

impl TransactionManager {
    /// Creates a manager minting ids for the context's session.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidSequence`] if the context's lane count
    /// is zero.
    pub fn new(ctx: Arc<LifecycleContext>) -> Result<Self> {
        let ids = TransactionIdGenerator::new("transactions", ctx.session_id(), ctx.sequence_lanes())?;
        Ok(Self {
            ctx,
            ids,
            gate: CreationGate::new(UnitKind::Transaction),
        })
    }

    /// Mints, starts and durably logs a new transaction.
    ///
    /// Any failure after the gate check closes the gate for good; a logging
    /// failure is additionally escalated as fatal. The transaction is only
    /// returned once it has been logged.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::CreationDisabled`] if the gate is closed,
    /// [`LifecycleError::SequenceExhausted`] if the id space ran out, and
    /// [`LifecycleError::Durability`] if the transaction logger failed.
    pub async fn create_and_start(&self) -> Result<Arc<Transaction>> {
        let _creating = self.gate.enter()?;

        let id = self.ids.next_id().map_err(|err| self.gate.trip(err))?;
        let transaction = Arc::new(Transaction::new(id, self.ctx.now()));
        transaction
            .start(self.ctx.now())
            .map_err(|err| self.gate.trip(err))?;

        if let Err(source) = self.ctx.transaction_logger().log_transaction(&transaction).await {
            let entry = LogEntry::Transaction(Arc::clone(&transaction));
            return Err(self.ctx.durability_failure(
                &self.gate,
                UnitKind::Transaction,
                &entry,
                source,
            ));
        }

        tracing::debug!(transaction_id = %id, "transaction started");
        Ok(transaction)
    }

    /// Opens or closes the creation gate. Idempotent.
    pub fn allow_to_create(&self, allow: bool) {
        self.gate.allow_to_create(allow);
    }

    #[must_use]
    pub fn is_creation_allowed(&self) -> bool {
        self.gate.is_open()
    }

    /// Resolves once every in-flight `create_and_start` call has returned.
    pub async fn wait(&self) {
        self.gate.wait_creating().await;
    }

    #[must_use]
    pub fn context(&self) -> &Arc<LifecycleContext> {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::clock::ManualClock;
    use crate::sinks::{Channel, MemorySink};
    use crate::traits::TransactionLogger;

    fn manager_with(sink: &Arc<MemorySink>) -> TransactionManager {
        let ctx = LifecycleContext::builder(SessionId::new(0xABCD))
            .clock(Arc::new(ManualClock::new(1_000)))
            .sink(Arc::clone(sink))
            .build();
        TransactionManager::new(ctx).unwrap()
    }

    #[tokio::test]
    async fn create_and_start_logs_started_transaction() {
        let sink = Arc::new(MemorySink::new());
        let manager = manager_with(&sink);

        let transaction = manager.create_and_start().await.unwrap();
        assert!(transaction.is_started());
        assert_eq!(transaction.created_at(), 1_000);
        assert_eq!(transaction.start_time(), Some(1_000));
        assert_eq!(transaction.id().session_id(), SessionId::new(0xABCD));
        assert_eq!(sink.transaction_ids(), vec![transaction.id()]);
    }

    #[test]
    fn start_twice_is_a_usage_error() {
        let transaction = Transaction::new(TransactionId::from_bytes([1; 16]), 0);
        transaction.start(1).unwrap();
        let err = transaction.start(2).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Usage { violation: Violation::AlreadyStarted, .. }
        ));
        assert_eq!(transaction.start_time(), Some(1));
    }

    #[tokio::test]
    async fn closed_gate_fails_deterministically() {
        let sink = Arc::new(MemorySink::new());
        let manager = manager_with(&sink);
        manager.allow_to_create(false);

        for _ in 0..3 {
            assert!(matches!(
                manager.create_and_start().await,
                Err(LifecycleError::CreationDisabled { unit: UnitKind::Transaction })
            ));
        }
        assert!(sink.transaction_ids().is_empty());

        manager.allow_to_create(true);
        assert!(manager.create_and_start().await.is_ok());
    }

    #[tokio::test]
    async fn logging_failure_closes_gate_permanently() {
        let sink = Arc::new(MemorySink::new());
        let manager = manager_with(&sink);
        sink.set_failing(Channel::Transactions, true);

        let err = manager.create_and_start().await.unwrap_err();
        assert!(err.is_durability());
        assert!(!manager.is_creation_allowed());

        sink.set_failing(Channel::Transactions, false);
        assert!(matches!(
            manager.create_and_start().await,
            Err(LifecycleError::CreationDisabled { .. })
        ));
    }

    #[derive(Default)]
    struct SlowLogger {
        logged: AtomicUsize,
    }

    #[async_trait]
    impl TransactionLogger for SlowLogger {
        async fn log_transaction(&self, _transaction: &Transaction) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(80)).await;
            self.logged.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wait_returns_after_in_flight_creations() {
        let logger = Arc::new(SlowLogger::default());
        let ctx = LifecycleContext::builder(SessionId::new(1))
            .transaction_logger(logger.clone())
            .build();
        let manager = Arc::new(TransactionManager::new(ctx).unwrap());

        let in_flight: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.create_and_start().await })
            })
            .collect();

        // Let every call pass the gate before closing it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.allow_to_create(false);
        manager.wait().await;

        // Logging runs inside the creation slot, so all four have finished.
        assert_eq!(logger.logged.load(Ordering::SeqCst), 4);
        for handle in in_flight {
            assert!(handle.await.unwrap().is_ok());
        }
        assert!(manager.create_and_start().await.is_err());
    }
}
