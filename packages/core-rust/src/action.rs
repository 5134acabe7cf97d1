//! Actions and the process-wide [`ActionManager`].
//!
//! An action is a logical unit of work inside a transaction. It may continue
//! an action started in another process (`parent_action_id`) and owns the
//! [`OperationManager`] for its operations. Completing an action drains that
//! manager first, so an action never reaches a terminal status while one of
//! its operations is still running.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::context::LifecycleContext;
use crate::entry::LogEntry;
use crate::error::{LifecycleError, Result, UnitKind, Violation};
use crate::gate::{CreationGate, Tracked};
use crate::ids::{ActionId, ActionIdGenerator, OperationIdGenerator, TransactionId};
use crate::lifecycle::Lifecycle;
use crate::operation::{elapsed_millis, OperationManager};
use crate::traits::AuditPhase;
use crate::transaction::Transaction;
use crate::types::{Descriptor, Status};

/// What to create: classification, cross-process parent, background flag.
#[derive(Debug, Clone)]
pub struct ActionSpec {
    pub descriptor: Descriptor,
    pub parent_action_id: Option<ActionId>,
    pub background: bool,
}

impl ActionSpec {
    #[must_use]
    pub fn new(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            parent_action_id: None,
            background: false,
        }
    }

    #[must_use]
    pub fn parent_action(mut self, parent: impl Into<Option<ActionId>>) -> Self {
        self.parent_action_id = parent.into();
        self
    }

    /// Marks the action as background work not tied to an inbound request.
    #[must_use]
    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }
}

impl From<Descriptor> for ActionSpec {
    fn from(descriptor: Descriptor) -> Self {
        Self::new(descriptor)
    }
}

/// A logical unit of work inside a transaction.
#[derive(Debug)]
pub struct Action {
    id: ActionId,
    transaction: Arc<Transaction>,
    descriptor: Descriptor,
    parent_action_id: Option<ActionId>,
    background: bool,
    lifecycle: Lifecycle,
    operations: OperationManager,
}

/// Serializable snapshot of an [`Action`].
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub id: ActionId,
    pub transaction_id: TransactionId,
    #[serde(flatten)]
    pub descriptor: Descriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_action_id: Option<ActionId>,
    pub background: bool,
    pub status: Status,
    pub created_at: u64,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub elapsed_ms: Option<u64>,
}

impl Action {
    fn create(
        id: ActionId,
        transaction: Arc<Transaction>,
        spec: ActionSpec,
        ctx: &Arc<LifecycleContext>,
    ) -> Result<Arc<Self>> {
        let operation_ids = OperationIdGenerator::new(id)?;
        let created_at = ctx.now();
        Ok(Arc::new_cyclic(|this| Self {
            id,
            transaction,
            descriptor: spec.descriptor,
            parent_action_id: spec.parent_action_id,
            background: spec.background,
            lifecycle: Lifecycle::new(created_at),
            operations: OperationManager::new(this.clone(), id, Arc::clone(ctx), operation_ids),
        }))
    }

    fn start(&self, now: u64) -> Result<()> {
        self.lifecycle
            .start(now)
            .map_err(|violation| LifecycleError::usage(UnitKind::Action, self.id, violation))
    }

    /// Closes operation creation, drains every operation, then stamps timing
    /// and the terminal status.
    async fn complete(&self, succeeded: bool) -> Result<()> {
        self.lifecycle
            .begin_completion()
            .map_err(|violation| LifecycleError::usage(UnitKind::Action, self.id, violation))?;
        self.operations.allow_to_create(false);
        self.operations.wait().await;
        self.lifecycle
            .finish(succeeded, self.operations.context().now());
        Ok(())
    }

    #[must_use]
    pub fn id(&self) -> ActionId {
        self.id
    }

    #[must_use]
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction.id()
    }

    #[must_use]
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn parent_action_id(&self) -> Option<ActionId> {
        self.parent_action_id
    }

    #[must_use]
    pub fn is_background(&self) -> bool {
        self.background
    }

    /// Factory for this action's operations.
    #[must_use]
    pub fn operations(&self) -> &OperationManager {
        &self.operations
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.lifecycle.status()
    }

    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.lifecycle.created_at()
    }

    #[must_use]
    pub fn start_time(&self) -> Option<u64> {
        self.lifecycle.start_time()
    }

    #[must_use]
    pub fn end_time(&self) -> Option<u64> {
        self.lifecycle.end_time()
    }

    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.lifecycle.elapsed()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.lifecycle.is_started()
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.lifecycle.is_completed()
    }

    #[must_use]
    pub fn record(&self) -> ActionRecord {
        ActionRecord {
            id: self.id,
            transaction_id: self.transaction_id(),
            descriptor: self.descriptor.clone(),
            parent_action_id: self.parent_action_id,
            background: self.background,
            status: self.status(),
            created_at: self.created_at(),
            start_time: self.start_time(),
            end_time: self.end_time(),
            elapsed_ms: elapsed_millis(self.elapsed()),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionManager
// ---------------------------------------------------------------------------

/// Process-wide factory and tracker for actions.
///
/// A failure to mint, start or durably record an action closes the creation
/// gate for good: once one action is missing from the audit trail, no further
/// action is created through this manager.
#[derive(Debug)]
pub struct ActionManager {
    ctx: Arc<LifecycleContext>,
    ids: ActionIdGenerator,
    gate: CreationGate,
    active: DashMap<ActionId, Tracked<Action>>,
}

impl ActionManager {
    /// Creates a manager minting ids for the context's session.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidSequence`] if the context's lane count
    /// is zero.
    pub fn new(ctx: Arc<LifecycleContext>) -> Result<Self> {
        let ids = ActionIdGenerator::new("actions", ctx.session_id(), ctx.sequence_lanes())?;
        Ok(Self {
            ctx,
            ids,
            gate: CreationGate::new(UnitKind::Action),
            active: DashMap::new(),
        })
    }

    /// Mints, starts and durably logs a new action under `transaction`.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::CreationDisabled`] if the gate is closed,
    /// [`LifecycleError::SequenceExhausted`] if the id space ran out, and
    /// [`LifecycleError::Durability`] if the action or audit logger failed.
    pub async fn create_and_start(
        &self,
        transaction: &Arc<Transaction>,
        spec: impl Into<ActionSpec>,
    ) -> Result<Arc<Action>> {
        let _creating = self.gate.enter()?;

        let id = self.ids.next_id().map_err(|err| self.gate.trip(err))?;
        let action = Action::create(id, Arc::clone(transaction), spec.into(), &self.ctx)
            .map_err(|err| self.gate.trip(err))?;
        action
            .start(self.ctx.now())
            .map_err(|err| self.gate.trip(err))?;

        self.log_event(&action, AuditPhase::Created).await?;

        let live = self.gate.track_live();
        self.active.insert(id, Tracked::new(Arc::clone(&action), live));
        tracing::debug!(
            action_id = %id,
            transaction_id = %action.transaction_id(),
            kind = %action.descriptor.kind,
            background = action.background,
            "action started"
        );
        Ok(action)
    }

    /// Completes `action` once all of its operations have completed, then
    /// logs it.
    ///
    /// The action keeps its terminal status and is released from the drain
    /// even when logging fails.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Usage`] if the action is not in progress,
    /// [`LifecycleError::ForeignAction`] if another manager created it, and
    /// [`LifecycleError::Durability`] if a sink failed.
    pub async fn complete(&self, action: &Arc<Action>, succeeded: bool) -> Result<()> {
        let owned = self
            .active
            .get(&action.id())
            .is_some_and(|tracked| Arc::ptr_eq(&tracked.unit, action));
        if !owned {
            // Entries leave the map only after the terminal status is set.
            if action.is_completed() {
                return Err(LifecycleError::usage(
                    UnitKind::Action,
                    action.id(),
                    Violation::AlreadyCompleted,
                ));
            }
            return Err(LifecycleError::ForeignAction {
                action: action.id().to_string(),
            });
        }
        action.complete(succeeded).await?;
        let logged = self.log_event(action, AuditPhase::Completed).await;
        self.active.remove(&action.id());
        tracing::debug!(
            action_id = %action.id(),
            status = %action.status(),
            "action completed"
        );
        logged
    }

    async fn log_event(&self, action: &Arc<Action>, phase: AuditPhase) -> Result<()> {
        let entry = LogEntry::Action(Arc::clone(action));
        let logged = match self.ctx.action_logger().log_action(action).await {
            Ok(()) => self.ctx.audit_logger().record(phase, &entry).await,
            Err(err) => Err(err),
        };
        logged.map_err(|source| {
            self.ctx
                .durability_failure(&self.gate, UnitKind::Action, &entry, source)
        })
    }

    /// Live action by id.
    #[must_use]
    pub fn get(&self, id: &ActionId) -> Option<Arc<Action>> {
        self.active.get(id).map(|tracked| Arc::clone(&tracked.unit))
    }

    /// Actions created and not yet completed.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Opens or closes the creation gate. Idempotent.
    pub fn allow_to_create(&self, allow: bool) {
        self.gate.allow_to_create(allow);
    }

    #[must_use]
    pub fn is_creation_allowed(&self) -> bool {
        self.gate.is_open()
    }

    /// Resolves once no creation is in flight and every created action has
    /// been completed.
    pub async fn wait(&self) {
        self.gate.wait().await;
    }

    #[must_use]
    pub fn context(&self) -> &Arc<LifecycleContext> {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use super::*;
    use crate::error::ErrorClass;
    use crate::ids::SessionId;
    use crate::operation::OperationSpec;
    use crate::sinks::{Channel, MemorySink};
    use crate::traits::ShutdownHook;
    use crate::transaction::TransactionManager;

    #[derive(Default)]
    struct CountingHook {
        stops: AtomicUsize,
        stopped: Notify,
    }

    impl ShutdownHook for CountingHook {
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.stopped.notify_one();
        }
    }

    struct Fixture {
        sink: Arc<MemorySink>,
        hook: Arc<CountingHook>,
        actions: Arc<ActionManager>,
        transaction: Arc<Transaction>,
    }

    async fn fixture() -> Fixture {
        let sink = Arc::new(MemorySink::new());
        let hook = Arc::new(CountingHook::default());
        let ctx = LifecycleContext::builder(SessionId::new(0xFEED))
            .sink(Arc::clone(&sink))
            .shutdown_hook(hook.clone())
            .build();
        let transactions = TransactionManager::new(Arc::clone(&ctx)).unwrap();
        let transaction = transactions.create_and_start().await.unwrap();
        Fixture {
            sink,
            hook,
            actions: Arc::new(ActionManager::new(ctx).unwrap()),
            transaction,
        }
    }

    fn create_user() -> Descriptor {
        Descriptor::new("create_user", "identity", "users")
    }

    #[tokio::test]
    async fn create_and_start_tracks_action() {
        let f = fixture().await;
        let parent = ActionId::from_bytes([7; 16]);
        let action = f
            .actions
            .create_and_start(
                &f.transaction,
                ActionSpec::new(create_user()).parent_action(parent).background(true),
            )
            .await
            .unwrap();

        assert_eq!(action.status(), Status::InProgress);
        assert_eq!(action.id().session_id(), SessionId::new(0xFEED));
        assert_eq!(action.transaction_id(), f.transaction.id());
        assert_eq!(action.parent_action_id(), Some(parent));
        assert!(action.is_background());
        assert_eq!(f.actions.active_count(), 1);
        assert!(Arc::ptr_eq(&f.actions.get(&action.id()).unwrap(), &action));

        let record = serde_json::to_value(action.record()).unwrap();
        assert_eq!(record["type"], "create_user");
        assert_eq!(record["status"], "in_progress");
        assert_eq!(record["parent_action_id"], parent.to_string());
    }

    #[tokio::test]
    async fn complete_twice_is_usage_error_and_keeps_gate_open() {
        let f = fixture().await;
        let action = f.actions.create_and_start(&f.transaction, create_user()).await.unwrap();
        f.actions.complete(&action, true).await.unwrap();

        let err = f.actions.complete(&action, false).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Usage { violation: Violation::AlreadyCompleted, .. }
        ));
        assert_eq!(action.status(), Status::Success);
        assert!(f.actions.is_creation_allowed());
        assert_eq!(f.actions.active_count(), 0);
    }

    #[tokio::test]
    async fn other_manager_cannot_complete_action() {
        let f = fixture().await;
        let other = ActionManager::new(Arc::clone(f.actions.context())).unwrap();
        let action = f.actions.create_and_start(&f.transaction, create_user()).await.unwrap();

        let err = other.complete(&action, true).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ForeignAction { .. }));
        assert_eq!(err.class(), ErrorClass::Usage);
        assert_eq!(action.status(), Status::InProgress);
        assert!(other.is_creation_allowed());
        assert_eq!(f.actions.active_count(), 1);

        f.actions.complete(&action, true).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), f.actions.wait())
            .await
            .unwrap();
        assert_eq!(action.status(), Status::Success);
    }

    #[tokio::test]
    async fn completing_action_closes_operation_creation() {
        let f = fixture().await;
        let action = f.actions.create_and_start(&f.transaction, create_user()).await.unwrap();
        f.actions.complete(&action, true).await.unwrap();

        assert!(matches!(
            action
                .operations()
                .create_and_start(OperationSpec::new(create_user()))
                .await,
            Err(LifecycleError::CreationDisabled { unit: UnitKind::Operation })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn completion_is_a_barrier_over_operations() {
        const N: usize = 8;
        let f = fixture().await;
        let action = f.actions.create_and_start(&f.transaction, create_user()).await.unwrap();

        let mut operations = Vec::with_capacity(N);
        for i in 0..N {
            let spec = OperationSpec::new(Descriptor::new("write", "postgres", "users")).param("shard", i);
            operations.push(action.operations().create_and_start(spec).await.unwrap());
        }

        let completed = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = operations
            .into_iter()
            .enumerate()
            .map(|(i, operation)| {
                let completed = Arc::clone(&completed);
                tokio::spawn(async move {
                    let delay = u64::try_from(20 + i * 10).unwrap();
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    completed.fetch_add(1, Ordering::SeqCst);
                    operation.complete(true).await.unwrap();
                })
            })
            .collect();

        f.actions.complete(&action, true).await.unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), N);
        assert_eq!(action.operations().active_count(), 0);
        assert_eq!(action.status(), Status::Success);

        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn durability_failure_trips_gate_and_stops_process() {
        let f = fixture().await;
        f.sink.set_failing(Channel::Actions, true);

        let err = f
            .actions
            .create_and_start(&f.transaction, create_user())
            .await
            .unwrap_err();
        assert!(err.is_durability());
        assert!(!f.actions.is_creation_allowed());
        assert_eq!(f.actions.active_count(), 0);

        tokio::time::timeout(Duration::from_secs(1), f.hook.stopped.notified())
            .await
            .unwrap();
        assert_eq!(f.hook.stops.load(Ordering::SeqCst), 1);

        f.sink.set_failing(Channel::Actions, false);
        assert!(matches!(
            f.actions.create_and_start(&f.transaction, create_user()).await,
            Err(LifecycleError::CreationDisabled { unit: UnitKind::Action })
        ));
    }

    #[tokio::test]
    async fn completion_logging_failure_leaves_action_completed() {
        let f = fixture().await;
        let action = f.actions.create_and_start(&f.transaction, create_user()).await.unwrap();
        f.sink.set_failing(Channel::Audit, true);

        let err = f.actions.complete(&action, true).await.unwrap_err();
        assert!(err.is_durability());
        assert_eq!(action.status(), Status::Success);
        assert!(action.end_time().is_some());
        assert!(!f.actions.is_creation_allowed());

        tokio::time::timeout(Duration::from_secs(1), f.actions.wait())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_blocks_until_live_actions_complete() {
        let f = fixture().await;
        let action = f.actions.create_and_start(&f.transaction, create_user()).await.unwrap();
        f.actions.allow_to_create(false);

        let waiter = {
            let actions = Arc::clone(&f.actions);
            tokio::spawn(async move { actions.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        f.actions.complete(&action, false).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn end_to_end_event_order() {
        let f = fixture().await;
        let action = f
            .actions
            .create_and_start(&f.transaction, ActionSpec::new(create_user()).background(false))
            .await
            .unwrap();

        let read = action
            .operations()
            .create_and_start(OperationSpec::new(Descriptor::new("read", "postgres", "users")))
            .await
            .unwrap();
        let write = action
            .operations()
            .create_and_start(OperationSpec::new(Descriptor::new("write", "postgres", "users")))
            .await
            .unwrap();
        read.complete(true).await.unwrap();
        write.complete(false).await.unwrap();
        f.actions.complete(&action, false).await.unwrap();

        assert_eq!(action.status(), Status::Failure);
        assert!(action.end_time().is_some());
        assert!(action.elapsed().is_some());
        assert_eq!(read.status(), Status::Success);
        assert_eq!(write.status(), Status::Failure);

        let operation_events = f.sink.events_on(Channel::Operations);
        let phases: Vec<AuditPhase> = operation_events.iter().map(|e| e.phase).collect();
        assert_eq!(
            phases,
            [
                AuditPhase::Created,
                AuditPhase::Created,
                AuditPhase::Completed,
                AuditPhase::Completed
            ]
        );

        let action_events = f.sink.events_on(Channel::Actions);
        assert_eq!(action_events.len(), 2);
        assert_eq!(action_events[0].phase, AuditPhase::Created);
        assert_eq!(action_events[1].phase, AuditPhase::Completed);
        assert_eq!(action_events[1].status, Some(Status::Failure));

        // Operation completions land before the action completion.
        let events = f.sink.events();
        let action_created = events
            .iter()
            .position(|e| e.channel == Channel::Actions && e.phase == AuditPhase::Created)
            .unwrap();
        let last_op_completed = events
            .iter()
            .rposition(|e| e.channel == Channel::Operations && e.phase == AuditPhase::Completed)
            .unwrap();
        let action_completed = events
            .iter()
            .position(|e| e.channel == Channel::Actions && e.phase == AuditPhase::Completed)
            .unwrap();
        assert!(action_created < last_op_completed);
        assert!(last_op_completed < action_completed);
    }
}
