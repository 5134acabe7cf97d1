//! Operations and the per-action [`OperationManager`].
//!
//! An operation is the smallest tracked unit (one store call, one outbound
//! request). It belongs to exactly one action for its whole life, and only that
//! action's manager may complete it.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::action::Action;
use crate::context::LifecycleContext;
use crate::entry::LogEntry;
use crate::error::{LifecycleError, Result, UnitKind};
use crate::gate::{CreationGate, Tracked};
use crate::ids::{ActionId, OperationId, OperationIdGenerator, TransactionId};
use crate::lifecycle::Lifecycle;
use crate::traits::AuditPhase;
use crate::types::{Descriptor, Param, Status};

/// What to create: classification, optional parent, ordered params.
#[derive(Debug, Clone)]
pub struct OperationSpec {
    pub descriptor: Descriptor,
    pub parent_operation_id: Option<OperationId>,
    pub params: Vec<Param>,
}

impl OperationSpec {
    #[must_use]
    pub fn new(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            parent_operation_id: None,
            params: Vec::new(),
        }
    }

    /// Chains the operation to a parent, possibly from another process.
    #[must_use]
    pub fn parent_operation(mut self, parent: impl Into<Option<OperationId>>) -> Self {
        self.parent_operation_id = parent.into();
        self
    }

    /// Appends one param; insertion order is kept.
    #[must_use]
    pub fn param(mut self, name: &'static str, value: impl fmt::Display) -> Self {
        self.params.push(Param::new(name, value));
        self
    }
}

impl From<Descriptor> for OperationSpec {
    fn from(descriptor: Descriptor) -> Self {
        Self::new(descriptor)
    }
}

/// Smallest tracked unit of work, scoped to one action.
pub struct Operation {
    id: OperationId,
    action: Arc<Action>,
    descriptor: Descriptor,
    parent_operation_id: Option<OperationId>,
    params: Vec<Param>,
    lifecycle: Lifecycle,
}

/// Serializable snapshot of an [`Operation`].
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub action_id: ActionId,
    pub transaction_id: TransactionId,
    #[serde(flatten)]
    pub descriptor: Descriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_operation_id: Option<OperationId>,
    pub params: Vec<Param>,
    pub status: Status,
    pub created_at: u64,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub elapsed_ms: Option<u64>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("action_id", &self.action.id())
            .field("descriptor", &self.descriptor)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

pub(crate) fn elapsed_millis(elapsed: Option<Duration>) -> Option<u64> {
    elapsed.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl Operation {
    fn new(id: OperationId, action: Arc<Action>, spec: OperationSpec, created_at: u64) -> Self {
        Self {
            id,
            action,
            descriptor: spec.descriptor,
            parent_operation_id: spec.parent_operation_id,
            params: spec.params,
            lifecycle: Lifecycle::new(created_at),
        }
    }

    fn start(&self, now: u64) -> Result<()> {
        self.lifecycle
            .start(now)
            .map_err(|violation| LifecycleError::usage(UnitKind::Operation, self.id, violation))
    }

    fn mark_complete(&self, succeeded: bool, now: u64) -> Result<()> {
        self.lifecycle
            .begin_completion()
            .map_err(|violation| LifecycleError::usage(UnitKind::Operation, self.id, violation))?;
        self.lifecycle.finish(succeeded, now);
        Ok(())
    }

    /// Completes this operation through its owning action's manager.
    ///
    /// # Errors
    ///
    /// See [`OperationManager::complete`].
    pub async fn complete(self: &Arc<Self>, succeeded: bool) -> Result<()> {
        self.action.operations().complete(self, succeeded).await
    }

    #[must_use]
    pub fn id(&self) -> OperationId {
        self.id
    }

    #[must_use]
    pub fn action(&self) -> &Arc<Action> {
        &self.action
    }

    #[must_use]
    pub fn action_id(&self) -> ActionId {
        self.action.id()
    }

    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        self.action.transaction_id()
    }

    #[must_use]
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn parent_operation_id(&self) -> Option<OperationId> {
        self.parent_operation_id
    }

    #[must_use]
    pub fn params(&self) -> &[Param] {
        &self.params
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
    pub fn record(&self) -> OperationRecord {
        OperationRecord {
            id: self.id,
            action_id: self.action_id(),
            transaction_id: self.transaction_id(),
            descriptor: self.descriptor.clone(),
            parent_operation_id: self.parent_operation_id,
            params: self.params.clone(),
            status: self.status(),
            created_at: self.created_at(),
            start_time: self.start_time(),
            end_time: self.end_time(),
            elapsed_ms: elapsed_millis(self.elapsed()),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationManager
// ---------------------------------------------------------------------------

/// Factory and tracker for the operations of one action.
///
/// Owned 1:1 by its [`Action`]. Completing the action closes this manager's
/// gate and awaits [`wait`](Self::wait), which makes action completion a
/// barrier over every operation created here.
pub struct OperationManager {
    action: Weak<Action>,
    action_id: ActionId,
    ctx: Arc<LifecycleContext>,
    ids: OperationIdGenerator,
    gate: CreationGate,
    active: DashMap<OperationId, Tracked<Operation>>,
}

impl fmt::Debug for OperationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationManager")
            .field("action_id", &self.action_id)
            .field("gate", &self.gate)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl OperationManager {
    pub(crate) fn new(
        action: Weak<Action>,
        action_id: ActionId,
        ctx: Arc<LifecycleContext>,
        ids: OperationIdGenerator,
    ) -> Self {
        Self {
            action,
            action_id,
            ctx,
            ids,
            gate: CreationGate::new(UnitKind::Operation),
            active: DashMap::new(),
        }
    }

    /// Mints, starts and durably logs a new operation under the owning action.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::CreationDisabled`] once the action started
    /// completing or a previous failure closed the gate,
    /// [`LifecycleError::SequenceExhausted`] after 65,535 operations, and
    /// [`LifecycleError::Durability`] if a sink failed.
    pub async fn create_and_start(
        &self,
        spec: impl Into<OperationSpec>,
    ) -> Result<Arc<Operation>> {
        let _creating = self.gate.enter()?;
        let action = self.action.upgrade().ok_or_else(|| LifecycleError::ActionReleased {
            action: self.action_id.to_string(),
        })?;

        let id = self.ids.next_id().map_err(|err| self.gate.trip(err))?;
        let operation = Arc::new(Operation::new(id, action, spec.into(), self.ctx.now()));
        operation
            .start(self.ctx.now())
            .map_err(|err| self.gate.trip(err))?;

        self.log_event(&operation, AuditPhase::Created).await?;

        let live = self.gate.track_live();
        self.active
            .insert(id, Tracked::new(Arc::clone(&operation), live));
        tracing::debug!(
            operation_id = %id,
            action_id = %self.action_id,
            kind = %operation.descriptor.kind,
            "operation started"
        );
        Ok(operation)
    }

    /// Completes an operation created by this manager and logs it.
    ///
    /// The operation is released from the drain even if logging fails.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::ForeignOperation`] if `operation` belongs to another
    /// action, [`LifecycleError::Usage`] if it is not in progress, and
    /// [`LifecycleError::Durability`] if a sink failed.
    pub async fn complete(&self, operation: &Arc<Operation>, succeeded: bool) -> Result<()> {
        let owner = operation.action_id();
        if owner != self.action_id {
            return Err(LifecycleError::ForeignOperation {
                operation: operation.id().to_string(),
                owner: owner.to_string(),
                manager: self.action_id.to_string(),
            });
        }

        operation.mark_complete(succeeded, self.ctx.now())?;
        let logged = self.log_event(operation, AuditPhase::Completed).await;
        self.active.remove(&operation.id());
        tracing::debug!(
            operation_id = %operation.id(),
            status = %operation.status(),
            "operation completed"
        );
        logged
    }

    async fn log_event(&self, operation: &Arc<Operation>, phase: AuditPhase) -> Result<()> {
        let entry = LogEntry::Operation(Arc::clone(operation));
        let logged = match self.ctx.operation_logger().log_operation(operation).await {
            Ok(()) => self.ctx.audit_logger().record(phase, &entry).await,
            Err(err) => Err(err),
        };
        logged.map_err(|source| {
            self.ctx
                .durability_failure(&self.gate, UnitKind::Operation, &entry, source)
        })
    }

    /// Opens or closes the creation gate. Idempotent.
    pub fn allow_to_create(&self, allow: bool) {
        self.gate.allow_to_create(allow);
    }

    #[must_use]
    pub fn is_creation_allowed(&self) -> bool {
        self.gate.is_open()
    }

    /// Resolves once no creation is in flight and every created operation has
    /// been completed.
    pub async fn wait(&self) {
        self.gate.wait().await;
    }

    /// Operations created and not yet completed.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn get(&self, id: &OperationId) -> Option<Arc<Operation>> {
        self.active.get(id).map(|tracked| Arc::clone(&tracked.unit))
    }

    #[must_use]
    pub fn action_id(&self) -> ActionId {
        self.action_id
    }

    #[must_use]
    pub fn context(&self) -> &Arc<LifecycleContext> {
        &self.ctx
    }
}
