//! Create, run, complete.
//!
//! Executors wrap business logic in a freshly created action and/or
//! operation and complete the unit with the logic's outcome. A panicking
//! logic future completes its unit with failure before the panic resumes.

use std::any::Any;
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use causeway_core::{
    Action, ActionManager, ActionSpec, Escalator, LifecycleError, LogEntry, Operation,
    OperationSpec, Transaction,
};
use futures_util::FutureExt;
use tracing::{field, info_span, Instrument, Span};

use crate::context::OperationContext;
use crate::metrics::{record_action, record_escalation, record_operation, Outcome};

/// Errors returned by executors.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The unit could not be created; the logic did not run.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// The logic failed. Its unit was completed with failure.
    #[error(transparent)]
    Logic(anyhow::Error),
    /// The logic succeeded but its unit could not be completed.
    #[error("work succeeded but completion failed: {0}")]
    Completion(#[source] LifecycleError),
}

impl ExecError {
    /// The lifecycle error behind a creation or completion failure.
    #[must_use]
    pub fn lifecycle(&self) -> Option<&LifecycleError> {
        match self {
            Self::Lifecycle(err) | Self::Completion(err) => Some(err),
            Self::Logic(_) => None,
        }
    }
}

type Caught<T> = Result<anyhow::Result<T>, Box<dyn Any + Send>>;

fn outcome_of<T>(caught: &Caught<T>) -> Outcome {
    match caught {
        Ok(Ok(_)) => Outcome::Success,
        Ok(Err(_)) => Outcome::Failure,
        Err(_) => Outcome::Panic,
    }
}

/// Resumes a caught panic, or turns the logic's result into the executor's.
fn settle<T>(caught: Caught<T>, completion: Result<(), LifecycleError>) -> Result<T, ExecError> {
    match caught {
        Err(panic) => resume_unwind(panic),
        Ok(Err(err)) => Err(ExecError::Logic(err)),
        Ok(Ok(value)) => completion.map(|()| value).map_err(ExecError::Completion),
    }
}

/// Escalates a failed completion per `stop_app`.
///
/// Durability failures were already escalated as fatal by the manager that
/// hit them.
fn escalate(escalator: &Escalator, entry: &LogEntry, err: &LifecycleError, stop_app: bool) {
    record_escalation(err.is_durability() || stop_app);
    if !err.is_durability() {
        escalator.escalate(entry, err, stop_app);
    }
}

async fn complete_operation(
    operation: &Arc<Operation>,
    outcome: Outcome,
    stop_app: bool,
) -> Result<(), LifecycleError> {
    let completion = operation.complete(outcome == Outcome::Success).await;
    if let Err(err) = &completion {
        let entry = LogEntry::Operation(Arc::clone(operation));
        escalate(
            operation.action().operations().context().escalator(),
            &entry,
            err,
            stop_app,
        );
    }
    record_operation(outcome);
    completion
}

async fn complete_action(
    actions: &ActionManager,
    action: &Arc<Action>,
    outcome: Outcome,
    stop_app: bool,
) -> Result<(), LifecycleError> {
    let completion = actions.complete(action, outcome == Outcome::Success).await;
    if let Err(err) = &completion {
        let entry = LogEntry::Action(Arc::clone(action));
        escalate(actions.context().escalator(), &entry, err, stop_app);
    }
    completion
}

/// Units an executor still owes a completion.
///
/// If the executor future is dropped before the logic returns, the armed
/// units are completed with failure from a detached task: the operation
/// first, then the action.
struct Pending {
    action: Option<(Arc<ActionManager>, Arc<Action>)>,
    operation: Option<Arc<Operation>>,
    stop_app: bool,
}

impl Pending {
    fn action(actions: &Arc<ActionManager>, action: &Arc<Action>, stop_app: bool) -> Self {
        Self {
            action: Some((Arc::clone(actions), Arc::clone(action))),
            operation: None,
            stop_app,
        }
    }

    fn operation(operation: &Arc<Operation>, stop_app: bool) -> Self {
        Self {
            action: None,
            operation: Some(Arc::clone(operation)),
            stop_app,
        }
    }

    fn with_operation(mut self, operation: &Arc<Operation>) -> Self {
        self.operation = Some(Arc::clone(operation));
        self
    }

    /// The logic returned; the caller completes the units itself.
    fn disarm(&mut self) {
        self.action = None;
        self.operation = None;
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        let action = self.action.take();
        let operation = self.operation.take();
        if action.is_none() && operation.is_none() {
            return;
        }
        let stop_app = self.stop_app;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(
                action_id = ?action.as_ref().map(|(_, action)| action.id()),
                operation_id = ?operation.as_ref().map(|operation| operation.id()),
                "executor dropped outside a runtime, unit left open"
            );
            return;
        };
        handle.spawn(async move {
            if let Some(operation) = operation {
                tracing::warn!(operation_id = %operation.id(), "operation cancelled");
                if let Err(err) =
                    complete_operation(&operation, Outcome::Cancelled, stop_app).await
                {
                    tracing::debug!(
                        operation_id = %operation.id(),
                        error = %err,
                        "cancelled operation could not be completed"
                    );
                }
            }
            if let Some((actions, action)) = action {
                tracing::warn!(action_id = %action.id(), "action cancelled");
                if let Err(err) =
                    complete_action(&actions, &action, Outcome::Cancelled, stop_app).await
                {
                    tracing::debug!(
                        action_id = %action.id(),
                        error = %err,
                        "cancelled action could not be completed"
                    );
                }
                record_action(Outcome::Cancelled, action.elapsed().unwrap_or_default());
            }
        });
    }
}

fn action_span(action: &Action) -> Span {
    info_span!(
        "action",
        action_id = %action.id(),
        transaction_id = %action.transaction_id(),
        kind = %action.descriptor().kind,
        outcome = field::Empty,
    )
}

fn operation_span(operation: &Operation) -> Span {
    info_span!(
        "operation",
        operation_id = %operation.id(),
        kind = %operation.descriptor().kind,
        outcome = field::Empty,
    )
}

// ---------------------------------------------------------------------------
// ActionExecutor
// ---------------------------------------------------------------------------

/// Runs logic inside a new action, optionally with a nested operation.
///
/// Dropping an `exec` future before its logic returns completes the unit
/// with failure from a background task, so a cancelled request never keeps
/// the drain open.
#[derive(Debug, Clone)]
pub struct ActionExecutor {
    actions: Arc<ActionManager>,
    stop_app_if_error: bool,
}

impl ActionExecutor {
    /// `stop_app_if_error` decides whether a failed completion stops the
    /// process; keep it `true` except on non-critical background paths.
    #[must_use]
    pub fn new(actions: Arc<ActionManager>, stop_app_if_error: bool) -> Self {
        Self {
            actions,
            stop_app_if_error,
        }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<ActionManager> {
        &self.actions
    }

    #[must_use]
    pub fn stop_app_if_error(&self) -> bool {
        self.stop_app_if_error
    }

    /// Creates and starts an action under `transaction`, runs `logic` with
    /// its context and completes the action with the outcome.
    ///
    /// # Errors
    ///
    /// [`ExecError::Lifecycle`] if the action could not be created,
    /// [`ExecError::Logic`] if `logic` failed, [`ExecError::Completion`] if
    /// `logic` succeeded but completing the action failed.
    pub async fn exec<T, F, Fut>(
        &self,
        transaction: &Arc<Transaction>,
        spec: impl Into<ActionSpec>,
        logic: F,
    ) -> Result<T, ExecError>
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let action = self.create(transaction, spec, started).await?;
        let mut pending = Pending::action(&self.actions, &action, self.stop_app_if_error);
        let ctx = OperationContext::new(Arc::clone(transaction), Arc::clone(&action));

        let span = action_span(&action);
        let caught = AssertUnwindSafe(logic(ctx))
            .catch_unwind()
            .instrument(span.clone())
            .await;
        pending.disarm();

        let outcome = outcome_of(&caught);
        let completion = self.complete(&action, outcome, started, &span).await;
        settle(caught, completion)
    }

    /// Like [`exec`](Self::exec), with a fresh operation nested in the fresh
    /// action. The operation completes first, then the action.
    ///
    /// # Errors
    ///
    /// As [`exec`](Self::exec); a failure to create the operation completes
    /// the action with failure and returns [`ExecError::Lifecycle`].
    pub async fn exec_with_operation<T, F, Fut>(
        &self,
        transaction: &Arc<Transaction>,
        action_spec: impl Into<ActionSpec>,
        operation_spec: impl Into<OperationSpec>,
        logic: F,
    ) -> Result<T, ExecError>
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let action = self.create(transaction, action_spec, started).await?;
        let mut pending = Pending::action(&self.actions, &action, self.stop_app_if_error);
        let span = action_span(&action);

        let operation = match action.operations().create_and_start(operation_spec).await {
            Ok(operation) => operation,
            Err(err) => {
                tracing::warn!(action_id = %action.id(), error = %err, "operation rejected");
                record_operation(Outcome::Rejected);
                pending.disarm();
                if let Err(completion) =
                    self.complete(&action, Outcome::Failure, started, &span).await
                {
                    tracing::debug!(
                        action_id = %action.id(),
                        error = %completion,
                        "rejected action could not be completed"
                    );
                }
                return Err(err.into());
            }
        };
        pending = pending.with_operation(&operation);
        let ctx = OperationContext::new(Arc::clone(transaction), Arc::clone(&action))
            .with_operation(Arc::clone(&operation));

        let caught = AssertUnwindSafe(logic(ctx))
            .catch_unwind()
            .instrument(span.clone())
            .await;
        pending.disarm();

        let outcome = outcome_of(&caught);
        let operation_completion =
            complete_operation(&operation, outcome, self.stop_app_if_error).await;
        let action_completion = self.complete(&action, outcome, started, &span).await;
        settle(caught, operation_completion.and(action_completion))
    }

    async fn create(
        &self,
        transaction: &Arc<Transaction>,
        spec: impl Into<ActionSpec>,
        started: Instant,
    ) -> Result<Arc<Action>, ExecError> {
        match self.actions.create_and_start(transaction, spec).await {
            Ok(action) => Ok(action),
            Err(err) => {
                tracing::warn!(transaction_id = %transaction.id(), error = %err, "action rejected");
                record_action(Outcome::Rejected, started.elapsed());
                Err(err.into())
            }
        }
    }

    async fn complete(
        &self,
        action: &Arc<Action>,
        outcome: Outcome,
        started: Instant,
        span: &Span,
    ) -> Result<(), LifecycleError> {
        let completion =
            complete_action(&self.actions, action, outcome, self.stop_app_if_error).await;
        span.record("outcome", outcome.as_str());
        record_action(outcome, started.elapsed());
        completion
    }
}

// ---------------------------------------------------------------------------
// OperationExecutor
// ---------------------------------------------------------------------------

/// Runs logic inside a new operation under the action of an existing
/// [`OperationContext`].
#[derive(Debug, Clone, Copy)]
pub struct OperationExecutor {
    stop_app_if_error: bool,
}

impl OperationExecutor {
    #[must_use]
    pub fn new(stop_app_if_error: bool) -> Self {
        Self { stop_app_if_error }
    }

    /// Creates an operation under `ctx`'s action, chained to `ctx`'s current
    /// operation unless `spec` names a parent, runs `logic` with the nested
    /// context and completes the operation with the outcome.
    ///
    /// # Errors
    ///
    /// [`ExecError::Lifecycle`] if the operation could not be created,
    /// [`ExecError::Logic`] if `logic` failed, [`ExecError::Completion`] if
    /// `logic` succeeded but completing the operation failed.
    pub async fn exec<T, F, Fut>(
        &self,
        ctx: &OperationContext,
        spec: impl Into<OperationSpec>,
        logic: F,
    ) -> Result<T, ExecError>
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut spec = spec.into();
        if spec.parent_operation_id.is_none() {
            spec.parent_operation_id = ctx.operation().map(|operation| operation.id());
        }

        let operation = match ctx.action().operations().create_and_start(spec).await {
            Ok(operation) => operation,
            Err(err) => {
                tracing::warn!(action_id = %ctx.action().id(), error = %err, "operation rejected");
                record_operation(Outcome::Rejected);
                return Err(err.into());
            }
        };
        let mut pending = Pending::operation(&operation, self.stop_app_if_error);

        let span = operation_span(&operation);
        let caught = AssertUnwindSafe(logic(ctx.with_operation(Arc::clone(&operation))))
            .catch_unwind()
            .instrument(span.clone())
            .await;
        pending.disarm();

        let outcome = outcome_of(&caught);
        span.record("outcome", outcome.as_str());
        let completion = complete_operation(&operation, outcome, self.stop_app_if_error).await;
        settle(caught, completion)
    }
}
