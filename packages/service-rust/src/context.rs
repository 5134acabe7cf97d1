//! Handle threaded through business code.

use std::sync::Arc;

use causeway_core::{Action, Correlation, Operation, SessionId, Transaction};
use tokio_util::sync::CancellationToken;

/// Session, transaction, action and (optionally) current operation of a
/// request, plus its cancellation token and caller identity.
///
/// Cloning is shallow: every unit is behind an `Arc` and the token shares
/// its cancellation state. Use [`with_operation`](Self::with_operation) to
/// derive the context for a nested operation without touching the caller's.
#[derive(Debug, Clone)]
pub struct OperationContext {
    session_id: SessionId,
    transaction: Arc<Transaction>,
    action: Arc<Action>,
    operation: Option<Arc<Operation>>,
    cancellation: CancellationToken,
    user_id: Option<Arc<str>>,
    client_id: Option<Arc<str>>,
}

impl OperationContext {
    /// Creates a context for `action` with a fresh cancellation token and no
    /// caller identity.
    #[must_use]
    pub fn new(transaction: Arc<Transaction>, action: Arc<Action>) -> Self {
        Self {
            session_id: transaction.id().session_id(),
            transaction,
            action,
            operation: None,
            cancellation: CancellationToken::new(),
            user_id: None,
            client_id: None,
        }
    }

    /// Copy of this context whose current operation is `operation`.
    #[must_use]
    pub fn with_operation(&self, operation: Arc<Operation>) -> Self {
        Self {
            operation: Some(operation),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<Arc<str>>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<Arc<str>>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Replaces the cancellation token, e.g. with a child of the request's.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    #[must_use]
    pub fn action(&self) -> &Arc<Action> {
        &self.action
    }

    #[must_use]
    pub fn operation(&self) -> Option<&Arc<Operation>> {
        self.operation.as_ref()
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Ids for request/response/call audit entries.
    #[must_use]
    pub fn correlation(&self) -> Correlation {
        Correlation {
            transaction_id: Some(self.transaction.id()),
            action_id: Some(self.action.id()),
            operation_id: self.operation.as_ref().map(|operation| operation.id()),
        }
    }
}
