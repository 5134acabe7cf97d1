//! Per-process wiring of the lifecycle engine.
//!
//! A [`Backbone`] is built once at bootstrap and shared by the request
//! handlers of an embedding service. It owns the lifecycle context, the
//! transaction and action managers, both executors and the shutdown
//! controller.

use std::sync::Arc;

use causeway_core::{
    ActionManager, LifecycleContext, LifecycleContextBuilder, LifecycleError, Transaction,
    TransactionManager,
};
use tracing::{info, warn};

use crate::audit::AuditRecorder;
use crate::config::ServiceConfig;
use crate::executor::{ActionExecutor, OperationExecutor};
use crate::metrics::describe_metrics;
use crate::shutdown::{ShutdownController, StopReason};

#[derive(Debug)]
pub struct Backbone {
    config: ServiceConfig,
    lifecycle: Arc<LifecycleContext>,
    transactions: Arc<TransactionManager>,
    actions: Arc<ActionManager>,
    action_executor: ActionExecutor,
    operation_executor: OperationExecutor,
    audit: AuditRecorder,
    shutdown: Arc<ShutdownController>,
}

impl Backbone {
    /// Builds the backbone for `config`.
    ///
    /// The context builder comes preset with the session id, lane count and
    /// the backbone's shutdown controller as shutdown hook; `configure`
    /// installs sinks and, in tests, a clock.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] if the id generators cannot be built, e.g.
    /// for a zero lane count.
    pub fn new(
        config: ServiceConfig,
        configure: impl FnOnce(LifecycleContextBuilder) -> LifecycleContextBuilder,
    ) -> Result<Self, LifecycleError> {
        let shutdown = Arc::new(ShutdownController::new());
        let builder = LifecycleContext::builder(config.resolve_session_id())
            .sequence_lanes(config.sequence_lanes)
            .shutdown_hook(shutdown.clone());
        let lifecycle = configure(builder).build();

        let transactions = Arc::new(TransactionManager::new(Arc::clone(&lifecycle))?);
        let actions = Arc::new(ActionManager::new(Arc::clone(&lifecycle))?);

        Ok(Self {
            action_executor: ActionExecutor::new(Arc::clone(&actions), config.stop_app_if_error),
            operation_executor: OperationExecutor::new(config.stop_app_if_error),
            audit: AuditRecorder::new(Arc::clone(&lifecycle)),
            config,
            lifecycle,
            transactions,
            actions,
            shutdown,
        })
    }

    /// Marks the service ready and registers metric descriptions.
    pub fn start(&self) {
        describe_metrics();
        self.shutdown.set_ready();
        info!(
            service = %self.config.service_name,
            session_id = %self.lifecycle.session_id(),
            "backbone ready"
        );
    }

    /// Shorthand for `transactions().create_and_start()`.
    ///
    /// # Errors
    ///
    /// As [`TransactionManager::create_and_start`].
    pub async fn begin(&self) -> Result<Arc<Transaction>, LifecycleError> {
        self.transactions.create_and_start().await
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<LifecycleContext> {
        &self.lifecycle
    }

    #[must_use]
    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    #[must_use]
    pub fn actions(&self) -> &Arc<ActionManager> {
        &self.actions
    }

    #[must_use]
    pub fn action_executor(&self) -> &ActionExecutor {
        &self.action_executor
    }

    #[must_use]
    pub fn operation_executor(&self) -> OperationExecutor {
        self.operation_executor
    }

    #[must_use]
    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> &Arc<ShutdownController> {
        &self.shutdown
    }

    /// Closes both creation gates and waits, within the configured drain
    /// timeout, for in-flight creations and live actions to finish.
    ///
    /// Returns `true` if the drain completed in time; the controller is then
    /// `Stopped`. On timeout it stays `Draining`.
    pub async fn shutdown(&self) -> bool {
        self.shutdown.trigger_shutdown(StopReason::Requested);
        self.transactions.allow_to_create(false);
        self.actions.allow_to_create(false);

        let drain = async {
            self.transactions.wait().await;
            self.actions.wait().await;
        };
        if tokio::time::timeout(self.config.drain_timeout, drain)
            .await
            .is_ok()
        {
            self.shutdown.set_stopped();
            info!(service = %self.config.service_name, "backbone drained");
            true
        } else {
            warn!(
                service = %self.config.service_name,
                live_actions = self.actions.active_count(),
                timeout = ?self.config.drain_timeout,
                "drain timed out"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use causeway_core::sinks::Channel;
    use causeway_core::{Descriptor, MemorySink, SessionId};

    use super::*;
    use crate::shutdown::HealthState;

    fn backbone(sink: &Arc<MemorySink>, drain_timeout: Duration) -> Backbone {
        let config = ServiceConfig {
            session_id: Some(SessionId::new(0xC0FFEE)),
            drain_timeout,
            ..ServiceConfig::new("identity")
        };
        let sink = Arc::clone(sink);
        Backbone::new(config, move |builder| builder.sink(sink)).unwrap()
    }

    #[tokio::test]
    async fn start_then_drain_with_nothing_live() {
        let sink = Arc::new(MemorySink::new());
        let backbone = backbone(&sink, Duration::from_secs(1));
        assert_eq!(backbone.shutdown_controller().health_state(), HealthState::Starting);

        backbone.start();
        assert_eq!(backbone.shutdown_controller().health_state(), HealthState::Ready);

        let transaction = backbone.begin().await.unwrap();
        assert_eq!(transaction.id().session_id(), SessionId::new(0xC0FFEE));
        assert_eq!(sink.transaction_ids(), vec![transaction.id()]);

        assert!(backbone.shutdown().await);
        assert_eq!(backbone.shutdown_controller().health_state(), HealthState::Stopped);
        assert_eq!(
            backbone.shutdown_controller().stop_reason(),
            Some(StopReason::Requested)
        );
        assert!(backbone.begin().await.is_err());
    }

    #[tokio::test]
    async fn drain_waits_for_live_action() {
        let sink = Arc::new(MemorySink::new());
        let backbone = Arc::new(backbone(&sink, Duration::from_secs(5)));
        backbone.start();

        let transaction = backbone.begin().await.unwrap();
        let action = backbone
            .actions()
            .create_and_start(&transaction, Descriptor::new("signup", "identity", "users"))
            .await
            .unwrap();

        let draining = tokio::spawn({
            let backbone = Arc::clone(&backbone);
            async move { backbone.shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!draining.is_finished());
        assert_eq!(backbone.shutdown_controller().health_state(), HealthState::Draining);

        backbone.actions().complete(&action, true).await.unwrap();
        assert!(draining.await.unwrap());
        assert_eq!(sink.events_on(Channel::Actions).len(), 2);
    }

    #[tokio::test]
    async fn drain_times_out_on_stuck_action() {
        let sink = Arc::new(MemorySink::new());
        let backbone = backbone(&sink, Duration::from_millis(30));
        backbone.start();

        let transaction = backbone.begin().await.unwrap();
        let _stuck = backbone
            .actions()
            .create_and_start(&transaction, Descriptor::new("import", "batch", "users"))
            .await
            .unwrap();

        assert!(!backbone.shutdown().await);
        assert_eq!(backbone.shutdown_controller().health_state(), HealthState::Draining);
    }

    #[tokio::test]
    async fn durability_failure_reaches_controller() {
        let sink = Arc::new(MemorySink::new());
        let backbone = backbone(&sink, Duration::from_secs(1));
        backbone.start();
        sink.set_failing(Channel::Transactions, true);

        assert!(backbone.begin().await.is_err());
        let mut signal = backbone.shutdown_controller().shutdown_receiver();
        tokio::time::timeout(Duration::from_secs(1), signal.wait_for(|stop| *stop))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(backbone.shutdown_controller().stop_reason(), Some(StopReason::Fatal));
    }

    #[test]
    fn zero_lanes_are_rejected() {
        let config = ServiceConfig {
            sequence_lanes: 0,
            ..ServiceConfig::new("broken")
        };
        assert!(Backbone::new(config, |builder| builder).is_err());
    }
}
