//! Causeway Service: executors, request context, cross-process metadata and
//! shutdown wiring for services built on `causeway-core`.

pub mod audit;
pub mod backbone;
pub mod config;
pub mod context;
pub mod executor;
pub mod metadata;
pub mod metrics;
pub mod shutdown;

pub use audit::{AuditError, AuditRecorder};
pub use backbone::Backbone;
pub use config::{init_tracing, LogFormat, ServiceConfig};
pub use context::OperationContext;
pub use executor::{ActionExecutor, ExecError, OperationExecutor};
pub use metadata::{MetadataError, ParentIds};
pub use shutdown::{HealthState, ShutdownController, StopReason};
