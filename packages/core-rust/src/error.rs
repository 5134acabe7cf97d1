//! Error taxonomy for the lifecycle engine.
//!
//! Errors fall into four classes (see [`ErrorClass`]): caller bugs (usage),
//! exhausted identifier space, failures to durably record a lifecycle event,
//! and refusals because creation is no longer possible. Only durability
//! errors are escalated beyond the immediate caller.

use std::fmt;

use serde::Serialize;

/// Convenience alias used throughout the crate.
pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;

/// The kind of tracked unit an error, id, or log entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Transaction,
    Action,
    Operation,
}

impl UnitKind {
    /// Lowercase name used in log fields and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Action => "action",
            Self::Operation => "operation",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An out-of-order `start`/`complete` call on a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("already started")]
    AlreadyStarted,
    #[error("not started")]
    NotStarted,
    #[error("already completed")]
    AlreadyCompleted,
}

/// Coarse classification driving the propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller-side bug. Stays local, gate untouched.
    Usage,
    /// A sequence reached its bound. Stays local.
    Exhaustion,
    /// A sink failed to persist a lifecycle event. Escalated process-wide.
    Durability,
    /// Creation refused because the gate is closed or the owner is gone.
    Unavailable,
}

/// Errors produced by sequences, generators, units, and managers.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid sequence {name}: {reason}")]
    InvalidSequence { name: String, reason: &'static str },

    #[error("sequence {name} exhausted (max {max_value})")]
    SequenceExhausted { name: String, max_value: u64 },

    #[error("{unit} {id}: {violation}")]
    Usage {
        unit: UnitKind,
        id: String,
        violation: Violation,
    },

    #[error("operation {operation} belongs to action {owner}, not action {manager}")]
    ForeignOperation {
        operation: String,
        owner: String,
        manager: String,
    },

    #[error("action {action} is not tracked by this manager")]
    ForeignAction { action: String },

    #[error("{unit} creation is disabled")]
    CreationDisabled { unit: UnitKind },

    #[error("action {action} was released while creating an operation")]
    ActionReleased { action: String },

    #[error("failed to record {unit} {id}: {source}")]
    Durability {
        unit: UnitKind,
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl LifecycleError {
    pub(crate) fn usage(unit: UnitKind, id: impl fmt::Display, violation: Violation) -> Self {
        Self::Usage {
            unit,
            id: id.to_string(),
            violation,
        }
    }

    /// Returns the propagation class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidSequence { .. }
            | Self::Usage { .. }
            | Self::ForeignOperation { .. }
            | Self::ForeignAction { .. } => ErrorClass::Usage,
            Self::SequenceExhausted { .. } => ErrorClass::Exhaustion,
            Self::Durability { .. } => ErrorClass::Durability,
            Self::CreationDisabled { .. } | Self::ActionReleased { .. } => ErrorClass::Unavailable,
        }
    }

    /// Shorthand for `class() == ErrorClass::Durability`.
    #[must_use]
    pub fn is_durability(&self) -> bool {
        self.class() == ErrorClass::Durability
    }
}
