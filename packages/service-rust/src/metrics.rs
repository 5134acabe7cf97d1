//! Executor metrics.
//!
//! Recorded through the `metrics` facade; the embedding service installs
//! whichever recorder it exports with. Without a recorder every call is a
//! no-op.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

pub const ACTIONS_TOTAL: &str = "causeway_actions_total";
pub const OPERATIONS_TOTAL: &str = "causeway_operations_total";
pub const ESCALATIONS_TOTAL: &str = "causeway_escalations_total";
pub const ACTION_DURATION_SECONDS: &str = "causeway_action_duration_seconds";

/// How an executed unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Panic,
    /// The executor future was dropped before the logic returned.
    Cancelled,
    /// The unit could not be created.
    Rejected,
}

impl Outcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Panic => "panic",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }
}

/// Registers metric descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(ACTIONS_TOTAL, "Actions run through an executor, by outcome");
    describe_counter!(OPERATIONS_TOTAL, "Operations run through an executor, by outcome");
    describe_counter!(
        ESCALATIONS_TOTAL,
        "Completion failures escalated by executors, by fatality"
    );
    describe_histogram!(
        ACTION_DURATION_SECONDS,
        "Wall time from action creation to completion"
    );
}

pub(crate) fn record_action(outcome: Outcome, elapsed: Duration) {
    counter!(ACTIONS_TOTAL, "outcome" => outcome.as_str()).increment(1);
    histogram!(ACTION_DURATION_SECONDS).record(elapsed.as_secs_f64());
}

pub(crate) fn record_operation(outcome: Outcome) {
    counter!(OPERATIONS_TOTAL, "outcome" => outcome.as_str()).increment(1);
}

pub(crate) fn record_escalation(fatal: bool) {
    counter!(ESCALATIONS_TOTAL, "fatal" => if fatal { "true" } else { "false" }).increment(1);
}
