//! Closed set of loggable entries.
//!
//! Sinks and the fatal-escalation path receive a [`LogEntry`] and serialize
//! it through the variant's own snapshot type; dispatch is a plain `match`.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::action::Action;
use crate::error::UnitKind;
use crate::ids::{ActionId, OperationId, TransactionId};
use crate::operation::Operation;
use crate::transaction::Transaction;

/// Correlation ids attached to request/response/call entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Correlation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<ActionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
}

/// An inbound request as received by an embedding service.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEntry {
    #[serde(flatten)]
    pub correlation: Correlation,
    /// Transport method or RPC name, e.g. `"POST"` or `"identity.v1.Users/Create"`.
    pub method: String,
    pub target: String,
    pub received_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// The response sent for a previously logged request.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEntry {
    #[serde(flatten)]
    pub correlation: Correlation,
    pub status: u16,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An outbound call to another service or store.
#[derive(Debug, Clone, Serialize)]
pub struct CallEntry {
    #[serde(flatten)]
    pub correlation: Correlation,
    pub service: String,
    pub method: String,
    pub elapsed_ms: u64,
    pub succeeded: bool,
}

/// Everything the logging layer knows how to record.
#[derive(Debug, Clone)]
pub enum LogEntry {
    Transaction(Arc<Transaction>),
    Action(Arc<Action>),
    Operation(Arc<Operation>),
    Request(RequestEntry),
    Response(ResponseEntry),
    Call(CallEntry),
}

impl LogEntry {
    /// Short lowercase tag for log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transaction(_) => "transaction",
            Self::Action(_) => "action",
            Self::Operation(_) => "operation",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Call(_) => "call",
        }
    }

    /// The lifecycle unit this entry describes, if any.
    #[must_use]
    pub fn unit(&self) -> Option<UnitKind> {
        match self {
            Self::Transaction(_) => Some(UnitKind::Transaction),
            Self::Action(_) => Some(UnitKind::Action),
            Self::Operation(_) => Some(UnitKind::Operation),
            Self::Request(_) | Self::Response(_) | Self::Call(_) => None,
        }
    }

    /// Hex id of the unit, or the most specific correlated id for the other
    /// variants.
    #[must_use]
    pub fn id(&self) -> Option<String> {
        let correlation = match self {
            Self::Transaction(t) => return Some(t.id().to_string()),
            Self::Action(a) => return Some(a.id().to_string()),
            Self::Operation(o) => return Some(o.id().to_string()),
            Self::Request(r) => &r.correlation,
            Self::Response(r) => &r.correlation,
            Self::Call(c) => &c.correlation,
        };
        correlation
            .operation_id
            .map(|id| id.to_string())
            .or_else(|| correlation.action_id.map(|id| id.to_string()))
            .or_else(|| correlation.transaction_id.map(|id| id.to_string()))
    }

    /// Serializes the entry through its variant's snapshot.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let value = match self {
            Self::Transaction(t) => serde_json::to_value(t.record()),
            Self::Action(a) => serde_json::to_value(a.record()),
            Self::Operation(o) => serde_json::to_value(o.record()),
            Self::Request(r) => serde_json::to_value(r),
            Self::Response(r) => serde_json::to_value(r),
            Self::Call(c) => serde_json::to_value(c),
        };
        value.unwrap_or_else(|err| json!({ "kind": self.kind(), "serialization_error": err.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ActionIdGenerator, SessionId};

    #[test]
    fn request_entry_flattens_correlation() {
        let ids = ActionIdGenerator::new("actions", SessionId::new(9), 1).unwrap();
        let action_id = ids.next_id().unwrap();
        let entry = LogEntry::Request(RequestEntry {
            correlation: Correlation {
                action_id: Some(action_id),
                ..Correlation::default()
            },
            method: "POST".to_string(),
            target: "/users".to_string(),
            received_at: 1_000,
            user_id: Some("u-1".to_string()),
            client_id: None,
        });

        let json = entry.to_json();
        assert_eq!(json["action_id"], action_id.to_string());
        assert_eq!(json["method"], "POST");
        assert!(json.get("transaction_id").is_none());
        assert!(json.get("client_id").is_none());
        assert_eq!(entry.kind(), "request");
        assert_eq!(entry.unit(), None);
        assert_eq!(entry.id(), Some(action_id.to_string()));
    }

    #[test]
    fn call_entry_without_correlation_has_no_id() {
        let entry = LogEntry::Call(CallEntry {
            correlation: Correlation::default(),
            service: "postgres".to_string(),
            method: "insert_user".to_string(),
            elapsed_ms: 4,
            succeeded: true,
        });
        assert_eq!(entry.id(), None);
        assert_eq!(entry.to_json()["succeeded"], true);
    }
}
