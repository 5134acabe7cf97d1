//! Cross-process correlation through request metadata.
//!
//! An outgoing request carries the caller's session, action and operation ids
//! as headers; the receiving service extracts them and uses them as
//! `parent_action_id` / `parent_operation_id`, chaining work across services
//! without a shared broker.

use std::str::FromStr;

use causeway_core::{ActionId, ActionSpec, Descriptor, OperationId, OperationSpec, SessionId};
use http::header::{HeaderMap, HeaderValue};

use crate::context::OperationContext;

pub const SESSION_ID_HEADER: &str = "x-causeway-session-id";
pub const ACTION_ID_HEADER: &str = "x-causeway-action-id";
pub const OPERATION_ID_HEADER: &str = "x-causeway-operation-id";

/// A correlation header was present but unusable.
#[derive(Debug, thiserror::Error)]
#[error("invalid {header} header: {reason}")]
pub struct MetadataError {
    pub header: &'static str,
    pub reason: String,
}

/// Parent ids carried by an inbound request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParentIds {
    pub session_id: Option<SessionId>,
    pub action_id: Option<ActionId>,
    pub operation_id: Option<OperationId>,
}

impl ParentIds {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.action_id.is_none() && self.operation_id.is_none()
    }

    /// Action spec continuing the remote action, if any.
    #[must_use]
    pub fn action_spec(&self, descriptor: Descriptor) -> ActionSpec {
        ActionSpec::new(descriptor).parent_action(self.action_id)
    }

    /// Operation spec chained to the remote operation, if any.
    #[must_use]
    pub fn operation_spec(&self, descriptor: Descriptor) -> OperationSpec {
        OperationSpec::new(descriptor).parent_operation(self.operation_id)
    }
}

/// Writes the context's ids into `headers`, replacing earlier values.
pub fn inject(ctx: &OperationContext, headers: &mut HeaderMap) {
    insert(headers, SESSION_ID_HEADER, ctx.session_id());
    insert(headers, ACTION_ID_HEADER, ctx.action().id());
    match ctx.operation() {
        Some(operation) => insert(headers, OPERATION_ID_HEADER, operation.id()),
        None => {
            headers.remove(OPERATION_ID_HEADER);
        }
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, id: impl ToString) {
    // Ids render as lowercase hex, always a valid header value.
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        headers.insert(name, value);
    }
}

/// Reads parent ids from `headers`. Absent headers yield `None`.
///
/// # Errors
///
/// Returns [`MetadataError`] if a header is present but is not valid ASCII
/// or not a well-formed id.
pub fn extract(headers: &HeaderMap) -> Result<ParentIds, MetadataError> {
    Ok(ParentIds {
        session_id: parse(headers, SESSION_ID_HEADER)?,
        action_id: parse(headers, ACTION_ID_HEADER)?,
        operation_id: parse(headers, OPERATION_ID_HEADER)?,
    })
}

fn parse<T>(headers: &HeaderMap, name: &'static str) -> Result<Option<T>, MetadataError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    let invalid = |reason: String| MetadataError {
        header: name,
        reason,
    };
    let text = value.to_str().map_err(|err| invalid(err.to_string()))?;
    text.trim()
        .parse()
        .map(Some)
        .map_err(|err: T::Err| invalid(err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use causeway_core::{ActionManager, LifecycleContext, TransactionManager};

    use super::*;

    #[tokio::test]
    async fn inject_then_extract_recovers_parents() {
        let lifecycle = LifecycleContext::builder(SessionId::new(0xBEEF)).build();
        let transactions = TransactionManager::new(Arc::clone(&lifecycle)).unwrap();
        let actions = ActionManager::new(lifecycle).unwrap();
        let transaction = transactions.create_and_start().await.unwrap();
        let action = actions
            .create_and_start(&transaction, Descriptor::new("signup", "identity", "users"))
            .await
            .unwrap();
        let operation = action
            .operations()
            .create_and_start(Descriptor::new("notify", "http", "email"))
            .await
            .unwrap();
        let ctx = OperationContext::new(transaction, Arc::clone(&action)).with_operation(operation.clone());

        let mut headers = HeaderMap::new();
        inject(&ctx, &mut headers);
        let parents = extract(&headers).unwrap();

        assert_eq!(parents.session_id, Some(SessionId::new(0xBEEF)));
        assert_eq!(parents.action_id, Some(action.id()));
        assert_eq!(parents.operation_id, Some(operation.id()));

        let spec = parents.action_spec(Descriptor::new("send_email", "email", "notifications"));
        assert_eq!(spec.parent_action_id, Some(action.id()));
        let spec = parents.operation_spec(Descriptor::new("render", "templates", "email"));
        assert_eq!(spec.parent_operation_id, Some(operation.id()));
    }

    #[test]
    fn missing_headers_are_empty() {
        let parents = extract(&HeaderMap::new()).unwrap();
        assert!(parents.is_empty());
        assert_eq!(parents.action_spec(Descriptor::new("a", "b", "c")).parent_action_id, None);
    }

    #[test]
    fn malformed_header_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(ACTION_ID_HEADER, HeaderValue::from_static("not-hex"));
        let err = extract(&headers).unwrap_err();
        assert_eq!(err.header, ACTION_ID_HEADER);
        assert!(err.to_string().contains("x-causeway-action-id"));
    }

    #[test]
    fn session_header_parses_hex() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_ID_HEADER, HeaderValue::from_static("00000000000000ff"));
        assert_eq!(extract(&headers).unwrap().session_id, Some(SessionId::new(0xFF)));
    }
}
