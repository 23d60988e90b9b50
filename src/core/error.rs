use crate::core::TaskValue;
use std::sync::Arc;
use thiserror::Error;

/// The value carried by a flow's shared error slot.
///
/// The engine never looks inside a `TaskError`; it only ferries the slot
/// from step to step. Steps construct whichever variant fits: an ad-hoc
/// message, a structured JSON payload, or a real error from an external
/// operation.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// An ad-hoc, message-only error.
    #[error("{0}")]
    Message(String),

    /// A structured error payload.
    #[error("{0}")]
    Value(TaskValue),

    /// An error produced by an external asynchronous operation.
    #[error(transparent)]
    Wrapped(Arc<dyn std::error::Error + Send + Sync>),
}

impl TaskError {
    /// Creates a message-only error.
    pub fn msg(message: impl Into<String>) -> Self {
        TaskError::Message(message.into())
    }

    /// Creates an error carrying a structured payload.
    pub fn value(payload: impl Into<TaskValue>) -> Self {
        TaskError::Value(payload.into())
    }

    /// Wraps an error from an external operation.
    pub fn wrap(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        TaskError::Wrapped(Arc::new(source))
    }
}

/// Wrapped sources are compared by identity only; two independently wrapped
/// errors are never equal.
impl PartialEq for TaskError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TaskError::Message(a), TaskError::Message(b)) => a == b,
            (TaskError::Value(a), TaskError::Value(b)) => a == b,
            (TaskError::Wrapped(a), TaskError::Wrapped(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(source: std::io::Error) -> Self {
        TaskError::wrap(source)
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(source: serde_json::Error) -> Self {
        TaskError::wrap(source)
    }
}

/// Returned by [`Done`](crate::Done) when an invocation can no longer
/// complete because every live handle to it was dropped (typically after a
/// step panicked or forgot to report).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("flow invocation was abandoned before reaching its terminal step")]
pub struct Stalled;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_display_and_eq() {
        let e = TaskError::msg("ERROR");
        assert_eq!(e.to_string(), "ERROR");
        assert_eq!(e, TaskError::msg("ERROR"));
        assert_ne!(e, TaskError::msg("other"));
    }

    #[test]
    fn test_value_display_and_eq() {
        let e = TaskError::value(json!({"code": 42}));
        assert_eq!(e.to_string(), r#"{"code":42}"#);
        assert_eq!(e, TaskError::value(json!({"code": 42})));
        assert_ne!(e, TaskError::msg(r#"{"code":42}"#));
    }

    #[test]
    fn test_wrapped_source_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let e = TaskError::from(io);
        assert!(e.to_string().contains("no such file"));

        let clone = e.clone();
        assert_eq!(e, clone);

        // Independently wrapped errors compare unequal even with the same text.
        let other = TaskError::wrap(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        assert_ne!(e, other);
    }
}
