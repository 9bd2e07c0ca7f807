//! Reconcile and mapping errors.

use nodepool_id::ObjectKey;
use thiserror::Error;

/// Errors returned by a reconciler.
///
/// The variant decides what happens to the key: retryable errors are
/// re-queued with backoff, terminal errors are dropped until something
/// triggers the key again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Transient failure that should be retried.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Failure that will not go away by retrying.
    #[error("terminal: {0}")]
    Terminal(String),
}

impl ReconcileError {
    pub fn retryable(msg: impl std::fmt::Display) -> Self {
        Self::Retryable(msg.to_string())
    }

    pub fn terminal(msg: impl std::fmt::Display) -> Self {
        Self::Terminal(msg.to_string())
    }

    /// Returns true if the key should be re-queued with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Errors raised while translating an event into keys.
///
/// Mapping errors never stop a watch: the event is logged and dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MappingError {
    /// An owner reference of the expected kind is unusable.
    #[error("malformed owner reference on {object}: {reason}")]
    MalformedOwnerReference { object: ObjectKey, reason: String },

    /// More than one owner reference of the expected kind claims control.
    #[error("{object} has {count} controlling {kind} owner references")]
    AmbiguousOwner {
        object: ObjectKey,
        kind: &'static str,
        count: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ReconcileError::retryable("api unavailable").is_retryable());
        assert!(!ReconcileError::terminal("invalid spec").is_retryable());
    }

    #[test]
    fn test_mapping_error_message() {
        let err = MappingError::AmbiguousOwner {
            object: ObjectKey::new("shoot--a", "m-1"),
            kind: "Worker",
            count: 2,
        };
        assert_eq!(
            err.to_string(),
            "shoot--a/m-1 has 2 controlling Worker owner references"
        );
    }
}
