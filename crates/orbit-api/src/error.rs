//! Error taxonomy shared by every orbit crate.
//!
//! Request-flow handlers propagate these with `?`; the task queue resolves a
//! caller's pending future with the handler's error, so the variants here are
//! exactly what callers of `update`/`query`/`push`/`pull`/`sync` can observe.

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, OrbitError>;

#[derive(Debug, Error)]
pub enum OrbitError {
    /// A programmer contract was violated (missing argument, capability used
    /// on a source that was never wired for it). Fatal; never caught
    /// internally.
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// A log operation targeted a transform id that is not in the log.
    #[error("transform {0} is not contained in the log")]
    NotLogged(String),

    /// A log operation's relative position fell outside the log bounds.
    #[error("position {relative} relative to transform {id} is outside the log")]
    OutOfRange { id: String, relative: i64 },

    /// A handler-specific gate rejected the transform before dispatch.
    #[error("transform {transform_id} not allowed: {reason}")]
    TransformNotAllowed { transform_id: String, reason: String },

    /// A query demanded a record that is absent, and the request options did
    /// not suppress the failure.
    #[error("record not found: {kind}:{id}")]
    RecordNotFound { kind: String, id: String },

    /// An operation referred to a model, relationship or key the schema does
    /// not declare.
    #[error("schema error: {0}")]
    Schema(String),

    /// Transport failure: unreachable host, connection reset, or timeout.
    #[error("network error: {0}")]
    Network(String),

    /// The remote answered with a 4xx status.
    #[error("client error ({status}): {description}")]
    Client {
        status: u16,
        description: String,
        /// Parsed response body, when the remote sent one.
        data: Option<serde_json::Value>,
    },

    /// The remote answered with a 5xx status.
    #[error("server error ({status}): {description}")]
    Server { status: u16, description: String },

    /// The task queue was cleared (or the source deactivated) while this
    /// request was pending.
    #[error("task cancelled: {0}")]
    TaskCancelled(String),

    /// A durable store failed to read or write.
    #[error("storage error: {0}")]
    Storage(String),
}

impl OrbitError {
    /// Whether this error came from the remote boundary (network, 4xx, 5xx).
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            OrbitError::Network(_) | OrbitError::Client { .. } | OrbitError::Server { .. }
        )
    }

    /// Clone-ish helper for fan-out paths (the error type itself is not
    /// `Clone` because `serde_json::Error` sources could be attached later).
    pub fn duplicate(&self) -> OrbitError {
        match self {
            OrbitError::Assertion(m) => OrbitError::Assertion(m.clone()),
            OrbitError::NotLogged(id) => OrbitError::NotLogged(id.clone()),
            OrbitError::OutOfRange { id, relative } => OrbitError::OutOfRange {
                id: id.clone(),
                relative: *relative,
            },
            OrbitError::TransformNotAllowed {
                transform_id,
                reason,
            } => OrbitError::TransformNotAllowed {
                transform_id: transform_id.clone(),
                reason: reason.clone(),
            },
            OrbitError::RecordNotFound { kind, id } => OrbitError::RecordNotFound {
                kind: kind.clone(),
                id: id.clone(),
            },
            OrbitError::Schema(m) => OrbitError::Schema(m.clone()),
            OrbitError::Network(m) => OrbitError::Network(m.clone()),
            OrbitError::Client {
                status,
                description,
                data,
            } => OrbitError::Client {
                status: *status,
                description: description.clone(),
                data: data.clone(),
            },
            OrbitError::Server {
                status,
                description,
            } => OrbitError::Server {
                status: *status,
                description: description.clone(),
            },
            OrbitError::TaskCancelled(m) => OrbitError::TaskCancelled(m.clone()),
            OrbitError::Storage(m) => OrbitError::Storage(m.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = OrbitError::RecordNotFound {
            kind: "planet".to_string(),
            id: "jupiter".to_string(),
        };
        assert_eq!(err.to_string(), "record not found: planet:jupiter");

        let err = OrbitError::Network("No fetch response within 10ms.".to_string());
        assert!(err.is_remote());
        assert!(!OrbitError::Assertion("x".into()).is_remote());
    }

    #[test]
    fn test_duplicate_preserves_variant() {
        let err = OrbitError::Client {
            status: 422,
            description: "Unprocessable Entity".to_string(),
            data: Some(serde_json::json!({"errors": []})),
        };
        match err.duplicate() {
            OrbitError::Client { status, data, .. } => {
                assert_eq!(status, 422);
                assert!(data.is_some());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
