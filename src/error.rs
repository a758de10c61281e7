use thiserror::Error;

/// Errors surfaced by the session, proxy and storage layers.
///
/// Protocol and session-local failures end only the owning session. Storage engine
/// faults are the only ones that can take the whole server down.
#[derive(Debug, Error)]
pub enum BbsError {
    /// Negotiation or handshake failure on a single connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Another proxy handle holds the advisory lock for this record.
    #[error("storage conflict on {namespace}/{key} (locked by handle {owner})")]
    StorageConflict {
        namespace: String,
        key: String,
        owner: u64,
    },

    /// Lock acquisition, negotiation or idle wait ran out of time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The configured session limit is reached.
    #[error("all {max} nodes are busy, please try again later")]
    CapacityExceeded { max: usize },

    /// Unexpected failure inside one session's execution context.
    #[error("internal fault: {0}")]
    InternalFault(String),

    /// Lookup of a session or record that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The storage engine loop is gone (shut down or crashed).
    #[error("storage engine unavailable")]
    EngineUnavailable,

    /// Rejected namespace, key or username.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Authentication rejected.
    #[error("authentication failed for {0}")]
    Auth(String),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BbsError {
    /// Whether the caller may reasonably retry the operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BbsError::StorageConflict { .. } | BbsError::Timeout(_)
        )
    }
}

pub type Result<T, E = BbsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_and_timeout_are_recoverable() {
        let conflict = BbsError::StorageConflict {
            namespace: "users".into(),
            key: "alice".into(),
            owner: 3,
        };
        assert!(conflict.is_recoverable());
        assert!(BbsError::Timeout("lock users/alice".into()).is_recoverable());
        assert!(!BbsError::CapacityExceeded { max: 4 }.is_recoverable());
        assert!(!BbsError::EngineUnavailable.is_recoverable());
    }

    #[test]
    fn capacity_message_names_limit() {
        let msg = BbsError::CapacityExceeded { max: 16 }.to_string();
        assert!(msg.contains("16"));
    }
}
