use sea_orm::DbErr;
use thiserror::Error;

/// Unified error type for the order and inventory core.
///
/// Every failure surfaced to a caller carries a stable kind; callers branch
/// on the variant, never on the message text.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid status transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    #[error("database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("message queue error: {0}")]
    QueueError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Persisted state contradicts a core invariant. The affected aggregate
    /// must not be processed further.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl ServiceError {
    pub fn db_error(err: DbErr) -> Self {
        ServiceError::DatabaseError(err)
    }

    /// Stable machine-readable kind, suitable for wire envelopes and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::ValidationError(_) => "validation",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::InvalidTransition { .. } => "invalid_transition",
            ServiceError::DatabaseError(_) => "database",
            ServiceError::QueueError(_) => "queue",
            ServiceError::SerializationError(_) => "serialization",
            ServiceError::Timeout(_) => "timeout",
            ServiceError::InvariantViolation(_) => "invariant_violation",
            ServiceError::InternalError(_) => "internal",
        }
    }

    /// Whether the event layer should redeliver the message that triggered
    /// this error. Validation and not-found outcomes never retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::DatabaseError(_)
                | ServiceError::QueueError(_)
                | ServiceError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(ServiceError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(
            ServiceError::InvalidTransition {
                from: "shipped".into(),
                to: "processing".into()
            }
            .kind(),
            "invalid_transition"
        );
    }

    #[test]
    fn transience_follows_taxonomy() {
        assert!(ServiceError::Timeout("store".into()).is_transient());
        assert!(!ServiceError::ValidationError("empty lines".into()).is_transient());
        assert!(!ServiceError::Conflict("reservation exists".into()).is_transient());
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = ServiceError::InvalidTransition {
            from: "delivered".into(),
            to: "processing".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("delivered"));
        assert!(msg.contains("processing"));
    }
}
