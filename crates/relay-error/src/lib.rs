use std::time::Duration;
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

/// Error type shared by every stage of the relay pipeline
///
/// Variants follow the failure taxonomy the pipeline reacts to: transient
/// connectivity problems are recovered by reconnecting or by dropping the
/// single affected event, everything else is surfaced to the caller.
#[derive(Error, Debug)]
pub enum RelayError {
    // ===== Storage & Broker Errors =====
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Kafka error: {0}")]
    Kafka(String),

    // ===== Subscription Errors =====
    #[error("Subscription error: {0}")]
    Subscription(String),

    // ===== Publish Errors =====
    #[error("Circuit breaker is OPEN - broker unavailable (last failure: {0:?} ago)")]
    CircuitOpen(Duration),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    // ===== Payload Errors =====
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// True for connectivity failures that may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_timeout()
            }
            RelayError::Kafka(_)
            | RelayError::Subscription(_)
            | RelayError::CircuitOpen(_)
            | RelayError::Timeout(_)
            | RelayError::Io(_) => true,
            _ => false,
        }
    }

    /// Get error code for logs and metrics labels
    pub fn error_code(&self) -> &'static str {
        match self {
            RelayError::Redis(_) => "REDIS_ERROR",
            RelayError::Kafka(_) => "KAFKA_ERROR",
            RelayError::Subscription(_) => "SUBSCRIPTION_ERROR",
            RelayError::CircuitOpen(_) => "CIRCUIT_OPEN",
            RelayError::Timeout(_) => "TIMEOUT",
            RelayError::Json(_) => "JSON_ERROR",
            RelayError::Malformed(_) => "MALFORMED_PAYLOAD",
            RelayError::Validation(_) => "VALIDATION_ERROR",
            RelayError::Io(_) => "IO_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RelayError::Subscription("closed".into()).is_transient());
        assert!(RelayError::CircuitOpen(Duration::from_secs(1)).is_transient());
        assert!(!RelayError::Malformed("missing key".into()).is_transient());
        assert!(!RelayError::Validation("bad".into()).is_transient());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(RelayError::Kafka("x".into()).error_code(), "KAFKA_ERROR");
        assert_eq!(
            RelayError::Timeout(Duration::from_millis(5)).error_code(),
            "TIMEOUT"
        );
        let io = std::io::Error::other("boom");
        assert_eq!(RelayError::from(io).error_code(), "IO_ERROR");
    }

    #[test]
    fn test_display_includes_context() {
        let err = RelayError::Malformed("missing key field".into());
        assert_eq!(err.to_string(), "Malformed payload: missing key field");
    }
}
