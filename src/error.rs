use thiserror::Error;

pub type Result<T> = std::result::Result<T, FunnelError>;

/// Errors produced while validating, compiling, executing or shaping a funnel.
#[derive(Debug, Error)]
pub enum FunnelError {
    /// The funnel specification was rejected before any query was built.
    #[error("invalid funnel: {0}")]
    InvalidSpec(String),
    #[error("invalid dimension: {0}")]
    InvalidDimension(String),
    /// Internal inconsistency while assembling the stage chain.
    #[error("compile failure: {0}")]
    CompileFailure(String),
    #[error("execution failure: {0}")]
    ExecutionFailure(String),
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),
    /// A step count in the executor result could not be read as a number.
    #[error("malformed aggregate: {0}")]
    MalformedAggregate(String),
}

impl FunnelError {
    /// Returns `true` for errors caused by the caller's funnel definition.
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidSpec(_) | Self::InvalidDimension(_))
    }

    /// Stable status label surfaced alongside the message.
    pub const fn status(&self) -> &'static str {
        if self.is_client_error() {
            "invalid_request"
        } else {
            "internal_error"
        }
    }

    /// Message safe to hand back to the caller. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidSpec(_) | Self::InvalidDimension(_) => self.to_string(),
            Self::Database(e) => {
                tracing::error!(error = %e, "Database error");
                "Internal server error".to_string()
            }
            _ => {
                tracing::error!(error = %self, "Funnel query failed");
                "Internal server error".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors() {
        assert!(FunnelError::InvalidSpec("too many steps".to_string()).is_client_error());
        assert!(FunnelError::InvalidDimension("bad".to_string()).is_client_error());
        assert!(!FunnelError::CompileFailure("empty".to_string()).is_client_error());
        assert!(!FunnelError::MalformedAggregate("x".to_string()).is_client_error());
    }

    #[test]
    fn test_status() {
        assert_eq!(
            FunnelError::InvalidSpec("x".to_string()).status(),
            "invalid_request"
        );
        assert_eq!(
            FunnelError::ExecutionFailure("x".to_string()).status(),
            "internal_error"
        );
    }

    #[test]
    fn test_public_message_hides_internal_details() {
        let err = FunnelError::ExecutionFailure("connection reset at 10.0.0.3".to_string());
        assert_eq!(err.public_message(), "Internal server error");

        let err = FunnelError::InvalidSpec("at most 10 steps".to_string());
        assert_eq!(err.public_message(), "invalid funnel: at most 10 steps");
    }

    #[test]
    fn test_display() {
        let err = FunnelError::InvalidDimension("unknown property plan".to_string());
        assert_eq!(format!("{err}"), "invalid dimension: unknown property plan");
    }
}
