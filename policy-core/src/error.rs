//! Error types for traffic policy operations

use thiserror::Error;

/// Main error type for policy operations
///
/// None of these cross the per-flow hot path: `apply`, `colorize` and the
/// filter predicates degrade and log instead of failing.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Pattern compilation failed for {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("Malformed HTTP message: {reason}")]
    Codec { reason: String },

    #[error("Configuration store error: {operation} - {reason}")]
    Store { operation: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Replay failed: {details}")]
    Replay { details: String },

    #[error("Timeout occurred: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    #[error("Configuration error: {component} - {reason}")]
    Configuration { component: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PolicyError {
    /// Create a pattern compilation error
    pub fn pattern(pattern: &str, reason: impl ToString) -> Self {
        Self::Pattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a message framing error
    pub fn codec(reason: impl ToString) -> Self {
        Self::Codec {
            reason: reason.to_string(),
        }
    }

    /// Create a store error
    pub fn store(operation: &str, reason: impl ToString) -> Self {
        Self::Store {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a replay error
    pub fn replay(details: impl ToString) -> Self {
        Self::Replay {
            details: details.to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: &str, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.to_string(),
            duration_ms,
        }
    }

    /// Create a configuration error
    pub fn configuration(component: &str, reason: impl ToString) -> Self {
        Self::Configuration {
            component: component.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether a retry of the same operation could succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            PolicyError::Replay { .. } => true,
            PolicyError::Timeout { .. } => true,
            PolicyError::Io(_) => true,
            PolicyError::Store { .. } => true,

            PolicyError::Pattern { .. } => false,
            PolicyError::Codec { .. } => false,
            PolicyError::Serialization(_) => false,
            PolicyError::Configuration { .. } => false,
        }
    }
}

impl From<reqwest::Error> for PolicyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PolicyError::Timeout {
                operation: "replay".to_string(),
                duration_ms: 0,
            }
        } else {
            PolicyError::replay(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PolicyError::pattern("(abc", "unclosed group");
        assert_eq!(
            err.to_string(),
            "Pattern compilation failed for \"(abc\": unclosed group"
        );

        let err = PolicyError::timeout("replay", 1500);
        assert_eq!(err.to_string(), "Timeout occurred: replay after 1500ms");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(PolicyError::replay("connection reset").is_recoverable());
        assert!(PolicyError::store("get", "locked").is_recoverable());
        assert!(!PolicyError::codec("no header terminator").is_recoverable());
        assert!(!PolicyError::configuration("replay", "bad proxy").is_recoverable());
    }
}
