//! Result of a connectivity check

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of `check`: whether the source is reachable with the given
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    /// Whether the check succeeded
    pub succeeded: bool,
    /// Failure detail, absent on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckResult {
    /// Create a successful check result
    pub fn success() -> Self {
        Self {
            succeeded: true,
            message: None,
        }
    }

    /// Create a failed check result
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            message: Some(message.into()),
        }
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.succeeded {
            write!(f, "connection check passed")
        } else {
            write!(
                f,
                "connection check failed: {}",
                self.message.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_result() {
        let ok = CheckResult::success();
        assert!(ok.succeeded);
        assert!(ok.message.is_none());

        let failed = CheckResult::failure("connection refused");
        assert!(!failed.succeeded);
        assert!(failed.to_string().contains("connection refused"));
    }

    #[test]
    fn test_check_result_serialization() {
        let line = serde_json::to_string(&CheckResult::success()).unwrap();
        assert_eq!(line, r#"{"succeeded":true}"#);
    }
}
