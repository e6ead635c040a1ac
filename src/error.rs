//! Error types for edgewall.
//!
//! Only conditions a caller has to tell apart live here. Plumbing errors
//! travel as `anyhow::Error` with context attached.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Network failure, timeout or non-2xx answer from the address-list endpoint.
    #[error("Address source unavailable: {0}")]
    SourceUnavailable(String),

    /// Nothing usable came out of the payload, even after every fallback.
    #[error("No valid prefixes in address list ({dropped} malformed entries dropped)")]
    EmptyResultSet { dropped: usize },

    /// Every match form for one prefix was rejected by the backend.
    #[error("Backend rejected rule for {prefix} on port {port}: {reason}")]
    BackendInsertion {
        prefix: String,
        port: u16,
        reason: String,
    },

    #[error("Firewall error: {0}")]
    Backend(String),

    #[error("Rule persistence failed: {0}")]
    Persistence(String),

    #[error("Permission denied: {0}")]
    Privilege(String),

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("State file error: {0}")]
    State(String),
}

impl SyncError {
    /// Whether the current sync cycle has to stop.
    ///
    /// Only the conditions below leave rules untouched and abort; everything
    /// else is reported as a degradation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::EmptyResultSet { .. }
                | SyncError::Backend(_)
                | SyncError::Privilege(_)
                | SyncError::MissingDependency(_)
                | SyncError::InvalidArgument(_)
                | SyncError::Config(_)
                | SyncError::State(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degradations_are_not_fatal() {
        assert!(!SyncError::SourceUnavailable("timeout".into()).is_fatal());
        assert!(!SyncError::Persistence("no strategy".into()).is_fatal());
        assert!(!SyncError::BackendInsertion {
            prefix: "192.0.2.0/24".into(),
            port: 80,
            reason: "rejected".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_empty_result_set_is_fatal() {
        let err = SyncError::EmptyResultSet { dropped: 3 };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("3 malformed"));
    }
}
