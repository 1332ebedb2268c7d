//! Operation-Level Error Type
//!
//! `FeedError` is what batching, rotation, and session operations return.
//! Construction-time failures live in their own modules (`MutationError`,
//! `ConfigError`); transport failures keep their own taxonomy and are
//! wrapped unchanged so callers can still match on status codes.

use crate::transport::TransportError;

/// Error type for feed operations (add, flush, close)
#[derive(Debug)]
pub enum FeedError {
    /// HTTP failure surfaced by the retrying transport
    Transport(TransportError),
    /// Record or envelope serialization failed
    Json(serde_json::Error),
    /// `close()` on a session that never opened, or any operation on a
    /// session that was already closed
    NoOpenSession,
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::Transport(e) => write!(f, "Transport error: {}", e),
            FeedError::Json(e) => write!(f, "Serialization error: {}", e),
            FeedError::NoOpenSession => write!(f, "No open stream session"),
        }
    }
}

impl std::error::Error for FeedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FeedError::Transport(e) => Some(e),
            FeedError::Json(e) => Some(e),
            FeedError::NoOpenSession => None,
        }
    }
}

impl From<TransportError> for FeedError {
    fn from(e: TransportError) -> Self {
        FeedError::Transport(e)
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Json(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_wraps_unchanged() {
        let err: FeedError = TransportError::Status {
            status: 403,
            body: "forbidden".to_string(),
        }
        .into();

        match err {
            FeedError::Transport(TransportError::Status { status, body }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "forbidden");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_source_exposes_wrapped_error() {
        use std::error::Error as _;

        let err = FeedError::Transport(TransportError::Status {
            status: 500,
            body: "boom".to_string(),
        });
        assert!(err.source().unwrap().is::<TransportError>());

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = FeedError::Json(json_err);
        assert!(err.source().unwrap().is::<serde_json::Error>());

        assert!(FeedError::NoOpenSession.source().is_none());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            FeedError::NoOpenSession.to_string(),
            "No open stream session"
        );

        let err = FeedError::Transport(TransportError::Status {
            status: 500,
            body: "boom".to_string(),
        });
        assert!(err.to_string().contains("500"));
    }
}
