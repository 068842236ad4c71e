use std::time::Duration;

use thiserror::Error;

/// Categorized failure of a scheduled request.
///
/// `Clone` so one in-flight result can be handed to every deduplicated caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("Circuit open for {endpoint} - failing fast")]
    CircuitOpen { endpoint: String },

    #[error("Client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request cancelled")]
    Cancelled,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl RequestError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status {
            400..=499 => RequestError::Client {
                status,
                message: truncated,
            },
            500..=599 => RequestError::Server {
                status,
                message: truncated,
            },
            _ => RequestError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RequestError::Network(_) | RequestError::Timeout(_) | RequestError::Server { .. }
        )
    }

    /// Whether this outcome counts against the endpoint's circuit breaker.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, RequestError::CircuitOpen { .. } | RequestError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_categorizes() {
        assert!(matches!(
            RequestError::from_status(404, "missing"),
            RequestError::Client { status: 404, .. }
        ));
        assert!(matches!(
            RequestError::from_status(503, "busy"),
            RequestError::Server { status: 503, .. }
        ));
        assert!(matches!(
            RequestError::from_status(302, ""),
            RequestError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_retry_and_failure_classification() {
        let client = RequestError::from_status(400, "bad");
        assert!(!client.is_retryable());
        assert!(client.counts_as_failure());

        let server = RequestError::from_status(500, "oops");
        assert!(server.is_retryable());
        assert!(server.counts_as_failure());

        assert!(RequestError::Network("reset".into()).is_retryable());
        assert!(RequestError::Timeout(Duration::from_secs(1)).is_retryable());

        let open = RequestError::CircuitOpen {
            endpoint: "/x".into(),
        };
        assert!(!open.is_retryable());
        assert!(!open.counts_as_failure());
        assert!(!RequestError::Cancelled.counts_as_failure());
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "é".repeat(400);
        match RequestError::from_status(500, &body) {
            RequestError::Server { message, .. } => {
                assert!(message.contains("truncated, 800 total bytes"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
