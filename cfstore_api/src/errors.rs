//! Error types for the store client.

/// SQLSTATE codes for lock contention (deadlock, serialization failure).
/// PostgREST surfaces them in the JSON error body, usually with a 5xx but
/// occasionally with 409.
const CONTENTION_CODES: &[&str] = &["40P01", "40001"];

/// Errors that can occur when talking to the REST store.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The request never produced a response (connect failure, reset, timeout).
    #[error("Request failed: {0}")]
    RequestFailed(String),
    /// The store returned a non-success status with a body snippet.
    #[error("Request failed with status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    /// A success response whose body could not be decoded.
    #[error("Failed to parse response: {0}")]
    ParseFailed(String),
    /// The base URL or table name did not form a valid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::RequestFailed(format!("timed out: {}", e))
        } else {
            Self::RequestFailed(e.to_string())
        }
    }
}

impl Error {
    /// HTTP status of the failed response, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the body carries a deadlock or serialization-failure code.
    pub fn is_contention(&self) -> bool {
        match self {
            Self::HttpStatus { body, .. } => CONTENTION_CODES.iter().any(|c| body.contains(c)),
            _ => false,
        }
    }

    /// True for `414 URI Too Long`, raised when an `in.(...)` filter is too wide.
    pub fn is_uri_too_long(&self) -> bool {
        self.status() == Some(414)
    }

    /// Transient failures: no response at all, any 5xx, or lock contention.
    /// Every other 4xx is a client error that a retry cannot fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestFailed(_) => true,
            Self::HttpStatus { status, .. } => *status >= 500 || self.is_contention(),
            Self::ParseFailed(_) | Self::InvalidUrl(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16, body: &str) -> Error {
        Error::HttpStatus {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(status(500, "oops").is_retryable());
        assert!(status(503, "").is_retryable());
    }

    #[test]
    fn validation_errors_are_terminal() {
        assert!(!status(400, "bad").is_retryable());
        assert!(!status(422, "unprocessable").is_retryable());
        assert!(!status(404, "").is_retryable());
    }

    #[test]
    fn deadlock_code_is_retryable_even_on_4xx() {
        let err = status(409, r#"{"code":"40P01","message":"deadlock detected"}"#);
        assert!(err.is_contention());
        assert!(err.is_retryable());
    }

    #[test]
    fn serialization_failure_is_contention() {
        let err = status(500, r#"{"code":"40001"}"#);
        assert!(err.is_contention());
    }

    #[test]
    fn uri_too_long_detected() {
        let err = status(414, "");
        assert!(err.is_uri_too_long());
        assert!(!err.is_retryable());
    }

    #[test]
    fn request_failures_are_retryable() {
        assert!(Error::RequestFailed("connection reset".into()).is_retryable());
        assert!(!Error::ParseFailed("eof".into()).is_retryable());
    }
}
