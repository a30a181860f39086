use crate::config::ServiceKey;
use std::fmt;

/// Failure of a single guarded dependency call
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    /// Malformed input caught before any network call. Never retried.
    Validation(String),
    /// Network failure, 5xx or timeout. Retried, then counted by the breaker.
    Transient(String),
    /// Dependency failure that retrying cannot fix (4xx, broken stream after output)
    Permanent(String),
    /// Breaker for the service is open; the dependency was not invoked
    CircuitOpen(ServiceKey),
    /// The caller went away (e.g. closed its chat receiver)
    Cancelled,
}

impl CallError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CallError::Transient(_))
    }

    /// Whether the breaker should count this as a dependency failure
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, CallError::Transient(_) | CallError::Permanent(_))
    }

    /// Classify a non-success HTTP status: 5xx and 429 are transient
    pub fn from_status(service: &str, status: u16, body: &str) -> Self {
        let msg = format!("{} API error: {} {}", service, status, body.trim());
        if status >= 500 || status == 429 {
            CallError::Transient(msg)
        } else {
            CallError::Permanent(msg)
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Validation(msg) => write!(f, "Validation error: {}", msg),
            CallError::Transient(msg) => write!(f, "Transient error: {}", msg),
            CallError::Permanent(msg) => write!(f, "Dependency error: {}", msg),
            CallError::CircuitOpen(key) => write!(f, "{} service temporarily unavailable (circuit open)", key),
            CallError::Cancelled => write!(f, "Call cancelled by caller"),
        }
    }
}

impl std::error::Error for CallError {}

impl From<reqwest::Error> for CallError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return CallError::Transient(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                CallError::Transient(err.to_string())
            }
            Some(_) => CallError::Permanent(err.to_string()),
            None => CallError::Transient(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(CallError::Transient("503".into()).is_retryable());
        assert!(!CallError::Validation("missing".into()).is_retryable());
        assert!(!CallError::Permanent("400".into()).is_retryable());
        assert!(!CallError::Cancelled.is_retryable());

        assert!(CallError::Permanent("400".into()).counts_against_breaker());
        assert!(!CallError::Validation("missing".into()).counts_against_breaker());
        assert!(!CallError::Cancelled.counts_against_breaker());
        assert!(!CallError::CircuitOpen(ServiceKey::Ocr).counts_against_breaker());
    }

    #[test]
    fn test_status_classification() {
        assert!(CallError::from_status("OCR", 500, "boom").is_retryable());
        assert!(CallError::from_status("OCR", 429, "").is_retryable());
        assert_eq!(
            CallError::from_status("OCR", 401, "nope\n"),
            CallError::Permanent("OCR API error: 401 nope".to_string())
        );
    }
}
