//! Map gateway responses onto Retryable / Permanent send errors.

use reqwest::StatusCode;
use unveil_core::types::{SendError, SendErrorKind};

/// Classify a non-success HTTP status.
pub fn classify_status(status: StatusCode) -> SendErrorKind {
    if status == StatusCode::TOO_MANY_REQUESTS {
        SendErrorKind::RateLimited
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        SendErrorKind::Timeout
    } else if status.is_server_error() {
        SendErrorKind::ServerError
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        // Unknown or unregistered address.
        SendErrorKind::InvalidAddress
    } else {
        SendErrorKind::ClientError
    }
}

/// Classify a transport-level failure (no HTTP response).
pub fn classify_request_error(err: &reqwest::Error) -> SendError {
    if err.is_timeout() {
        SendError::new(SendErrorKind::Timeout, format!("request timed out: {err}"))
    } else if err.is_connect() || err.is_request() {
        SendError::new(SendErrorKind::Network, format!("connection failed: {err}"))
    } else if err.is_builder() {
        SendError::new(SendErrorKind::ClientError, format!("invalid request: {err}"))
    } else {
        SendError::new(SendErrorKind::Network, err.to_string())
    }
}

/// Build the error for a failed HTTP exchange from its status and body.
pub fn error_from_response(gateway: &str, status: StatusCode, body: &str) -> SendError {
    let kind = classify_status(status);
    let snippet: String = body.chars().take(200).collect();
    SendError::new(kind, format!("{gateway} error {status}: {snippet}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use unveil_core::types::ErrorClass;

    #[test]
    fn test_status_classes() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS).class(), ErrorClass::Retryable);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR).class(), ErrorClass::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY).class(), ErrorClass::Retryable);
        assert_eq!(classify_status(StatusCode::GATEWAY_TIMEOUT), SendErrorKind::Timeout);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST).class(), ErrorClass::Permanent);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED).class(), ErrorClass::Permanent);
        assert_eq!(classify_status(StatusCode::GONE), SendErrorKind::InvalidAddress);
    }

    #[test]
    fn test_error_from_response_truncates() {
        let body = "x".repeat(1000);
        let err = error_from_response("push", StatusCode::BAD_REQUEST, &body);
        assert_eq!(err.kind, SendErrorKind::ClientError);
        assert!(err.detail.len() < 300);
    }
}
