//! Error types for ragchat

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for ragchat operations
#[derive(Error, Debug)]
pub enum Error {
    /// Request/response call failed (network or non-2xx status)
    #[error("Transport error{}: {body}", status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Transport {
        /// HTTP status, absent when the request never got a response
        status: Option<u16>,
        /// Response body or the underlying failure
        body: String,
    },

    /// Event connection is down or erroring
    #[error("Connection error: {0}")]
    Connection(String),

    /// Session create/validate failed
    #[error("Session error: {0}")]
    Session(String),

    /// Backend-reported failure mid-stream
    #[error("Stream error: {message}")]
    Stream {
        message: String,
        detail: Option<String>,
    },

    /// A send or command was refused locally
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A specialized Result type for ragchat operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Build a transport error from a status and body
    pub fn transport(status: Option<u16>, body: impl Into<String>) -> Self {
        Error::Transport {
            status,
            body: body.into(),
        }
    }

    /// Message suitable for showing to the user once
    pub fn user_message(&self) -> String {
        match self {
            Error::Transport { body, .. } => extract_api_error(body).unwrap_or_else(|| body.clone()),
            Error::Connection(msg) | Error::Session(msg) | Error::Rejected(msg) => msg.clone(),
            Error::Stream { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Convert into the transient error record surfaced by the engine
    pub fn to_info(&self) -> ErrorInfo {
        let detail = match self {
            Error::Stream { detail, .. } => detail.clone(),
            Error::Transport { status, body } => Some(match status {
                Some(s) => format!("status {}: {}", s, body),
                None => body.clone(),
            }),
            _ => None,
        };
        ErrorInfo {
            message: self.user_message(),
            detail,
        }
    }
}

/// Pull `error`/`message` out of a backend JSON error body
fn extract_api_error(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .or_else(|| value.get("message"))
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
}

/// Transient, user-visible error. Surfaced once and cleared on the next
/// successful operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_prefers_backend_message() {
        let err = Error::transport(Some(400), r#"{"error":"Message is required"}"#);
        assert_eq!(err.user_message(), "Message is required");
        assert_eq!(
            err.to_info().detail.as_deref(),
            Some(r#"status 400: {"error":"Message is required"}"#)
        );
    }

    #[test]
    fn test_transport_error_display() {
        let err = Error::transport(None, "connection refused");
        assert_eq!(err.to_string(), "Transport error: connection refused");
        let err = Error::transport(Some(503), "unavailable");
        assert_eq!(err.to_string(), "Transport error (503): unavailable");
    }

    #[test]
    fn test_stream_error_keeps_detail() {
        let err = Error::Stream {
            message: "Generation failed".to_string(),
            detail: Some("model timeout".to_string()),
        };
        let info = err.to_info();
        assert_eq!(info.message, "Generation failed");
        assert_eq!(info.detail.as_deref(), Some("model timeout"));
    }
}
