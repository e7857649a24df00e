//! Error types for twinport.
//!
//! Errors fall into three groups by where they surface: startup errors
//! (`Bind`, `Config`) escalate to the process, per-request errors
//! (`RequestDecode`, `RouteNotFound`, `Upstream`) go back to the caller of
//! that request, and shutdown errors (`ShutdownTimeout`) are only logged.

use crate::rpc::{Code, RpcStatus};
use axum::http::StatusCode;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Main error type for twinport.
#[derive(Debug, Error)]
pub enum TwinportError {
    // Startup errors
    #[error("Failed to bind {protocol} listener on {addr}: {source}")]
    Bind {
        protocol: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // Request errors
    #[error("Bad request: {message}")]
    RequestDecode { message: String },

    #[error("Not Found: no route for {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("{0}")]
    Upstream(#[from] RpcStatus),

    // Shutdown errors
    #[error("{component} did not stop within {timeout:?}")]
    ShutdownTimeout {
        component: String,
        timeout: Duration,
    },

    // Plumbing
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Invalid frame: {message}")]
    Frame { message: String },

    #[error("Protobuf decode error: {0}")]
    Codec(#[from] prost::DecodeError),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for twinport operations.
pub type Result<T> = std::result::Result<T, TwinportError>;

impl From<serde_json::Error> for TwinportError {
    fn from(err: serde_json::Error) -> Self {
        TwinportError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl TwinportError {
    /// Create a request decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        TwinportError::RequestDecode {
            message: message.into(),
        }
    }

    /// RPC code describing this error, as reported in gateway error bodies.
    pub fn rpc_code(&self) -> Code {
        match self {
            TwinportError::RequestDecode { .. } | TwinportError::Codec(_) => Code::InvalidArgument,
            TwinportError::RouteNotFound { .. } => Code::NotFound,
            TwinportError::Upstream(status) => status.code,
            TwinportError::ShutdownTimeout { .. } => Code::DeadlineExceeded,
            TwinportError::Bind { .. } | TwinportError::Io(_) | TwinportError::Frame { .. } => {
                Code::Unavailable
            }
            _ => Code::Internal,
        }
    }

    /// Convert to the HTTP status returned by the gateway.
    pub fn to_http_status(&self) -> StatusCode {
        self.rpc_code().http_status()
    }

    /// Message placed in the gateway error body.
    ///
    /// Upstream errors carry the upstream message verbatim; everything else
    /// uses its display form.
    pub fn client_message(&self) -> String {
        match self {
            TwinportError::Upstream(status) => status.message.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_per_category() {
        assert_eq!(
            TwinportError::decode("bad json").to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TwinportError::RouteNotFound {
                method: "GET".into(),
                path: "/v1/unknown".into()
            }
            .to_http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            TwinportError::Upstream(RpcStatus::unavailable("down")).to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            TwinportError::Other("boom".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_upstream_message_is_passed_through() {
        let err = TwinportError::from(RpcStatus::internal("handler exploded"));
        assert_eq!(err.client_message(), "handler exploded");
    }

    #[test]
    fn test_json_error_conversion() {
        let err: TwinportError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, TwinportError::Json { .. }));
    }
}
