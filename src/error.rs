//! Error types and the provider-to-user error mapping

use std::fmt;
use std::time::Duration;

use redis::RedisError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

/// Document store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error reported by the storage provider with its own code
    #[error("{message}")]
    Provider { code: String, message: String },

    #[error("Invalid document path: {0}")]
    InvalidPath(String),
}

impl StoreError {
    pub fn provider(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Provider-style error code (`unavailable`, `permission-denied`, ...)
    pub fn code(&self) -> &str {
        match self {
            Self::Redis(e) if e.is_timeout() => "deadline-exceeded",
            Self::Redis(e)
                if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() =>
            {
                "unavailable"
            }
            Self::Redis(_) => "unknown",
            Self::Serialization(_) => "data-loss",
            Self::Provider { code, .. } => code.as_str(),
            Self::InvalidPath(_) => "invalid-argument",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.code(),
            "unavailable" | "deadline-exceeded" | "resource-exhausted" | "aborted"
        )
    }
}

/// Failure of an underlying HTTP or document-store call, before mapping
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}")]
    Status {
        status: u16,
        code: Option<String>,
        message: Option<String>,
        details: Option<Value>,
    },

    #[error("Document {collection}/{id} does not exist")]
    MissingDocument { collection: String, id: String },

    #[error("Upstream call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl UpstreamError {
    /// Provider error code, if one can be derived
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            Self::Store(e) => Some(e.code()),
            Self::Http(e) if e.is_timeout() => Some("deadline-exceeded"),
            Self::Http(e) if e.is_connect() => Some("unavailable"),
            Self::Http(_) => None,
            Self::Status { code: Some(code), .. } => Some(code.as_str()),
            Self::Status { status, .. } => match status {
                401 => Some("unauthenticated"),
                403 => Some("permission-denied"),
                404 => Some("not-found"),
                _ => None,
            },
            Self::MissingDocument { .. } => Some("not-found"),
            Self::Timeout(_) => Some("deadline-exceeded"),
            Self::Decode(_) | Self::InvalidUrl(_) => None,
        }
    }

    /// Provider message, if the provider supplied one
    pub fn provider_message(&self) -> Option<String> {
        match self {
            Self::Status { message, .. } => message.clone(),
            Self::Store(StoreError::Provider { message, .. }) => Some(message.clone()),
            Self::MissingDocument { .. } => Some("Documento não encontrado".to_owned()),
            other => Some(other.to_string()),
        }
    }

    pub fn details(&self) -> Option<&Value> {
        match self {
            Self::Status { details, .. } => details.as_ref(),
            _ => None,
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Timeout(_) => true,
            Self::MissingDocument { .. } | Self::Decode(_) | Self::InvalidUrl(_) => false,
        }
    }
}

/// Closed set of error codes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    PermissionDenied,
    NotFound,
    Unauthenticated,
    Unknown,
}

impl ErrorCode {
    pub fn from_provider(code: &str) -> Self {
        match code {
            "permission-denied" => Self::PermissionDenied,
            "not-found" => Self::NotFound,
            "unauthenticated" => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission-denied",
            Self::NotFound => "not-found",
            Self::Unauthenticated => "unauthenticated",
            Self::Unknown => "unknown",
        }
    }

    /// User-facing message for codes with a fixed translation
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            Self::PermissionDenied => Some("Você não tem acesso a este recurso"),
            Self::NotFound => Some("Recurso não encontrado"),
            Self::Unauthenticated => Some("Autenticação necessária"),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) const GENERIC_MESSAGE: &str = "Erro desconhecido";

/// The only error the gateway raises
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
    /// Original failure. `None` for callers that waited on a coalesced fetch.
    #[source]
    pub cause: Option<UpstreamError>,
}

impl RequestError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            cause: None,
        }
    }

    /// Map an upstream failure, keeping it untouched as `cause`.
    pub fn from_upstream(err: UpstreamError, context: &str) -> Self {
        error!("[API Error] {}: {}", context, err);

        let code = err
            .provider_code()
            .map(ErrorCode::from_provider)
            .unwrap_or(ErrorCode::Unknown);
        let message = match code.user_message() {
            Some(msg) => msg.to_owned(),
            None => err
                .provider_message()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| GENERIC_MESSAGE.to_owned()),
        };

        Self {
            code,
            message,
            details: err.details().cloned(),
            cause: Some(err),
        }
    }
}
