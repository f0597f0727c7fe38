use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Marker carried in the message of every script-callback reachability failure.
pub const NOT_ACCESSIBLE_MARKER: &str = "Not Accessible JSONP";

/// Message used when a failed envelope carries no usable error message.
const DEFAULT_APP_ERROR_MESSAGE: &str = "request failed";

/// Errors delivered to rejection handlers and `reject` listeners.
///
/// Every variant except [`FetchError::Programming`] is eligible for retry up to
/// the endpoint's `retry` budget. The type is cheap to clone so that one
/// settlement can be handed to several listener scopes.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FetchError {
    /// Connection-level failure (refused, reset, DNS, unreadable body); no status available
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    /// Non-2xx response from the standard transport
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Local per-attempt timer fired before the transport settled
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The script-callback transport could not reach the URL
    #[error("Not Accessible JSONP: {url}")]
    NotAccessible { url: String },

    /// The normalized envelope signaled failure
    #[error("{message}")]
    App {
        /// Backend-provided error code, if any
        code: Option<Value>,
        message: String,
        /// The raw `error` payload of the envelope
        detail: Value,
    },

    /// A hook failed or returned a malformed shape; never retried
    #[error("Hook failed: {0}")]
    Programming(String),
}

impl FetchError {
    /// Build a transport error preserving its source.
    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        FetchError::Transport {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Build a transport error without an underlying source.
    pub fn transport_msg(message: impl Into<String>) -> Self {
        FetchError::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Build an application error from the `error` member of a failed envelope.
    ///
    /// Accepts `{ "code": .., "message": ".." }`, a bare string message, or anything
    /// else (kept verbatim in `detail`).
    #[must_use]
    pub fn from_envelope_error(error: Value) -> Self {
        let (code, message) = match &error {
            Value::Object(map) => (
                map.get("code").filter(|c| !c.is_null()).cloned(),
                map.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_APP_ERROR_MESSAGE)
                    .to_owned(),
            ),
            Value::String(s) => (None, s.clone()),
            _ => (None, DEFAULT_APP_ERROR_MESSAGE.to_owned()),
        };
        FetchError::App {
            code,
            message,
            detail: error,
        }
    }

    /// Human-readable message, always present.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            FetchError::App { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// HTTP status, present only for [`FetchError::Status`].
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the failure was produced by the per-attempt timer.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout(_))
    }

    /// Backend error code carried by an application error.
    #[must_use]
    pub fn code(&self) -> Option<&Value> {
        match self {
            FetchError::App { code, .. } => code.as_ref(),
            _ => None,
        }
    }

    /// Whether the retry controller may spend budget on this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Programming(_))
    }
}

/// Errors raised while declaring contexts and API groups.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DeclareError {
    /// The context already holds an API group with this name
    #[error("API group '{0}' is already declared in this context")]
    DuplicateGroup(String),

    /// Configuration could not be extracted from a figment
    #[error("Failed to extract fetch configuration: {0}")]
    Config(#[from] Box<figment::Error>),
}
