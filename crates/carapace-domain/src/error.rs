use serde::{Deserialize, Serialize};

/// Closed wire-facing error taxonomy. None of these may be "unknown" — the
/// enum is exhaustive by design, not by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationFailed,
    UnknownTool,
    RateLimited,
    ConfirmationRequired,
    PluginTimeout,
    PluginError,
    InternalError,
}

impl ErrorCode {
    /// Whether a client may usefully retry after this error.
    pub fn retriable(self) -> bool {
        matches!(self, ErrorCode::RateLimited | ErrorCode::PluginTimeout | ErrorCode::InternalError)
    }
}

/// The error shape carried on `ResponseEnvelope.payload.error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub retriable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retriable: code.retriable(),
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }
}

/// Internal/plumbing errors. Never serialized directly to the wire — every
/// router exit path converts a `CoreError` to an `ErrorPayload` through
/// [`CoreError::into_payload`], which is the single seam that keeps the wire
/// taxonomy closed.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("size/shape limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("wire-format isolation failure: {0}")]
    WireFormat(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("schema validation failed at {path}: {message}")]
    SchemaValidation { path: String, message: String },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("confirmation required for correlation {0}")]
    ConfirmationRequired(String),

    #[error("plugin call timed out after {0:?}")]
    PluginTimeout(std::time::Duration),

    /// A handler's own `{ok:false, error}` result or an uncaught panic from
    /// `handle_tool_invocation`. `retriable` is handler-chosen, per spec.md
    /// §7's "varies (Handler-chosen)" — unlike every other variant here, the
    /// wire `retriable` flag cannot be derived from the error code alone.
    #[error("plugin error: {message}")]
    PluginError { message: String, retriable: bool },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Construct a handler-chosen `PLUGIN_ERROR`. Handlers call this from
    /// `handle_tool_invocation` rather than building `CoreError::PluginError`
    /// directly, since the field order reads less clearly at the call site.
    pub fn plugin_error(message: impl Into<String>, retriable: bool) -> Self {
        CoreError::PluginError {
            message: message.into(),
            retriable,
        }
    }

    /// The single conversion seam from internal errors to the wire
    /// taxonomy. Every stage of the router pipeline must exit through this
    /// function rather than constructing an `ErrorPayload` ad hoc.
    pub fn into_payload(self) -> ErrorPayload {
        match self {
            CoreError::LimitExceeded(msg) | CoreError::WireFormat(msg) => {
                ErrorPayload::new(ErrorCode::ValidationFailed, msg)
            }
            CoreError::SchemaValidation { path, message } => {
                ErrorPayload::new(ErrorCode::ValidationFailed, format!("{path}: {message}"))
            }
            CoreError::UnknownTool(msg) => ErrorPayload::new(ErrorCode::UnknownTool, msg),
            CoreError::RateLimited { retry_after_secs } => {
                ErrorPayload::new(ErrorCode::RateLimited, "rate limit exceeded").with_retry_after(retry_after_secs)
            }
            CoreError::ConfirmationRequired(correlation) => ErrorPayload::new(
                ErrorCode::ConfirmationRequired,
                format!("approval required for correlation {correlation}"),
            ),
            CoreError::PluginTimeout(d) => {
                ErrorPayload::new(ErrorCode::PluginTimeout, format!("handler exceeded {d:?} deadline"))
            }
            CoreError::PluginError { message, retriable } => {
                let mut payload = ErrorPayload::new(ErrorCode::PluginError, message);
                payload.retriable = retriable;
                payload
            }
            CoreError::Io(e) => ErrorPayload::new(ErrorCode::InternalError, e.to_string()),
            CoreError::Json(e) => ErrorPayload::new(ErrorCode::InternalError, e.to_string()),
            CoreError::Internal(msg) => ErrorPayload::new(ErrorCode::InternalError, msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
