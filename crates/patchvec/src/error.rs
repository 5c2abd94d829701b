use serde_json::json;
use thiserror::Error;

/// Structured engine error with a stable code taxonomy.
///
/// Every public facade operation raises this type; transports map `code()`
/// to their own envelope (`http_status()` for HTTP, `exit_code()` for the
/// CLI) without inspecting variants.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),

    #[error("payload too large: {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("embedding model mismatch: index was built with '{stored}', configured model is '{configured}'")]
    ModelMismatch { stored: String, configured: String },

    #[error("legacy metadata layout: {0}")]
    LegacyMetadata(String),

    #[error("collection unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable code, independent of the display message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidFilter(_) => "invalid_filter",
            Self::UnsupportedMedia(_) => "unsupported_media",
            Self::TooLarge { .. } => "too_large",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Overloaded(_) => "overloaded",
            Self::Timeout(_) => "timeout",
            Self::ModelMismatch { .. } => "model_mismatch",
            Self::LegacyMetadata(_) => "legacy_metadata",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status for the transport collaborator.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::AlreadyExists(_) => 409,
            Self::InvalidRequest(_) => 400,
            Self::InvalidFilter(_) => 400,
            Self::UnsupportedMedia(_) => 415,
            Self::TooLarge { .. } => 413,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::Overloaded(_) => 503,
            Self::Timeout(_) => 504,
            Self::ModelMismatch { .. } => 409,
            Self::LegacyMetadata(_) => 409,
            Self::Unavailable(_) => 503,
            Self::Internal(_) => 500,
        }
    }

    /// Process exit code for the CLI collaborator.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound(_) => 3,
            Self::InvalidRequest(_) | Self::InvalidFilter(_) => 4,
            Self::UnsupportedMedia(_) | Self::TooLarge { .. } => 4,
            Self::Unauthorized(_) | Self::Forbidden(_) => 5,
            Self::Overloaded(_) => 6,
            _ => 1,
        }
    }

    /// Error envelope rendered by transports.
    pub fn to_envelope(&self) -> serde_json::Value {
        json!({
            "ok": false,
            "code": self.code(),
            "error": self.to_string(),
        })
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
