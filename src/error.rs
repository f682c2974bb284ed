use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Rule compile error in '{rule}': {reason}")]
    RuleCompileError { rule: String, reason: String },

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Resource not found: {0}")]
    NotFoundError(String),

    #[error("Authorization error: {0}")]
    AuthorizationError(String),

    #[error("Notification error ({status:?}): {message}")]
    NotificationError { status: Option<u16>, message: String },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

// Helper functions for creating specific errors
impl PipelineError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        PipelineError::ConfigError(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        PipelineError::ValidationError(msg.into())
    }

    pub fn rule_compile<R: Into<String>, S: Into<String>>(rule: R, reason: S) -> Self {
        PipelineError::RuleCompileError { rule: rule.into(), reason: reason.into() }
    }

    pub fn parsing<S: Into<String>>(msg: S) -> Self {
        PipelineError::ParsingError(msg.into())
    }

    pub fn storage<S: Into<String>>(msg: S) -> Self {
        PipelineError::StorageError(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        PipelineError::NotFoundError(msg.into())
    }

    pub fn authorization<S: Into<String>>(msg: S) -> Self {
        PipelineError::AuthorizationError(msg.into())
    }

    pub fn notification<S: Into<String>>(status: Option<u16>, msg: S) -> Self {
        PipelineError::NotificationError { status, message: msg.into() }
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        PipelineError::TimeoutError(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        PipelineError::InternalError(msg.into())
    }

    /// Whether a retry of the same operation may succeed.
    ///
    /// Server-side HTTP failures, throttling, timeouts, connection problems and
    /// store unavailability are transient; client errors (4xx other than 408
    /// and 429) and validation problems are not.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::NotificationError { status: Some(code), .. } => {
                *code >= 500 || *code == 429 || *code == 408
            }
            PipelineError::NotificationError { status: None, .. } => true,
            PipelineError::HttpError(e) => {
                if let Some(status) = e.status() {
                    status.is_server_error() || status.as_u16() == 429 || status.as_u16() == 408
                } else {
                    e.is_timeout() || e.is_connect() || e.is_request()
                }
            }
            PipelineError::TimeoutError(_) | PipelineError::StorageError(_) | PipelineError::IoError(_) => true,
            _ => false,
        }
    }
}
