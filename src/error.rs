use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Stable machine-readable code for API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Unauthorized(_) => "unauthorized",
            Error::InvalidState(_) => "invalid_state",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Precondition(_) => "precondition_failed",
            Error::ExternalService(_) => "external_service",
            Error::Storage(_) => "storage",
        }
    }

    /// True when the instance was left untouched by a transient failure and the
    /// same request may simply be sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ExternalService(_) | Error::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
