use thiserror::Error;

/// Failure taxonomy shared by the certificate, gateway and processing crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NfeError {
    #[error("certificate unavailable: {0}")]
    CertificateUnavailable(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("validation failed: {}", .0.join(", "))]
    ValidationFailed(Vec<String>),

    #[error("authority unavailable: {0}")]
    AuthorityUnavailable(String),

    #[error("authority rejected the document ({code}): {message}")]
    AuthorityRejected { code: u16, message: String },

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

pub type NfeResult<T> = Result<T, NfeError>;

impl From<anyhow::Error> for NfeError {
    fn from(err: anyhow::Error) -> Self {
        NfeError::InternalError(format!("{err:#}"))
    }
}
