use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by the core. The API layer decides how each maps onto
/// the response envelope; messages for credential failures are constant so
/// responses do not leak which check failed.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("not authorized")]
    NotAuthorized,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("out of sync")]
    OutOfSync,
    #[error("decrypt failed")]
    DecryptFailed,
    /// Carries the assertion options the client needs to retry with MFA.
    #[error("multi-factor authentication required")]
    MfaRequired(Value),
    #[error("timeout")]
    Timeout,
    #[error("bad request")]
    BadRequest,
    #[error("not found")]
    NotFound,
    #[error("email already in use")]
    EmailTaken,
    /// A permission rejection with a client-facing message.
    #[error("{0}")]
    Denied(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
    #[error(transparent)]
    Hyper(#[from] hyper::Error),
    #[error(transparent)]
    Bcrypt(#[from] bcrypt::BcryptError),
    #[error(transparent)]
    Argon(#[from] argon2::Error),
    #[error(transparent)]
    Multipart(#[from] multer::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    /// True for failures whose details must not reach the client.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ServerError::Io(_)
                | ServerError::Bincode(_)
                | ServerError::Hyper(_)
                | ServerError::Bcrypt(_)
                | ServerError::Argon(_)
        )
    }
}
