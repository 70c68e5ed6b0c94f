use thiserror::Error;

/// Common error type shared by every vows crate
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generic error: {0}")]
    Generic(String),
}

impl From<String> for CommonError {
    fn from(s: String) -> Self {
        CommonError::Generic(s)
    }
}

impl From<&str> for CommonError {
    fn from(s: &str) -> Self {
        CommonError::Generic(s.to_string())
    }
}

/// Result alias used across the vows crates
pub type CommonResult<T> = Result<T, CommonError>;
