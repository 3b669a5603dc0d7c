use thiserror::Error;

pub type Result<T> = std::result::Result<T, TelematicsError>;

/// Errors surfaced by the scoring pipeline and the HTTP layer.
#[derive(Debug, Error)]
pub enum TelematicsError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl TelematicsError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<anyhow::Error> for TelematicsError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}
