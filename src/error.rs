#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("comic unavailable: {0}")]
    Resolution(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("storage failure: {0:#}")]
    Storage(#[source] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Storage(err)
    }
}
