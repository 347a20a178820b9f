use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Login was refused, a verification code was rejected, or the session expired.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// Errors that make every following call pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Auth(_))
    }
}
