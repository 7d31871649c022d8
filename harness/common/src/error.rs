use std::fmt::Display;
use stomp_client::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Bad flags or environment, detected before any message flows.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("could not resolve destination: {0}")]
    Resolution(String),

    /// A send, receive, acknowledge or connect call failed at the broker.
    #[error(transparent)]
    Protocol(#[from] ClientError),
}

impl HarnessError {
    pub fn configuration(reason: impl Display) -> Self {
        HarnessError::Configuration(reason.to_string())
    }

    /// Process exit code for a command that failed with this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            HarnessError::Configuration(_) => 2,
            HarnessError::Resolution(_) => 3,
            HarnessError::Protocol(_) => 4,
        }
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
