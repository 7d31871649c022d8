use std::env;
use thiserror::Error;

use crate::frame::FrameError;

/// Everything that can go wrong between the harness and the broker.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid broker uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("{source}. Please provide a value for {var}")]
    EnvVar { var: String, source: env::VarError },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),

    /// An ERROR frame sent by the broker.
    #[error("broker error: {message}")]
    Broker { message: String, details: String },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("unexpected {0} frame")]
    UnexpectedFrame(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("message body is not valid UTF-8 text")]
    NotText,

    #[error("session is not transacted")]
    NotTransacted,
}
