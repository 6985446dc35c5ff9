//! Error types for the llama playground session layer.

use std::result;
use thiserror::Error;

use crate::session::ClientIdentity;

/// A specialized Result type for playground operations.
pub type Result<T> = result::Result<T, Error>;

/// The error type for playground operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors outside of a backend connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No free port was found in the requested range
    #[error("No open port found in {min}..={max} after {attempts} attempts")]
    PortExhausted { min: u16, max: u16, attempts: u32 },

    /// The backend process could not be started or never became reachable.
    /// Once raised, the backend stays unavailable until the service is restarted.
    #[error("Backend startup failed: {0}")]
    Startup(String),

    /// Socket failure while connecting to or streaming from the backend
    #[error("Transport error: {0}")]
    Transport(std::io::Error),

    #[error("Unknown client identity: {0}")]
    IdentityNotFound(ClientIdentity),

    #[error("Client {0} is already generating")]
    AlreadyGenerating(ClientIdentity),

    #[error("Client {0} is not generating")]
    NotGenerating(ClientIdentity),

    /// Malformed generation option or request frame
    #[error("Invalid option: {0}")]
    InvalidOption(String),
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// True for errors that concern a single session's preconditions
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            Error::IdentityNotFound(_) | Error::AlreadyGenerating(_) | Error::NotGenerating(_)
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
