//! Crate error types

use std::io;

use crate::protocol::GREETING_SIZE;

/// Error type for hub operations
#[derive(Debug)]
pub enum Error {
    /// Underlying socket or poll error
    Io(io::Error),
    /// A client sent a greeting that matches no known role
    UnknownGreeting([u8; GREETING_SIZE]),
    /// A DIF sequence does not begin with a valid DV frame header
    InvalidFrameHeader,
}

/// Result alias for hub operations
pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::UnknownGreeting(bytes) => write!(f, "unknown greeting {:02x?}", bytes),
            Error::InvalidFrameHeader => write!(f, "invalid DV frame header"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
