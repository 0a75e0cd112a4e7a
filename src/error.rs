//! Error types for waiting on the protocol and driving it to completion.
//!
//! The prepared statement cache never fails; everything here comes from the
//! wait adaptors, the configuration parser, or the drivers being waited on.

use std::io;

use thiserror::Error;

/// Result type for pgwait operations.
pub type PgResult<T> = std::result::Result<T, PgError>;

/// Errors that can occur while waiting on a connection.
#[derive(Error, Debug)]
pub enum PgError {
    /// I/O error from the multiplexor or from the driver.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No readiness observed before the deadline elapsed.
    #[error("timeout expired")]
    Timeout,

    /// The multiplexor or scheduler reported a status we can't interpret.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Protocol error raised by a driver (unexpected message, bad state...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration parameter.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PgError {
    /// True for the user-facing timeout condition.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PgError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        assert_eq!(PgError::Timeout.to_string(), "timeout expired");
        assert!(PgError::Timeout.is_timeout());
        assert!(!PgError::Internal("x".into()).is_timeout());
    }

    #[test]
    fn test_io_conversion() {
        let err: PgError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, PgError::Io(_)));
        assert_eq!(err.to_string(), "I/O error: boom");
    }
}
