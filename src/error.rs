//! Custom error types for the driver.
//!
//! This module defines the primary error type, `SmuError`, for the whole crate.
//! Using the `thiserror` crate, it provides one place for everything that can go
//! wrong between the caller and the instrument, from a link that cannot be opened
//! to a reading buffer that returns short columns.
//!
//! ## Error Hierarchy
//!
//! `SmuError` mirrors the stages an operation passes through:
//!
//! - **`Connection`**: The link to the instrument could not be opened or claimed.
//! - **`Command`**: A single write or query failed at the transport level. The
//!   offending command text is kept so the caller can see where a sequence stopped.
//! - **`Configuration`**: An invalid parameter combination, detected before any
//!   command is sent (for example an overvoltage protection value outside the
//!   allowed set, or a sweep with fewer than two points).
//! - **`UnknownBuffer`**: A buffer name that is neither a system buffer nor one
//!   created since the last full reset.
//! - **`InvalidBufferCapacity`**: A buffer creation request with a capacity the
//!   instrument cannot hold.
//! - **`BufferRead`**: A retrieval produced inconsistent or short columns.
//! - **`NotInitialized`**: An operation that needs the stored session settings was
//!   called before `Session::initialize`.
//! - **`ConfigLoad`**: Wraps `figment` errors raised while loading a config file.
//!
//! None of these are retried by the driver. A failed sequence leaves the
//! instrument in whatever state the last successful command produced; the remedy
//! is a fresh `Session::initialize`.

use crate::connection::AdapterError;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type SmuResult<T> = std::result::Result<T, SmuError>;

#[derive(Error, Debug)]
pub enum SmuError {
    #[error("Cannot open connection to '{address}': {source}")]
    Connection {
        address: String,
        #[source]
        source: AdapterError,
    },

    #[error("Command '{command}' failed: {source}")]
    Command {
        command: String,
        #[source]
        source: AdapterError,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown buffer '{0}'")]
    UnknownBuffer(String),

    #[error("Cannot create buffer '{name}': capacity {capacity} must be between 1 and {max}")]
    InvalidBufferCapacity {
        name: String,
        capacity: u64,
        max: u64,
    },

    #[error("Reading buffer '{buffer}' could not be retrieved: {reason}")]
    BufferRead { buffer: String, reason: String },

    #[error("Session has not been initialized")]
    NotInitialized,

    #[error("Config load error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),
}

impl SmuError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        SmuError::Configuration(msg.into())
    }

    pub fn buffer_read(buffer: &str, reason: impl Into<String>) -> Self {
        SmuError::BufferRead {
            buffer: buffer.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors raised before anything was written to the instrument.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SmuError::Configuration(_)
                | SmuError::UnknownBuffer(_)
                | SmuError::InvalidBufferCapacity { .. }
                | SmuError::NotInitialized
        )
    }
}

impl From<figment::Error> for SmuError {
    fn from(err: figment::Error) -> Self {
        SmuError::ConfigLoad(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SmuError::UnknownBuffer("sweepbuf".to_string());
        assert_eq!(err.to_string(), "Unknown buffer 'sweepbuf'");
    }

    #[test]
    fn test_command_error_keeps_command_text() {
        let err = SmuError::Command {
            command: "smu.source.output = smu.ON".into(),
            source: AdapterError::SendFailed("bus timeout".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("smu.source.output = smu.ON"));
        assert!(msg.contains("bus timeout"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_validation_classification() {
        assert!(SmuError::configuration("bad").is_validation());
        assert!(SmuError::NotInitialized.is_validation());
        assert!(!SmuError::buffer_read("defbuffer1", "short").is_validation());
    }
}
