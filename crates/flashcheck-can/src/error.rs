//! Session, monitor and run errors

use std::path::PathBuf;

use flashcheck_core::CollaboratorError;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors raised by the XCP diagnostic session
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Handshake answered with an error, unknown-command or unexpected packet
    #[error("{command} rejected by target: {response}")]
    ProtocolFault {
        command: &'static str,
        response: String,
    },

    /// No correctly addressed response after every attempt
    #[error("No response to {command} after {attempts} attempts")]
    HandshakeTimeout {
        command: &'static str,
        attempts: u32,
    },

    /// A memory query could not be answered; the session stays usable
    #[error("Query at 0x{address:08X} unavailable: {reason}")]
    QueryUnavailable { address: u32, reason: String },

    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
}

impl SessionError {
    /// Fatal errors abort the run before monitoring
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::QueryUnavailable { .. })
    }
}

/// Errors reading or writing a capture log
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to access capture log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed capture line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// Errors confined to one monitored channel
///
/// These never abort a run; the monitor turns them into notes on the
/// channel's entries.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors that terminate a verification run
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Report sink error: {0}")]
    Sink(#[from] CollaboratorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_query_errors_are_recoverable() {
        let recoverable = SessionError::QueryUnavailable {
            address: 0x5000_6A34,
            reason: "XCP_ERR_CMD_UNKNOWN".into(),
        };
        assert!(!recoverable.is_fatal());
        assert_eq!(
            recoverable.to_string(),
            "Query at 0x50006A34 unavailable: XCP_ERR_CMD_UNKNOWN"
        );

        let timeout = SessionError::HandshakeTimeout {
            command: "CONNECT",
            attempts: 10,
        };
        assert!(timeout.is_fatal());
        assert!(SessionError::from(TransportError::ChannelClosed).is_fatal());
    }
}
