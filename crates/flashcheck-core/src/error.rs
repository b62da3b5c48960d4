//! Common error types for the core data model

use thiserror::Error;

/// Errors raised while constructing core values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Identifier does not fit in an 11-bit standard CAN id
    #[error("Invalid standard CAN identifier: 0x{0:X}")]
    InvalidIdentifier(u32),

    /// Payload longer than a classic CAN frame
    #[error("Payload too long: {0} bytes (max 8)")]
    PayloadTooLong(usize),

    /// Channel numbers start at 1
    #[error("Invalid channel: {0}")]
    InvalidChannel(u8),
}

/// Errors reported by external collaborators (loaders, resolvers, sinks)
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// Source could not be read
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Source was read but could not be understood
    #[error("Parse error in {path} line {line}: {message}")]
    Parse {
        path: String,
        line: usize,
        message: String,
    },

    /// Report could not be written
    #[error("Emit failed: {0}")]
    Emit(String),
}
