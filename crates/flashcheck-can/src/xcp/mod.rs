//! XCP-on-CAN protocol layer
//!
//! Only the three commands needed to confirm a freshly flashed target is
//! alive are implemented: CONNECT, SHORT_UPLOAD and DISCONNECT.

mod session;

pub use session::{ConnectInfo, DiagnosticSession, SessionState, TransactPolicy};

use std::fmt;

/// XCP command codes (first byte of a command packet)
pub mod opcode {
    pub const CONNECT: u8 = 0xFF;
    pub const DISCONNECT: u8 = 0xFE;
    pub const SHORT_UPLOAD: u8 = 0xF4;
}

/// Leading byte of a response packet
pub mod pid {
    /// Positive response
    pub const RES: u8 = 0xFF;
    /// Error packet
    pub const ERR: u8 = 0xFE;
    /// Command unknown to the slave
    pub const CMD_UNKNOWN: u8 = 0x20;
}

/// Error codes carried in byte 1 of an ERR packet
pub mod error_code {
    pub const CMD_BUSY: u8 = 0x10;
    pub const CMD_UNKNOWN: u8 = 0x20;
    pub const CMD_SYNTAX: u8 = 0x21;
    pub const OUT_OF_RANGE: u8 = 0x22;
    pub const ACCESS_DENIED: u8 = 0x24;
    pub const ACCESS_LOCKED: u8 = 0x25;
    pub const GENERIC: u8 = 0x31;
}

/// Largest SHORT_UPLOAD on a classic CAN frame (one byte is the PID)
pub const MAX_SHORT_UPLOAD: u8 = 7;

/// A command sent by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    ShortUpload { size: u8, address: u32 },
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Connect => opcode::CONNECT,
            Self::Disconnect => opcode::DISCONNECT,
            Self::ShortUpload { .. } => opcode::SHORT_UPLOAD,
        }
    }

    /// Encode as an 8-byte CAN payload
    pub fn encode(&self) -> [u8; 8] {
        match *self {
            // Mode 0x00 = normal
            Self::Connect => [opcode::CONNECT, 0, 0, 0, 0, 0, 0, 0],
            Self::Disconnect => [opcode::DISCONNECT, 0, 0, 0, 0, 0, 0, 0],
            // [cmd, size, reserved, address extension, address (LE)]
            Self::ShortUpload { size, address } => {
                let a = address.to_le_bytes();
                [opcode::SHORT_UPLOAD, size, 0, 0, a[0], a[1], a[2], a[3]]
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Disconnect => "DISCONNECT",
            Self::ShortUpload { .. } => "SHORT_UPLOAD",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortUpload { size, address } => {
                write!(f, "SHORT_UPLOAD({} @ 0x{:08X})", size, address)
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Classified response packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// PID 0xFF with the full payload
    Success([u8; 8]),
    /// PID 0xFE; `code` is the XCP error code
    ProtocolError { code: u8 },
    /// Leading byte 0x20
    UnknownCommand,
    /// Anything else
    Unexpected(u8),
}

impl ResponseClass {
    /// Classify a response by its leading byte
    pub fn classify(payload: &[u8; 8]) -> Self {
        match payload[0] {
            pid::RES => Self::Success(*payload),
            pid::ERR => Self::ProtocolError { code: payload[1] },
            pid::CMD_UNKNOWN => Self::UnknownCommand,
            other => Self::Unexpected(other),
        }
    }
}

impl fmt::Display for ResponseClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(_) => f.write_str("RES"),
            Self::ProtocolError { code } => {
                write!(f, "ERR 0x{:02X} ({})", code, error_code_name(*code))
            }
            Self::UnknownCommand => f.write_str("XCP_ERR_CMD_UNKNOWN"),
            Self::Unexpected(byte) => write!(f, "unexpected 0x{:02X}", byte),
        }
    }
}

fn error_code_name(code: u8) -> &'static str {
    match code {
        error_code::CMD_BUSY => "command busy",
        error_code::CMD_UNKNOWN => "command unknown",
        error_code::CMD_SYNTAX => "command syntax",
        error_code::OUT_OF_RANGE => "out of range",
        error_code::ACCESS_DENIED => "access denied",
        error_code::ACCESS_LOCKED => "access locked",
        error_code::GENERIC => "generic error",
        _ => "unknown error code",
    }
}
