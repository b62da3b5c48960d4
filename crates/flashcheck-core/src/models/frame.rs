//! CAN frame models

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Logical bus channel (1-based, e.g. CAN1..CAN4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ChannelId(u8);

impl ChannelId {
    pub fn new(channel: u8) -> Result<Self, CoreError> {
        if channel == 0 {
            return Err(CoreError::InvalidChannel(channel));
        }
        Ok(Self(channel))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for ChannelId {
    type Error = CoreError;

    fn try_from(channel: u8) -> Result<Self, Self::Error> {
        Self::new(channel)
    }
}

impl From<ChannelId> for u8 {
    fn from(channel: ChannelId) -> Self {
        channel.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 11-bit standard CAN identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct CanId(u16);

impl CanId {
    /// Largest standard (11-bit) identifier
    pub const MAX: u32 = 0x7FF;

    pub fn new(raw: u32) -> Result<Self, CoreError> {
        if raw > Self::MAX {
            return Err(CoreError::InvalidIdentifier(raw));
        }
        Ok(Self(raw as u16))
    }

    pub fn raw(self) -> u32 {
        u32::from(self.0)
    }

    /// Parse `0x123`, `123h` style hex or plain decimal
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let raw = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16).ok()?
        } else if let Some(hex) = s.strip_suffix('h').or_else(|| s.strip_suffix('H')) {
            u32::from_str_radix(hex, 16).ok()?
        } else {
            s.parse().ok()?
        };
        Self::new(raw).ok()
    }
}

impl TryFrom<u32> for CanId {
    type Error = CoreError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<CanId> for u32 {
    fn from(id: CanId) -> Self {
        id.raw()
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03X}", self.0)
    }
}

/// A classic CAN frame with a fixed 8-byte payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame {
    channel: ChannelId,
    identifier: CanId,
    payload: [u8; 8],
}

impl Frame {
    /// Build a frame, zero-padding short payloads
    pub fn new(channel: ChannelId, identifier: CanId, data: &[u8]) -> Result<Self, CoreError> {
        if data.len() > 8 {
            return Err(CoreError::PayloadTooLong(data.len()));
        }
        let mut payload = [0u8; 8];
        payload[..data.len()].copy_from_slice(data);
        Ok(Self {
            channel,
            identifier,
            payload,
        })
    }

    pub fn from_payload(channel: ChannelId, identifier: CanId, payload: [u8; 8]) -> Self {
        Self {
            channel,
            identifier,
            payload,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn identifier(&self) -> CanId {
        self.identifier
    }

    pub fn payload(&self) -> &[u8; 8] {
        &self.payload
    }

    /// Leading payload byte (opcode on requests, packet id on responses)
    pub fn leading_byte(&self) -> u8 {
        self.payload[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_id_rejects_extended() {
        assert!(CanId::new(0x7FF).is_ok());
        assert_eq!(
            CanId::new(0x800),
            Err(CoreError::InvalidIdentifier(0x800))
        );
    }

    #[test]
    fn test_can_id_parse_formats() {
        assert_eq!(CanId::parse("0x7E1").map(CanId::raw), Some(0x7E1));
        assert_eq!(CanId::parse("7E0h").map(CanId::raw), Some(0x7E0));
        assert_eq!(CanId::parse("291").map(CanId::raw), Some(0x123));
        assert!(CanId::parse("0x18DAF100").is_none());
        assert!(CanId::parse("zz").is_none());
    }

    #[test]
    fn test_can_id_display() {
        let id = CanId::new(0x12).unwrap();
        assert_eq!(id.to_string(), "0x012");
    }

    #[test]
    fn test_frame_pads_short_payload() {
        let ch = ChannelId::new(1).unwrap();
        let frame = Frame::new(ch, CanId::new(0x7E0).unwrap(), &[0xFF]).unwrap();
        assert_eq!(frame.payload(), &[0xFF, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(frame.leading_byte(), 0xFF);
    }

    #[test]
    fn test_frame_rejects_long_payload() {
        let ch = ChannelId::new(1).unwrap();
        let result = Frame::new(ch, CanId::new(0x100).unwrap(), &[0; 9]);
        assert_eq!(result, Err(CoreError::PayloadTooLong(9)));
    }

    #[test]
    fn test_channel_zero_invalid() {
        assert_eq!(ChannelId::new(0), Err(CoreError::InvalidChannel(0)));
    }
}
