//! Verification configuration
//!
//! This module contains configuration types for the XCP handshake, the
//! traffic monitor and the transport, deserialized from TOML.

use std::path::PathBuf;
use std::time::Duration;

use flashcheck_core::{CanId, ChannelId};
use serde::{Deserialize, Serialize};

use crate::transport::TransportError;

/// Configuration shared by the handshake and the monitor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// XCP-on-CAN handshake settings
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Version markers read from the target after connect
    #[serde(default)]
    pub version_markers: Vec<VersionMarkerConfig>,
    /// Periodic traffic monitor settings
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,
}

impl VerifyConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

// =============================================================================
// Protocol Configuration
// =============================================================================

/// XCP-on-CAN addressing and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Master -> slave CAN ID
    #[serde(default = "default_request_id")]
    pub request_id: String,
    /// Slave -> master CAN ID
    #[serde(default = "default_response_id")]
    pub response_id: String,
    /// Channel the target's diagnostic endpoint is on
    #[serde(default = "default_channel")]
    pub channel: u8,
    /// Sends per transaction before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause between attempts (milliseconds)
    #[serde(default = "default_inter_attempt_delay")]
    pub inter_attempt_delay_ms: u64,
    /// How long one attempt waits for a correctly addressed response (milliseconds)
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Timeout of a single receive poll (milliseconds)
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
}

fn default_request_id() -> String {
    "0x7E0".to_string()
}

fn default_response_id() -> String {
    "0x7E1".to_string()
}

fn default_channel() -> u8 {
    1
}

fn default_max_attempts() -> u32 {
    10
}

fn default_inter_attempt_delay() -> u64 {
    1000
}

fn default_response_timeout() -> u64 {
    1000
}

fn default_poll_timeout() -> u64 {
    50
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            request_id: default_request_id(),
            response_id: default_response_id(),
            channel: default_channel(),
            max_attempts: default_max_attempts(),
            inter_attempt_delay_ms: default_inter_attempt_delay(),
            response_timeout_ms: default_response_timeout(),
            poll_timeout_ms: default_poll_timeout(),
        }
    }
}

impl ProtocolConfig {
    pub fn request_can_id(&self) -> Result<CanId, TransportError> {
        parse_can_id(&self.request_id)
    }

    pub fn response_can_id(&self) -> Result<CanId, TransportError> {
        parse_can_id(&self.response_id)
    }

    pub fn channel_id(&self) -> Result<ChannelId, TransportError> {
        ChannelId::new(self.channel).map_err(|e| TransportError::InvalidConfig(e.to_string()))
    }
}

/// A version marker to read with SHORT_UPLOAD
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionMarkerConfig {
    /// Human-readable label (e.g., "Stub version (Main)")
    pub label: String,
    /// Symbol whose address is looked up in the symbol table
    pub symbol: String,
    /// Bytes to read (1..=7)
    #[serde(default = "default_marker_size")]
    pub size: u8,
}

fn default_marker_size() -> u8 {
    1
}

// =============================================================================
// Monitor Configuration
// =============================================================================

/// How arrivals are sampled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SamplingStrategy {
    /// One filtered window per identifier, first two arrivals
    SingleShot,
    /// One capture window per channel, mean gap after discarding start-up occurrences
    #[default]
    Windowed,
}

/// Periodic traffic monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub strategy: SamplingStrategy,
    /// Capture window of the windowed strategy (milliseconds)
    #[serde(default = "default_window")]
    pub window_ms: u64,
    /// Per-identifier window of the single-shot strategy (milliseconds)
    #[serde(default = "default_single_shot_window")]
    pub single_shot_window_ms: u64,
    /// Leading occurrences ignored by the windowed strategy
    #[serde(default = "default_discard")]
    pub discard: usize,
    /// Monitor channels concurrently
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// Directory for candump-style capture logs
    #[serde(default = "default_capture_dir", skip_serializing_if = "Option::is_none")]
    pub capture_dir: Option<PathBuf>,
}

fn default_window() -> u64 {
    5000
}

fn default_single_shot_window() -> u64 {
    1000
}

fn default_discard() -> usize {
    4
}

fn default_parallel() -> bool {
    true
}

fn default_capture_dir() -> Option<PathBuf> {
    Some(PathBuf::from("captures"))
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            strategy: SamplingStrategy::default(),
            window_ms: default_window(),
            single_shot_window_ms: default_single_shot_window(),
            discard: default_discard(),
            parallel: default_parallel(),
            capture_dir: default_capture_dir(),
        }
    }
}

impl MonitorConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn single_shot_window(&self) -> Duration {
        Duration::from_millis(self.single_shot_window_ms)
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Raw SocketCAN (Linux only)
    SocketCan(SocketCanConfig),
    /// In-process simulated target
    Simulated(SimulatedConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Simulated(SimulatedConfig::default())
    }
}

/// SocketCAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// Channel to interface bindings
    pub channels: Vec<InterfaceBinding>,
}

/// Binds a logical channel to a CAN interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceBinding {
    pub id: u8,
    /// CAN interface name (e.g., "can0", "vcan0")
    pub interface: String,
}

impl SocketCanConfig {
    pub fn interface_for(&self, channel: ChannelId) -> Option<&str> {
        self.channels
            .iter()
            .find(|b| b.id == channel.get())
            .map(|b| b.interface.as_str())
    }
}

/// How the simulated target answers handshake commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimulatedReply {
    /// Positive response (0xFF)
    #[default]
    Positive,
    /// Error packet (0xFE) with an error code
    Error,
    /// Unknown command (0x20)
    Unknown,
    /// No response at all
    Silent,
}

/// Simulated target configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatedConfig {
    /// Simulated response latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
    /// Reply to CONNECT/DISCONNECT
    #[serde(default)]
    pub handshake: SimulatedReply,
    /// Reply to SHORT_UPLOAD (positive replies read `memory`)
    #[serde(default)]
    pub short_upload: SimulatedReply,
    /// Target memory contents
    #[serde(default)]
    pub memory: Vec<MemoryCell>,
    /// Periodic frames emitted by the target
    #[serde(default)]
    pub periodic: Vec<PeriodicSource>,
    /// Channels that fail to open
    #[serde(default)]
    pub fail_channels: Vec<u8>,
}

/// Bytes at a target address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCell {
    /// Address in hex format (e.g., "0x50006A34")
    pub address: String,
    pub value: Vec<u8>,
}

/// A periodic message source on the simulated bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicSource {
    pub channel: u8,
    /// CAN ID in hex format (e.g., "0x123")
    pub id: String,
    pub period_ms: u64,
    /// Phase offset of the first transmission
    #[serde(default)]
    pub offset_ms: u64,
}

/// Parse a standard CAN ID from string (supports hex with 0x prefix)
pub fn parse_can_id(s: &str) -> Result<CanId, TransportError> {
    CanId::parse(s)
        .ok_or_else(|| TransportError::InvalidConfig(format!("Invalid standard CAN ID '{}'", s)))
}

/// Parse a 32-bit address (hex with 0x prefix, or decimal)
pub fn parse_address(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_target_protocol() {
        let config = VerifyConfig::from_toml_str("").unwrap();

        assert_eq!(config.protocol.request_can_id().unwrap().raw(), 0x7E0);
        assert_eq!(config.protocol.response_can_id().unwrap().raw(), 0x7E1);
        assert_eq!(config.protocol.max_attempts, 10);
        assert_eq!(config.protocol.inter_attempt_delay_ms, 1000);
        assert_eq!(config.protocol.poll_timeout_ms, 50);
        assert_eq!(config.monitor.strategy, SamplingStrategy::Windowed);
        assert_eq!(config.monitor.window_ms, 5000);
        assert_eq!(config.monitor.discard, 4);
        assert!(matches!(config.transport, TransportConfig::Simulated(_)));
    }

    #[test]
    fn test_parse_full_config() {
        let content = r#"
            [protocol]
            request_id = "0x600"
            response_id = "0x601"
            max_attempts = 3

            [[version_markers]]
            label = "Stub version (Main)"
            symbol = "StubVersion_Main"

            [monitor]
            strategy = "single-shot"
            parallel = false
            capture_dir = "captures"

            [transport]
            type = "socketcan"
            channels = [{ id = 1, interface = "can0" }, { id = 2, interface = "can1" }]
        "#;
        let config = VerifyConfig::from_toml_str(content).unwrap();

        assert_eq!(config.protocol.request_can_id().unwrap().raw(), 0x600);
        assert_eq!(config.protocol.max_attempts, 3);
        assert_eq!(config.version_markers[0].size, 1);
        assert_eq!(config.monitor.strategy, SamplingStrategy::SingleShot);
        assert!(!config.monitor.parallel);

        let TransportConfig::SocketCan(can) = config.transport else {
            panic!("expected socketcan transport");
        };
        assert_eq!(can.interface_for(ChannelId::new(2).unwrap()), Some("can1"));
        assert_eq!(can.interface_for(ChannelId::new(3).unwrap()), None);
    }

    #[test]
    fn test_parse_simulated_transport() {
        let content = r#"
            [transport]
            type = "simulated"
            handshake = "silent"
            memory = [{ address = "0x50006A34", value = [3] }]
            periodic = [{ channel = 1, id = "0x123", period_ms = 45 }]
        "#;
        let config = VerifyConfig::from_toml_str(content).unwrap();

        let TransportConfig::Simulated(sim) = config.transport else {
            panic!("expected simulated transport");
        };
        assert_eq!(sim.handshake, SimulatedReply::Silent);
        assert_eq!(sim.short_upload, SimulatedReply::Positive);
        assert_eq!(parse_address(&sim.memory[0].address), Some(0x5000_6A34));
        assert_eq!(sim.periodic[0].period_ms, 45);
    }

    #[test]
    fn test_rejects_extended_protocol_id() {
        let config = ProtocolConfig {
            request_id: "0x18DA00F1".to_string(),
            ..Default::default()
        };
        assert!(config.request_can_id().is_err());
    }
}
