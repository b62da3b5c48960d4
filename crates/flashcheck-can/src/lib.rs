//! flashcheck-can - XCP-on-CAN handshake and periodic traffic verification
//!
//! This crate confirms that a freshly flashed target is alive: it performs
//! an XCP CONNECT/DISCONNECT handshake, reads version markers with
//! SHORT_UPLOAD, and checks that every expected periodic message shows up on
//! the bus at (at most) its nominal cycle time.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    VerificationRun                          │
//! │  handshake, then per-channel monitoring                     │
//! │                                                             │
//! │  ┌─────────────────────┐      ┌──────────────────────────┐ │
//! │  │ DiagnosticSession   │      │ TrafficMonitor           │ │
//! │  │ (CONNECT / UPLOAD / │      │ (single-shot / windowed, │ │
//! │  │  DISCONNECT)        │      │  capture logs)           │ │
//! │  └──────────┬──────────┘      └────────────┬─────────────┘ │
//! │             │                              │               │
//! │             └──────────┬───────────────────┘               │
//! │                 ┌──────┴──────────┐                         │
//! │                 │ ChannelProvider │                         │
//! │                 │(SocketCAN/sim)  │                         │
//! │                 └─────────────────┘                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod monitor;
pub mod run;
pub mod transport;
pub mod xcp;

pub use config::{MonitorConfig, ProtocolConfig, SamplingStrategy, TransportConfig, VerifyConfig};
pub use context::RunContext;
pub use error::{CaptureError, MonitorError, RunError, SessionError};
pub use monitor::{analyze_capture, CaptureLog, TrafficMonitor};
pub use run::VerificationRun;
pub use transport::{create_provider, CanChannel, ChannelProvider, SimulatedBus, TransportError};
pub use xcp::{DiagnosticSession, SessionState};
