//! Transport layer for CAN traffic
//!
//! This module provides channel providers for reaching the target:
//! - SocketCAN provider for raw classic CAN (Linux only)
//! - Simulated bus for testing and dry runs
//!
//! # Example
//!
//! ```ignore
//! use flashcheck_can::transport::{create_provider, IdFilter};
//! use flashcheck_can::config::TransportConfig;
//!
//! let config = TransportConfig::Simulated(Default::default());
//! let provider = create_provider(&config, request_id, response_id)?;
//! let channel = provider.open(ChannelId::new(1)?, Some(IdFilter::exact(response_id))).await?;
//! let frame = channel.receive(Duration::from_millis(50)).await?;
//! ```

mod channel;
pub mod error;
pub mod simulated;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use channel::{CanChannel, ChannelProvider, IdFilter};
pub use error::TransportError;
pub use simulated::SimulatedBus;

use std::sync::Arc;

use flashcheck_core::CanId;

use crate::config::TransportConfig;

/// Create a channel provider based on configuration
///
/// The request/response identifiers tell the simulated target which frames
/// are commands and where to answer; real buses ignore them.
pub fn create_provider(
    config: &TransportConfig,
    request_id: CanId,
    response_id: CanId,
) -> Result<Arc<dyn ChannelProvider>, TransportError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan(cfg) => {
            let _ = (request_id, response_id);
            Ok(Arc::new(socketcan::SocketCanProvider::new(cfg)))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::SocketCan(_) => Err(TransportError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        TransportConfig::Simulated(cfg) => {
            let bus = SimulatedBus::from_config(cfg, request_id, response_id)?;
            Ok(Arc::new(bus))
        }
    }
}
