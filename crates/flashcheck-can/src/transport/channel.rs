//! Transport channel trait and types

use std::time::Duration;

use async_trait::async_trait;
use flashcheck_core::{CanId, ChannelId, Frame};

use super::TransportError;

/// Acceptance filter requested when a channel is opened
///
/// A frame passes when `frame_id & mask == id & mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdFilter {
    pub id: u32,
    pub mask: u32,
}

impl IdFilter {
    /// Filter letting exactly one standard identifier through
    pub fn exact(id: CanId) -> Self {
        Self {
            id: id.raw(),
            mask: CanId::MAX,
        }
    }

    pub fn matches(&self, id: CanId) -> bool {
        id.raw() & self.mask == self.id & self.mask
    }
}

/// A bound endpoint for classic CAN frames on one bus channel
///
/// Filtering at this layer is best effort: callers must tolerate frames
/// that do not match the identifier they are waiting for.
#[async_trait]
pub trait CanChannel: Send + Sync {
    /// Channel this endpoint is bound to
    fn channel(&self) -> ChannelId;

    /// Transmit one frame
    async fn send(&self, frame: &Frame) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next frame
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn receive(&self, timeout: Duration) -> Result<Option<Frame>, TransportError>;

    /// Release the underlying handle; further calls fail with `ChannelClosed`
    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens channels on a physical or simulated bus
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    async fn open(
        &self,
        channel: ChannelId,
        filter: Option<IdFilter>,
    ) -> Result<Box<dyn CanChannel>, TransportError>;
}
