//! Raw SocketCAN channel for classic 11-bit frames

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flashcheck_core::{CanId, ChannelId, Frame};
use parking_lot::Mutex;
use socketcan::{
    CanFilter, CanFrame, CanSocket, EmbeddedFrame, Id, Socket, SocketOptions, StandardId,
};
use tracing::{debug, warn};

use crate::config::SocketCanConfig;
use crate::transport::{CanChannel, ChannelProvider, IdFilter, TransportError};

/// Smallest read timeout handed to the kernel (zero would mean "block forever")
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Opens raw CAN sockets according to the channel/interface bindings
pub struct SocketCanProvider {
    config: SocketCanConfig,
}

impl SocketCanProvider {
    pub fn new(config: &SocketCanConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl ChannelProvider for SocketCanProvider {
    async fn open(
        &self,
        channel: ChannelId,
        filter: Option<IdFilter>,
    ) -> Result<Box<dyn CanChannel>, TransportError> {
        let interface = self
            .config
            .interface_for(channel)
            .ok_or_else(|| TransportError::OpenFailed {
                channel: channel.get(),
                reason: "no interface bound to channel".to_string(),
            })?
            .to_string();

        let iface = interface.clone();
        let socket = tokio::task::spawn_blocking(move || open_socket(&iface, channel, filter))
            .await
            .map_err(|e| TransportError::OpenFailed {
                channel: channel.get(),
                reason: format!("task join error: {}", e),
            })??;

        debug!(%channel, %interface, ?filter, "SocketCAN channel opened");

        Ok(Box::new(SocketCanChannel {
            channel,
            interface,
            socket: Arc::new(Mutex::new(Some(socket))),
        }))
    }
}

fn open_socket(
    interface: &str,
    channel: ChannelId,
    filter: Option<IdFilter>,
) -> Result<CanSocket, TransportError> {
    let socket = CanSocket::open(interface).map_err(|e| TransportError::OpenFailed {
        channel: channel.get(),
        reason: format!("failed to open raw CAN socket on {}: {}", interface, e),
    })?;

    if let Some(filter) = filter {
        socket
            .set_filters(&[CanFilter::new(filter.id, filter.mask)])
            .map_err(|e| {
                TransportError::InvalidConfig(format!("Failed to set CAN filter: {}", e))
            })?;
    }

    Ok(socket)
}

/// A raw CAN socket bound to one channel
pub struct SocketCanChannel {
    channel: ChannelId,
    interface: String,
    socket: Arc<Mutex<Option<CanSocket>>>,
}

#[async_trait]
impl CanChannel for SocketCanChannel {
    fn channel(&self) -> ChannelId {
        self.channel
    }

    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let id = StandardId::new(frame.identifier().raw() as u16).ok_or_else(|| {
            TransportError::SendFailed(format!("Invalid standard CAN ID: {}", frame.identifier()))
        })?;
        let can_frame = CanFrame::new(id, frame.payload())
            .ok_or_else(|| TransportError::SendFailed("Invalid CAN frame".to_string()))?;

        let socket = self.socket.clone();
        tokio::task::spawn_blocking(move || {
            let guard = socket.lock();
            let socket = guard.as_ref().ok_or(TransportError::ChannelClosed)?;
            socket
                .write_frame(&can_frame)
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        })
        .await
        .map_err(|e| TransportError::SendFailed(format!("Task join error: {}", e)))?
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        let socket = self.socket.clone();
        let channel = self.channel;

        tokio::task::spawn_blocking(move || {
            let guard = socket.lock();
            let socket = guard.as_ref().ok_or(TransportError::ChannelClosed)?;
            read_standard_frame(socket, channel, timeout)
        })
        .await
        .map_err(|e| TransportError::ReceiveFailed(format!("Task join error: {}", e)))?
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.socket.lock().take().is_some() {
            debug!(channel = %self.channel, interface = %self.interface, "SocketCAN channel closed");
        }
        Ok(())
    }
}

/// Read until a standard data frame arrives or `timeout` elapses.
///
/// Extended, remote and error frames are skipped.
fn read_standard_frame(
    socket: &CanSocket,
    channel: ChannelId,
    timeout: Duration,
) -> Result<Option<Frame>, TransportError> {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }

        socket
            .set_read_timeout(remaining.max(MIN_READ_TIMEOUT))
            .map_err(|e| TransportError::ReceiveFailed(format!("Failed to set timeout: {}", e)))?;

        match socket.read_frame() {
            Ok(CanFrame::Data(data_frame)) => {
                let Id::Standard(sid) = data_frame.id() else {
                    continue;
                };
                let Ok(identifier) = CanId::new(u32::from(sid.as_raw())) else {
                    continue;
                };
                match Frame::new(channel, identifier, data_frame.data()) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => warn!(%channel, error = %e, "Dropping malformed frame"),
                }
            }
            Ok(_) => {
                // Remote or error frame
                continue;
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(None);
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::ReceiveFailed(e.to_string())),
        }
    }
}
