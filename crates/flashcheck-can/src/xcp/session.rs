//! XCP diagnostic session
//!
//! Drives the CONNECT / SHORT_UPLOAD / DISCONNECT exchange over one CAN
//! channel. Every command goes through [`DiagnosticSession::transact`], which
//! owns the retry policy; connect, disconnect and queries only differ in how
//! they map a [`ResponseClass`] onto the session state.

use std::fmt;
use std::time::Duration;

use flashcheck_core::{CanId, Frame, SymbolResolver, VersionMarker};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument, Span};

use super::{Command, ResponseClass, MAX_SHORT_UPLOAD};
use crate::config::{ProtocolConfig, VersionMarkerConfig};
use crate::context::RunContext;
use crate::error::SessionError;
use crate::transport::CanChannel;

/// Retry and timing policy of a single command exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactPolicy {
    /// Sends before giving up
    pub max_attempts: u32,
    /// Pause between two attempts
    pub inter_attempt_delay: Duration,
    /// Deadline of one attempt, including time spent skipping other identifiers
    pub response_timeout: Duration,
    /// Timeout of a single receive call
    pub poll_timeout: Duration,
}

impl Default for TransactPolicy {
    fn default() -> Self {
        Self::from(&ProtocolConfig::default())
    }
}

impl From<&ProtocolConfig> for TransactPolicy {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            inter_attempt_delay: Duration::from_millis(config.inter_attempt_delay_ms),
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
        }
    }
}

/// Lifecycle of a diagnostic session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Querying,
    Disconnecting,
    Closed,
    /// Handshake failed; the session cannot be reused
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Querying => "querying",
            Self::Disconnecting => "disconnecting",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Slave properties reported in the positive CONNECT response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectInfo {
    pub resource: u8,
    pub comm_mode_basic: u8,
    pub max_cto: u8,
    pub max_dto: u16,
    pub protocol_layer_version: u8,
    pub transport_layer_version: u8,
}

impl ConnectInfo {
    /// Parse `[0xFF, RESOURCE, COMM_MODE_BASIC, MAX_CTO, MAX_DTO(2), PROTO, TRANSPORT]`
    pub fn parse(payload: &[u8; 8]) -> Self {
        let comm_mode_basic = payload[2];
        let dto = [payload[4], payload[5]];
        let max_dto = if comm_mode_basic & 0x01 != 0 {
            u16::from_be_bytes(dto)
        } else {
            u16::from_le_bytes(dto)
        };
        Self {
            resource: payload[1],
            comm_mode_basic,
            max_cto: payload[3],
            max_dto,
            protocol_layer_version: payload[6],
            transport_layer_version: payload[7],
        }
    }

    /// Slave uses Motorola byte order
    pub fn is_big_endian(&self) -> bool {
        self.comm_mode_basic & 0x01 != 0
    }
}

/// Master side of an XCP-on-CAN session
pub struct DiagnosticSession {
    channel: Box<dyn CanChannel>,
    request_id: CanId,
    response_id: CanId,
    policy: TransactPolicy,
    state: SessionState,
    connect_info: Option<ConnectInfo>,
    channel_closed: bool,
    span: Span,
}

impl DiagnosticSession {
    pub fn new(
        ctx: &RunContext,
        channel: Box<dyn CanChannel>,
        request_id: CanId,
        response_id: CanId,
        policy: TransactPolicy,
    ) -> Self {
        let span = tracing::info_span!(
            parent: ctx.span(),
            "xcp",
            channel = %channel.channel(),
            request_id = %request_id,
            response_id = %response_id,
        );
        Self {
            channel,
            request_id,
            response_id,
            policy,
            state: SessionState::Idle,
            connect_info: None,
            channel_closed: false,
            span,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Properties reported by the slave, once connected
    pub fn connect_info(&self) -> Option<&ConnectInfo> {
        self.connect_info.as_ref()
    }

    /// Send `command` until a correctly addressed response arrives
    ///
    /// Each attempt waits at most `response_timeout` for a frame carrying the
    /// response identifier; frames with other identifiers are skipped.
    /// Exactly `max_attempts` sends precede a `HandshakeTimeout`.
    pub async fn transact(&self, command: &Command) -> Result<ResponseClass, SessionError> {
        let span = self.span.clone();
        self.transact_inner(command).instrument(span).await
    }

    async fn transact_inner(&self, command: &Command) -> Result<ResponseClass, SessionError> {
        let frame = Frame::from_payload(self.channel.channel(), self.request_id, command.encode());
        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            self.channel.send(&frame).await?;
            debug!(command = %command, attempt, "Command sent");

            if let Some(payload) = self.await_response().await? {
                let class = ResponseClass::classify(&payload);
                debug!(command = %command, attempt, response = %class, "Response received");
                return Ok(class);
            }

            warn!(command = %command, attempt, max_attempts, "No response from target");
            if attempt < max_attempts {
                tokio::time::sleep(self.policy.inter_attempt_delay).await;
            }
        }

        Err(SessionError::HandshakeTimeout {
            command: command.name(),
            attempts: max_attempts,
        })
    }

    async fn await_response(&self) -> Result<Option<[u8; 8]>, SessionError> {
        let deadline = Instant::now() + self.policy.response_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            match self.channel.receive(remaining.min(self.policy.poll_timeout)).await? {
                Some(frame) if frame.identifier() == self.response_id => {
                    return Ok(Some(*frame.payload()));
                }
                Some(frame) => {
                    trace!(id = %frame.identifier(), "Skipping frame while awaiting response");
                }
                None => {}
            }
        }
    }

    /// Establish the session with CONNECT
    pub async fn connect(&mut self) -> Result<ConnectInfo, SessionError> {
        self.expect_state("connect", SessionState::Idle)?;
        self.state = SessionState::Connecting;

        match self.transact(&Command::Connect).await {
            Ok(ResponseClass::Success(payload)) => {
                let info = ConnectInfo::parse(&payload);
                info!(
                    max_cto = info.max_cto,
                    max_dto = info.max_dto,
                    big_endian = info.is_big_endian(),
                    "XCP session connected"
                );
                self.connect_info = Some(info);
                self.state = SessionState::Connected;
                Ok(info)
            }
            Ok(other) => {
                self.state = SessionState::Failed;
                error!(response = %other, "CONNECT rejected");
                Err(SessionError::ProtocolFault {
                    command: Command::Connect.name(),
                    response: other.to_string(),
                })
            }
            Err(e) => {
                self.state = SessionState::Failed;
                error!(error = %e, "CONNECT failed");
                Err(e)
            }
        }
    }

    /// Read `size` bytes at `address` with SHORT_UPLOAD
    ///
    /// Returns the bytes following the PID. Anything but a positive
    /// response is a recoverable `QueryUnavailable`; the session stays
    /// connected.
    pub async fn query_short_upload(
        &mut self,
        address: u32,
        size: u8,
    ) -> Result<Vec<u8>, SessionError> {
        self.expect_state("query", SessionState::Connected)?;

        if size == 0 || size > MAX_SHORT_UPLOAD {
            return Err(SessionError::QueryUnavailable {
                address,
                reason: format!("size {} outside 1..={}", size, MAX_SHORT_UPLOAD),
            });
        }

        self.state = SessionState::Querying;
        let outcome = self
            .transact(&Command::ShortUpload { size, address })
            .await;
        self.state = SessionState::Connected;

        match outcome {
            Ok(ResponseClass::Success(payload)) => Ok(payload[1..=usize::from(size)].to_vec()),
            Ok(other) => Err(SessionError::QueryUnavailable {
                address,
                reason: other.to_string(),
            }),
            Err(SessionError::HandshakeTimeout { attempts, .. }) => {
                Err(SessionError::QueryUnavailable {
                    address,
                    reason: format!("no response after {} attempts", attempts),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Read every configured version marker
    ///
    /// Unresolved symbols and unavailable queries yield markers without a
    /// value; only fatal errors abort.
    pub async fn query_version_markers(
        &mut self,
        markers: &[VersionMarkerConfig],
        resolver: &dyn SymbolResolver,
    ) -> Result<Vec<VersionMarker>, SessionError> {
        let mut results = Vec::with_capacity(markers.len());

        for marker in markers {
            let Some(address) = resolver.resolve(&marker.symbol) else {
                warn!(symbol = %marker.symbol, label = %marker.label, "Symbol not found, skipping version query");
                results.push(VersionMarker {
                    label: marker.label.clone(),
                    symbol: marker.symbol.clone(),
                    address: None,
                    value: None,
                });
                continue;
            };

            let value = match self.query_short_upload(address, marker.size).await {
                Ok(bytes) => {
                    info!(label = %marker.label, address = %format!("0x{:08X}", address), value = ?bytes, "Version marker read");
                    Some(bytes)
                }
                Err(e) if !e.is_fatal() => {
                    warn!(label = %marker.label, error = %e, "Version marker unavailable");
                    None
                }
                Err(e) => return Err(e),
            };

            results.push(VersionMarker {
                label: marker.label.clone(),
                symbol: marker.symbol.clone(),
                address: Some(address),
                value,
            });
        }

        Ok(results)
    }

    /// End the session with DISCONNECT, then close the channel regardless of the outcome
    pub async fn disconnect(&mut self) -> Result<(), SessionError> {
        self.expect_state("disconnect", SessionState::Connected)?;
        self.state = SessionState::Disconnecting;

        let outcome = self.transact(&Command::Disconnect).await;
        self.close_channel().await;

        match outcome {
            Ok(ResponseClass::Success(_)) => {
                self.state = SessionState::Closed;
                info!("XCP session disconnected");
                Ok(())
            }
            Ok(other) => {
                self.state = SessionState::Failed;
                error!(response = %other, "DISCONNECT rejected");
                Err(SessionError::ProtocolFault {
                    command: Command::Disconnect.name(),
                    response: other.to_string(),
                })
            }
            Err(e) => {
                self.state = SessionState::Failed;
                error!(error = %e, "DISCONNECT failed");
                Err(e)
            }
        }
    }

    /// Release the channel without a handshake (idempotent)
    pub async fn close(&mut self) {
        self.close_channel().await;
        if self.state != SessionState::Failed {
            self.state = SessionState::Closed;
        }
    }

    async fn close_channel(&mut self) {
        if self.channel_closed {
            return;
        }
        self.channel_closed = true;
        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "Failed to close diagnostic channel");
        }
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: SessionState,
    ) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: self.state.to_string(),
            })
        }
    }
}
