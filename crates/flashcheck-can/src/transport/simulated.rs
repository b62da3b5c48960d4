//! Simulated bus for testing and bench-less dry runs
//!
//! Models an XCP slave answering on the response identifier plus any
//! number of periodic transmitters. Time is taken from the tokio clock, so
//! tests running with a paused clock see exact, reproducible arrival times.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flashcheck_core::{CanId, ChannelId, Frame};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use super::{CanChannel, ChannelProvider, IdFilter, TransportError};
use crate::config::{parse_address, parse_can_id, SimulatedConfig, SimulatedReply};
use crate::xcp::{error_code, opcode, pid};

/// Simulated CAN bus with an in-process target
#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<BusState>,
}

struct BusState {
    request_id: CanId,
    response_id: CanId,
    latency: Duration,
    epoch: Instant,
    target: RwLock<TargetModel>,
    sources: RwLock<Vec<PeriodicTx>>,
    fail_channels: RwLock<HashSet<ChannelId>>,
    sent: Mutex<Vec<Frame>>,
}

#[derive(Default)]
struct TargetModel {
    handshake: SimulatedReply,
    short_upload: SimulatedReply,
    memory: HashMap<u32, Vec<u8>>,
    /// Commands left to swallow before answering
    ignore_remaining: u32,
}

#[derive(Debug, Clone)]
struct PeriodicTx {
    channel: ChannelId,
    id: CanId,
    period: Duration,
    offset: Duration,
}

impl SimulatedBus {
    pub fn new(request_id: CanId, response_id: CanId) -> Self {
        Self::with_latency(request_id, response_id, Duration::ZERO)
    }

    /// Bus whose target answers `latency` after each command
    pub fn with_latency(request_id: CanId, response_id: CanId, latency: Duration) -> Self {
        Self {
            state: Arc::new(BusState {
                request_id,
                response_id,
                latency,
                epoch: Instant::now(),
                target: RwLock::new(TargetModel::default()),
                sources: RwLock::new(Vec::new()),
                fail_channels: RwLock::new(HashSet::new()),
                sent: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Build a bus from configuration
    pub fn from_config(
        config: &SimulatedConfig,
        request_id: CanId,
        response_id: CanId,
    ) -> Result<Self, TransportError> {
        let bus = Self::with_latency(
            request_id,
            response_id,
            Duration::from_millis(config.latency_ms),
        );

        bus.set_handshake_reply(config.handshake);
        bus.set_short_upload_reply(config.short_upload);

        for cell in &config.memory {
            let address = parse_address(&cell.address).ok_or_else(|| {
                TransportError::InvalidConfig(format!("Invalid address '{}'", cell.address))
            })?;
            bus.write_memory(address, cell.value.clone());
        }

        for source in &config.periodic {
            let channel = channel_from_u8(source.channel)?;
            if source.period_ms == 0 {
                return Err(TransportError::InvalidConfig(format!(
                    "Periodic source {} has zero period",
                    source.id
                )));
            }
            bus.add_periodic(
                channel,
                parse_can_id(&source.id)?,
                Duration::from_millis(source.period_ms),
                Duration::from_millis(source.offset_ms),
            );
        }

        for &channel in &config.fail_channels {
            bus.fail_channel(channel_from_u8(channel)?);
        }

        Ok(bus)
    }

    /// Add a transmitter emitting `id` every `period`, first at `offset` after bus creation
    pub fn add_periodic(&self, channel: ChannelId, id: CanId, period: Duration, offset: Duration) {
        self.state.sources.write().push(PeriodicTx {
            channel,
            id,
            period,
            offset,
        });
    }

    pub fn set_handshake_reply(&self, reply: SimulatedReply) {
        self.state.target.write().handshake = reply;
    }

    pub fn set_short_upload_reply(&self, reply: SimulatedReply) {
        self.state.target.write().short_upload = reply;
    }

    pub fn write_memory(&self, address: u32, value: Vec<u8>) {
        self.state.target.write().memory.insert(address, value);
    }

    /// Swallow the next `count` commands without answering
    pub fn ignore_commands(&self, count: u32) {
        self.state.target.write().ignore_remaining = count;
    }

    /// Make `open` fail for a channel
    pub fn fail_channel(&self, channel: ChannelId) {
        self.state.fail_channels.write().insert(channel);
    }

    /// All frames sent by the master so far
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.state.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.sent.lock().len()
    }
}

impl BusState {
    fn respond(&self, request: &[u8; 8]) -> Option<[u8; 8]> {
        let mut target = self.target.write();
        if target.ignore_remaining > 0 {
            target.ignore_remaining -= 1;
            return None;
        }

        let reply = match request[0] {
            opcode::CONNECT | opcode::DISCONNECT => target.handshake,
            opcode::SHORT_UPLOAD => target.short_upload,
            _ => SimulatedReply::Unknown,
        };

        match reply {
            SimulatedReply::Silent => None,
            SimulatedReply::Unknown => Some([pid::CMD_UNKNOWN, 0, 0, 0, 0, 0, 0, 0]),
            SimulatedReply::Error => Some([pid::ERR, error_code::GENERIC, 0, 0, 0, 0, 0, 0]),
            SimulatedReply::Positive => match request[0] {
                // RESOURCE=CAL/PAG|DAQ, COMM_MODE_BASIC=Intel, MAX_CTO=8, MAX_DTO=8, versions 1/1
                opcode::CONNECT => Some([pid::RES, 0x05, 0x00, 0x08, 0x08, 0x00, 0x01, 0x01]),
                opcode::DISCONNECT => Some([pid::RES, 0, 0, 0, 0, 0, 0, 0]),
                _ => Some(target.short_upload(request)),
            },
        }
    }
}

impl TargetModel {
    fn short_upload(&self, request: &[u8; 8]) -> [u8; 8] {
        let size = usize::from(request[1]);
        let address = u32::from_le_bytes([request[4], request[5], request[6], request[7]]);

        let found = self.memory.iter().find_map(|(&base, value)| {
            let start = address.checked_sub(base)? as usize;
            value.get(start..start + size)
        });

        match found {
            Some(bytes) if size <= 7 => {
                let mut response = [0u8; 8];
                response[0] = pid::RES;
                response[1..=size].copy_from_slice(bytes);
                response
            }
            _ => [pid::ERR, error_code::OUT_OF_RANGE, 0, 0, 0, 0, 0, 0],
        }
    }
}

#[async_trait]
impl ChannelProvider for SimulatedBus {
    async fn open(
        &self,
        channel: ChannelId,
        filter: Option<IdFilter>,
    ) -> Result<Box<dyn CanChannel>, TransportError> {
        if self.state.fail_channels.read().contains(&channel) {
            return Err(TransportError::OpenFailed {
                channel: channel.get(),
                reason: "simulated open failure".to_string(),
            });
        }

        let now = Instant::now();
        let cursors = self
            .state
            .sources
            .read()
            .iter()
            .filter(|tx| tx.channel == channel)
            .filter(|tx| filter.map_or(true, |f| f.matches(tx.id)))
            .map(|tx| Cursor {
                next: first_emission_at_or_after(tx, self.state.epoch, now),
                tx: tx.clone(),
            })
            .collect();

        tracing::debug!(%channel, ?filter, "Simulated channel opened");

        Ok(Box::new(SimulatedChannel {
            channel,
            filter,
            state: self.state.clone(),
            inbox: Mutex::new(VecDeque::new()),
            cursors: Mutex::new(cursors),
            closed: AtomicBool::new(false),
        }))
    }
}

struct Cursor {
    tx: PeriodicTx,
    /// Index of the next transmission
    next: u64,
}

impl Cursor {
    /// `None` once the schedule runs past what `Instant` can represent
    fn due(&self, epoch: Instant) -> Option<Instant> {
        let nanos = self.tx.period.as_nanos().checked_mul(u128::from(self.next))?;
        let step = Duration::from_nanos(u64::try_from(nanos).ok()?);
        epoch.checked_add(self.tx.offset)?.checked_add(step)
    }
}

fn first_emission_at_or_after(tx: &PeriodicTx, epoch: Instant, now: Instant) -> u64 {
    let first = epoch + tx.offset;
    if now <= first {
        return 0;
    }
    let elapsed = (now - first).as_nanos();
    let period = tx.period.as_nanos().max(1);
    elapsed.div_ceil(period) as u64
}

enum Next {
    Inbox,
    Periodic(usize),
}

/// One open endpoint on the simulated bus
pub struct SimulatedChannel {
    channel: ChannelId,
    filter: Option<IdFilter>,
    state: Arc<BusState>,
    /// Responses with their delivery time
    inbox: Mutex<VecDeque<(Instant, Frame)>>,
    cursors: Mutex<Vec<Cursor>>,
    closed: AtomicBool,
}

impl SimulatedChannel {
    fn next_event(&self) -> Option<(Instant, Next)> {
        let inbox = self.inbox.lock().front().map(|(at, _)| (*at, Next::Inbox));
        let periodic = self
            .cursors
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(idx, c)| Some((c.due(self.state.epoch)?, Next::Periodic(idx))))
            .min_by_key(|(at, _)| *at);

        match (inbox, periodic) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (a, b) => a.or(b),
        }
    }

    fn take(&self, next: Next) -> Option<Frame> {
        match next {
            Next::Inbox => self.inbox.lock().pop_front().map(|(_, frame)| frame),
            Next::Periodic(idx) => {
                let mut cursors = self.cursors.lock();
                let cursor = cursors.get_mut(idx)?;
                // Rolling counter in byte 0
                let counter = (cursor.next & 0xFF) as u8;
                cursor.next += 1;
                Frame::new(self.channel, cursor.tx.id, &[counter]).ok()
            }
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl CanChannel for SimulatedChannel {
    fn channel(&self) -> ChannelId {
        self.channel
    }

    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state.sent.lock().push(*frame);
        tracing::debug!(id = %frame.identifier(), payload = ?frame.payload(), "Simulated bus: sent frame");

        if frame.identifier() != self.state.request_id {
            return Ok(());
        }

        if let Some(payload) = self.state.respond(frame.payload()) {
            let response = Frame::from_payload(self.channel, self.state.response_id, payload);
            if self.filter.map_or(true, |f| f.matches(response.identifier())) {
                let at = Instant::now() + self.state.latency;
                self.inbox.lock().push_back((at, response));
            }
        }
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;

        match self.next_event() {
            Some((at, next)) if at <= deadline => {
                tokio::time::sleep_until(at).await;
                Ok(self.take(next))
            }
            _ => {
                tokio::time::sleep_until(deadline).await;
                Ok(None)
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn channel_from_u8(channel: u8) -> Result<ChannelId, TransportError> {
    ChannelId::new(channel).map_err(|e| TransportError::InvalidConfig(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (CanId, CanId) {
        (CanId::new(0x7E0).unwrap(), CanId::new(0x7E1).unwrap())
    }

    fn ch(n: u8) -> ChannelId {
        ChannelId::new(n).unwrap()
    }

    fn cursor(period: Duration, next: u64) -> Cursor {
        let (req, _) = ids();
        Cursor {
            tx: PeriodicTx {
                channel: ch(1),
                id: req,
                period,
                offset: Duration::ZERO,
            },
            next,
        }
    }

    #[test]
    fn test_due_handles_large_transmission_counts() {
        let epoch = Instant::now();

        assert_eq!(
            cursor(Duration::from_millis(10), 3).due(epoch),
            Some(epoch + Duration::from_millis(30))
        );
        // Beyond u32::MAX transmissions
        assert_eq!(
            cursor(Duration::from_nanos(1), 1 << 33).due(epoch),
            Some(epoch + Duration::from_nanos(1 << 33))
        );
        assert_eq!(cursor(Duration::from_millis(10), u64::MAX).due(epoch), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gets_positive_response() {
        let (req, res) = ids();
        let bus = SimulatedBus::new(req, res);
        let channel = bus.open(ch(1), None).await.unwrap();

        let connect = Frame::new(ch(1), req, &[opcode::CONNECT]).unwrap();
        channel.send(&connect).await.unwrap();

        let reply = channel
            .receive(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.identifier(), res);
        assert_eq!(reply.leading_byte(), pid::RES);
        assert_eq!(bus.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_arrivals_follow_period() {
        let (req, res) = ids();
        let bus = SimulatedBus::new(req, res);
        let id = CanId::new(0x123).unwrap();
        bus.add_periodic(ch(1), id, Duration::from_millis(45), Duration::ZERO);

        let channel = bus.open(ch(1), None).await.unwrap();
        let mut stamps = Vec::new();
        for _ in 0..3 {
            let frame = channel
                .receive(Duration::from_millis(100))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame.identifier(), id);
            stamps.push(Instant::now());
        }

        assert_eq!(stamps[1] - stamps[0], Duration::from_millis(45));
        assert_eq!(stamps[2] - stamps[1], Duration::from_millis(45));
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_hides_other_identifiers() {
        let (req, res) = ids();
        let bus = SimulatedBus::new(req, res);
        bus.add_periodic(ch(1), CanId::new(0x100).unwrap(), Duration::from_millis(10), Duration::ZERO);

        let filter = IdFilter::exact(CanId::new(0x200).unwrap());
        let channel = bus.open(ch(1), Some(filter)).await.unwrap();

        let frame = channel.receive(Duration::from_millis(100)).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_upload_reads_memory() {
        let (req, res) = ids();
        let bus = SimulatedBus::new(req, res);
        bus.write_memory(0x5000_6A34, vec![3, 7]);
        let channel = bus.open(ch(1), None).await.unwrap();

        let upload = Frame::new(ch(1), req, &[opcode::SHORT_UPLOAD, 1, 0, 0, 0x35, 0x6A, 0x00, 0x50]);
        channel.send(&upload.unwrap()).await.unwrap();
        let reply = channel.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(reply.payload()[..2], [pid::RES, 7]);

        let unmapped = Frame::new(ch(1), req, &[opcode::SHORT_UPLOAD, 1, 0, 0, 0, 0, 0, 0x10]);
        channel.send(&unmapped.unwrap()).await.unwrap();
        let reply = channel.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(reply.payload()[..2], [pid::ERR, error_code::OUT_OF_RANGE]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_rejects_io() {
        let (req, res) = ids();
        let bus = SimulatedBus::new(req, res);
        let channel = bus.open(ch(1), None).await.unwrap();
        channel.close().await.unwrap();

        assert!(matches!(
            channel.receive(Duration::from_millis(1)).await,
            Err(TransportError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_fail_channel() {
        let (req, res) = ids();
        let bus = SimulatedBus::new(req, res);
        bus.fail_channel(ch(2));

        assert!(bus.open(ch(1), None).await.is_ok());
        assert!(matches!(
            bus.open(ch(2), None).await,
            Err(TransportError::OpenFailed { channel: 2, .. })
        ));
    }
}
