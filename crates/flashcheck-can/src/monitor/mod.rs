//! Periodic traffic monitor
//!
//! Observes one channel and estimates the cycle time of each expected
//! message. Two strategies are available:
//! - single-shot: one filtered window per identifier, gap between the first
//!   two arrivals
//! - windowed: one capture of the whole channel, mean gap once the start-up
//!   occurrences are discarded
//!
//! Failures are scoped to the channel: a transport error turns that
//! channel's entries into `NotReceived` with a note and never aborts the run.

pub mod capture;
pub mod estimate;

pub use capture::{CaptureLog, CaptureRecord};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flashcheck_core::{CanId, ChannelId, ExpectedMessage, Verdict, VerificationReport};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::config::{MonitorConfig, SamplingStrategy};
use crate::context::RunContext;
use crate::error::MonitorError;
use crate::transport::{CanChannel, ChannelProvider, IdFilter};

/// Watches channels for the expected periodic messages
pub struct TrafficMonitor {
    ctx: RunContext,
    provider: Arc<dyn ChannelProvider>,
    config: MonitorConfig,
}

impl TrafficMonitor {
    pub fn new(ctx: RunContext, provider: Arc<dyn ChannelProvider>, config: MonitorConfig) -> Self {
        Self {
            ctx,
            provider,
            config,
        }
    }

    /// Observe `channel` and produce one entry per expected message
    pub async fn run(&self, channel: ChannelId, expected: &[ExpectedMessage]) -> VerificationReport {
        let span = tracing::info_span!(parent: self.ctx.span(), "monitor", %channel);

        async move {
            info!(
                messages = expected.len(),
                strategy = ?self.config.strategy,
                "Monitoring channel"
            );
            let report = match self.config.strategy {
                SamplingStrategy::SingleShot => self.run_single_shot(channel, expected).await,
                SamplingStrategy::Windowed => self.run_windowed(channel, expected).await,
            };
            info!(
                passed = report.entries().filter(|(_, e)| e.verdict.passed()).count(),
                failed = report.failures().count(),
                "Channel monitoring finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn run_single_shot(
        &self,
        channel: ChannelId,
        expected: &[ExpectedMessage],
    ) -> VerificationReport {
        let window = self.config.single_shot_window();
        let mut log = CaptureLog::new(channel, Utc::now());
        let origin = Instant::now();
        let mut outcomes = Vec::with_capacity(expected.len());

        for msg in expected {
            let observation = self
                .first_arrivals(channel, msg.identifier, window, origin, &mut log)
                .await;
            let outcome = match observation {
                Ok(arrivals) => match estimate::single_shot_cycle(&arrivals) {
                    Some(observed) => {
                        let verdict = Verdict::classify(observed, msg.expected_cycle_ms);
                        let note = (!verdict.passed()).then(|| {
                            format!(
                                "observed {} ms exceeds {} ms",
                                observed, msg.expected_cycle_ms
                            )
                        });
                        Observation::Sampled(verdict, note)
                    }
                    None => Observation::Sampled(
                        Verdict::NotReceived,
                        Some(format!(
                            "{} arrival(s) in {} ms window, need 2",
                            arrivals.len(),
                            window.as_millis()
                        )),
                    ),
                },
                Err(e) => {
                    warn!(id = %msg.identifier, error = %e, "Single-shot observation failed");
                    Observation::Unavailable(format!("channel unavailable: {}", e))
                }
            };
            outcomes.push((msg, outcome));
        }

        self.persist(channel, &mut log);
        let artifact = artifact_suffix(&log);

        let mut report = VerificationReport::new(self.ctx.run_id());
        for (msg, outcome) in outcomes {
            let (verdict, note) = match outcome {
                Observation::Sampled(verdict, note) => {
                    (verdict, note.map(|n| format!("{}{}", n, artifact)))
                }
                Observation::Unavailable(note) => (Verdict::NotReceived, Some(note)),
            };
            debug!(id = %msg.identifier, ?verdict, "Message classified");
            report.insert(msg, verdict, note);
        }

        report
    }

    /// Offsets of the first two arrivals of `id` within `window`
    ///
    /// Every accepted frame is also recorded in `log`, offset from `origin`.
    async fn first_arrivals(
        &self,
        channel: ChannelId,
        id: CanId,
        window: Duration,
        origin: Instant,
        log: &mut CaptureLog,
    ) -> Result<Vec<Duration>, MonitorError> {
        let handle = self.provider.open(channel, Some(IdFilter::exact(id))).await?;

        let started = Instant::now();
        let deadline = started + window;
        let mut arrivals = Vec::with_capacity(2);

        let result = async {
            while arrivals.len() < 2 {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                if let Some(frame) = handle.receive(remaining).await? {
                    // Filters are best effort
                    if frame.identifier() == id {
                        arrivals.push(started.elapsed());
                        log.push(origin.elapsed(), frame);
                    }
                }
            }
            Ok::<_, MonitorError>(())
        }
        .await;

        close_quietly(handle.as_ref()).await;
        result.map(|()| arrivals)
    }

    async fn run_windowed(
        &self,
        channel: ChannelId,
        expected: &[ExpectedMessage],
    ) -> VerificationReport {
        let mut log = match self.capture(channel).await {
            Ok(log) => log,
            Err(e) => {
                warn!(error = %e, "Capture failed, channel entries marked not received");
                let mut report = VerificationReport::new(self.ctx.run_id());
                for msg in expected {
                    report.insert(
                        msg,
                        Verdict::NotReceived,
                        Some(format!("channel unavailable: {}", e)),
                    );
                }
                return report;
            }
        };

        if log.is_empty() {
            warn!("No frames captured on channel");
        } else {
            debug!(frames = log.len(), "Capture window closed");
        }

        self.persist(channel, &mut log);
        analyze_capture(&self.ctx, &log, expected, self.config.discard)
    }

    /// Save `log` under the run's capture directory, if it has one
    fn persist(&self, channel: ChannelId, log: &mut CaptureLog) {
        if let Some(path) = self.ctx.capture_path(channel) {
            if let Err(e) = log.save(&path) {
                warn!(error = %e, "Failed to save capture log");
            }
        }
    }

    /// Record every frame on `channel` for the configured window
    async fn capture(&self, channel: ChannelId) -> Result<CaptureLog, MonitorError> {
        let handle = self.provider.open(channel, None).await?;
        let result = record_window(handle.as_ref(), channel, self.config.window()).await;
        close_quietly(handle.as_ref()).await;
        result
    }
}

async fn record_window(
    handle: &dyn CanChannel,
    channel: ChannelId,
    window: Duration,
) -> Result<CaptureLog, MonitorError> {
    let started = Instant::now();
    let deadline = started + window;
    let mut log = CaptureLog::new(channel, Utc::now());

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        if let Some(frame) = handle.receive(remaining).await? {
            log.push(started.elapsed(), frame);
        }
    }

    Ok(log)
}

/// Outcome of one single-shot observation, before the artifact is known
enum Observation {
    Sampled(Verdict, Option<String>),
    Unavailable(String),
}

/// Note suffix naming the capture file behind a verdict
fn artifact_suffix(log: &CaptureLog) -> String {
    match log.path() {
        Some(path) => format!("; capture: {}", path.display()),
        None => "; capture not saved".to_string(),
    }
}

async fn close_quietly(handle: &dyn CanChannel) {
    if let Err(e) = handle.close().await {
        warn!(channel = %handle.channel(), error = %e, "Failed to close channel");
    }
}

/// Run the windowed estimation over a recorded capture
///
/// Used both for live windows and for offline analysis of a saved log, so
/// the same input always yields the same verdicts.
pub fn analyze_capture(
    ctx: &RunContext,
    log: &CaptureLog,
    expected: &[ExpectedMessage],
    discard: usize,
) -> VerificationReport {
    let mut report = VerificationReport::new(ctx.run_id());
    let artifact = artifact_suffix(log);

    for msg in expected {
        let stamps = log.timestamps_for(msg.identifier);

        let (verdict, note) = match estimate::windowed_cycle(&stamps, discard) {
            Some(observed) => {
                let verdict = Verdict::classify(observed, msg.expected_cycle_ms);
                let note = (!verdict.passed()).then(|| {
                    format!(
                        "observed {} ms exceeds {} ms{}",
                        observed, msg.expected_cycle_ms, artifact
                    )
                });
                (verdict, note)
            }
            None => (
                Verdict::NotReceived,
                Some(format!(
                    "{} occurrence(s) captured, need {}{}",
                    stamps.len(),
                    estimate::min_occurrences(discard),
                    artifact
                )),
            ),
        };

        debug!(id = %msg.identifier, occurrences = stamps.len(), ?verdict, "Message classified");
        report.insert(msg, verdict, note);
    }

    report
}
