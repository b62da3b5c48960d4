//! End-to-end verification runs against the simulated bus
//!
//! Every test runs on a paused tokio clock, so capture windows and retry
//! delays complete instantly and arrival times are exact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use flashcheck_can::config::{SimulatedReply, VersionMarkerConfig};
use flashcheck_can::{RunContext, RunError, SessionError, SimulatedBus, VerificationRun, VerifyConfig};
use flashcheck_core::{
    CanId, ChannelId, CollaboratorError, ExpectationSet, RawExpectation, ReportSink, Verdict,
    VerificationReport,
};
use pretty_assertions::assert_eq;
use tokio::time::Instant;

const STUB_VERSION_ADDR: u32 = 0x5000_6A34;

fn ch(n: u8) -> ChannelId {
    ChannelId::new(n).unwrap()
}

fn id(raw: u32) -> CanId {
    CanId::new(raw).unwrap()
}

fn raw(channel: u8, identifier: u32, cycle_ms: u32) -> RawExpectation {
    RawExpectation {
        channel: ch(channel),
        identifier,
        cycle_ms,
    }
}

/// Simulated target plus the configuration and symbols of one bench setup
struct Harness {
    bus: SimulatedBus,
    config: VerifyConfig,
    symbols: HashMap<String, u32>,
}

impl Harness {
    fn new() -> Self {
        let bus = SimulatedBus::new(id(0x7E0), id(0x7E1));
        bus.write_memory(STUB_VERSION_ADDR, vec![0x03]);

        let mut config = VerifyConfig::default();
        config.version_markers.push(VersionMarkerConfig {
            label: "Stub version (Main)".to_string(),
            symbol: "StubVersion_Main".to_string(),
            size: 1,
        });

        let symbols = HashMap::from([("StubVersion_Main".to_string(), STUB_VERSION_ADDR)]);

        Self {
            bus,
            config,
            symbols,
        }
    }

    fn periodic(&self, channel: u8, identifier: u32, period_ms: u64) {
        self.bus.add_periodic(
            ch(channel),
            id(identifier),
            Duration::from_millis(period_ms),
            Duration::ZERO,
        );
    }

    fn run(&self) -> VerificationRun {
        VerificationRun::new(
            RunContext::new(None),
            Arc::new(self.bus.clone()),
            self.config.clone(),
        )
    }

    async fn execute(
        &self,
        expectations: &ExpectationSet,
        skip_handshake: bool,
    ) -> Result<VerificationReport, RunError> {
        self.run()
            .execute(expectations, &self.symbols, skip_handshake)
            .await
    }
}

#[derive(Default)]
struct CollectingSink {
    reports: Vec<VerificationReport>,
}

impl ReportSink for CollectingSink {
    fn emit(&mut self, report: &VerificationReport) -> Result<(), CollaboratorError> {
        self.reports.push(report.clone());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_run_reports_periodic_message() {
    let harness = Harness::new();
    harness.periodic(1, 0x123, 45);
    let expectations = ExpectationSet::build([raw(1, 0x123, 50), raw(1, 0x456, 0)]);

    let report = harness.execute(&expectations, false).await.unwrap();

    // The aperiodic 0x456 never makes it into the report
    assert_eq!(report.len(), 1);
    assert!(report.get(ch(1), id(0x456)).is_none());

    let rows = report.rows();
    assert_eq!(
        (rows[0].channel, rows[0].identifier.as_str(), rows[0].result.as_str()),
        (1, "0x123", "Passed")
    );
    assert_eq!(rows[0].observed_cycle_ms, "45");

    assert_eq!(report.versions()[0].value, Some(vec![0x03]));
    assert!(report.passed());
}

#[tokio::test(start_paused = true)]
async fn test_handshake_frames_on_the_wire() {
    let harness = Harness::new();
    let expectations = ExpectationSet::build([raw(1, 0x123, 50)]);

    harness.execute(&expectations, false).await.unwrap();

    let sent: Vec<u8> = harness
        .bus
        .sent_frames()
        .iter()
        .map(|f| f.leading_byte())
        .collect();
    assert_eq!(sent, vec![0xFF, 0xF4, 0xFE]);
    assert_eq!(
        harness.bus.sent_frames()[1].payload(),
        &[0xF4, 0x01, 0x00, 0x00, 0x34, 0x6A, 0x00, 0x50]
    );
}

#[tokio::test(start_paused = true)]
async fn test_repeated_monitoring_is_deterministic() {
    let expectations = ExpectationSet::build([
        raw(1, 0x123, 50),
        raw(1, 0x200, 50),
        raw(2, 0x300, 100),
    ]);

    let mut rows = Vec::new();
    for _ in 0..2 {
        let harness = Harness::new();
        harness.periodic(1, 0x123, 45);
        harness.periodic(1, 0x200, 70);
        harness.periodic(2, 0x300, 100);
        rows.push(harness.execute(&expectations, true).await.unwrap().rows());
    }

    assert_eq!(rows[0], rows[1]);
    let results: Vec<&str> = rows[0].iter().map(|r| r.result.as_str()).collect();
    assert_eq!(results, vec!["Passed", "Failed", "Passed"]);
}

#[tokio::test(start_paused = true)]
async fn test_channel_open_failure_is_scoped() {
    let harness = Harness::new();
    harness.periodic(1, 0x123, 45);
    harness.periodic(2, 0x321, 20);
    harness.bus.fail_channel(ch(2));
    let expectations = ExpectationSet::build([raw(1, 0x123, 50), raw(2, 0x321, 20)]);

    let report = harness.execute(&expectations, true).await.unwrap();

    assert!(report.get(ch(1), id(0x123)).unwrap().verdict.passed());

    let failed = report.get(ch(2), id(0x321)).unwrap();
    assert_eq!(failed.verdict, Verdict::NotReceived);
    assert!(failed.note.as_deref().unwrap().contains("channel unavailable"));
    assert!(!report.passed());
}

#[tokio::test(start_paused = true)]
async fn test_fatal_handshake_aborts_before_monitoring() {
    let mut harness = Harness::new();
    harness.bus.set_handshake_reply(SimulatedReply::Error);
    harness.config.monitor.window_ms = 60_000;
    let expectations = ExpectationSet::build([raw(1, 0x123, 50)]);
    let started = Instant::now();

    let err = harness.execute(&expectations, false).await.unwrap_err();

    assert!(matches!(
        err,
        RunError::Session(SessionError::ProtocolFault { command: "CONNECT", .. })
    ));
    assert_eq!(harness.bus.sent_count(), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_silent_target_times_out() {
    let mut harness = Harness::new();
    harness.bus.set_handshake_reply(SimulatedReply::Silent);
    harness.config.protocol.max_attempts = 3;
    let expectations = ExpectationSet::build([raw(1, 0x123, 50)]);

    let err = harness.execute(&expectations, false).await.unwrap_err();

    assert!(matches!(
        err,
        RunError::Session(SessionError::HandshakeTimeout { attempts: 3, .. })
    ));
    assert_eq!(harness.bus.sent_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_version_does_not_fail_run() {
    let harness = Harness::new();
    harness.bus.set_short_upload_reply(SimulatedReply::Unknown);
    harness.periodic(1, 0x123, 45);
    let expectations = ExpectationSet::build([raw(1, 0x123, 50)]);

    let report = harness.execute(&expectations, false).await.unwrap();

    assert_eq!(report.versions()[0].address, Some(STUB_VERSION_ADDR));
    assert_eq!(report.versions()[0].value, None);
    assert!(report.passed());
}

#[tokio::test(start_paused = true)]
async fn test_parallel_channels_share_one_window() {
    let expectations = ExpectationSet::build([raw(1, 0x123, 50), raw(2, 0x321, 50)]);

    let mut elapsed = Vec::new();
    for parallel in [true, false] {
        let mut harness = Harness::new();
        harness.periodic(1, 0x123, 45);
        harness.periodic(2, 0x321, 45);
        harness.config.monitor.parallel = parallel;

        let started = Instant::now();
        let report = harness.execute(&expectations, true).await.unwrap();
        elapsed.push(started.elapsed());
        assert!(report.passed());
    }

    assert_eq!(elapsed, vec![Duration::from_secs(5), Duration::from_secs(10)]);
}

#[tokio::test(start_paused = true)]
async fn test_execute_into_emits_report() {
    let harness = Harness::new();
    harness.periodic(1, 0x123, 45);
    let expectations = ExpectationSet::build([raw(1, 0x123, 50)]);
    let mut sink = CollectingSink::default();

    let report = harness
        .run()
        .execute_into(&expectations, &harness.symbols, true, &mut sink)
        .await
        .unwrap();

    assert_eq!(sink.reports, vec![report]);
}

#[tokio::test(start_paused = true)]
async fn test_capture_saved_per_channel() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    harness.periodic(1, 0x123, 45);
    let expectations = ExpectationSet::build([raw(1, 0x123, 50)]);

    let ctx = RunContext::new(Some(dir.path().to_path_buf()));
    let run = VerificationRun::new(ctx.clone(), Arc::new(harness.bus.clone()), harness.config.clone());
    let live = run.execute(&expectations, &harness.symbols, true).await.unwrap();

    let path = ctx.capture_path(ch(1)).unwrap();
    assert!(path.exists());

    let log = flashcheck_can::CaptureLog::load(&path, ch(1)).unwrap();
    let offline = flashcheck_can::analyze_capture(&ctx, &log, expectations.for_channel(ch(1)), 4);
    assert_eq!(offline.rows(), live.rows());
}
