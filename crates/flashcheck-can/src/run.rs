//! Verification run orchestration
//!
//! A run performs the XCP handshake on the diagnostic channel, reads the
//! version markers, disconnects, and then monitors every channel named by the
//! expectation set. A fatal handshake error ends the run before monitoring.

use std::sync::Arc;

use flashcheck_core::{
    ChannelId, ExpectationSet, ReportSink, SymbolResolver, VerificationReport, VersionMarker,
};
use futures::future::join_all;
use tracing::{error, info, Instrument};

use crate::config::VerifyConfig;
use crate::context::RunContext;
use crate::error::{RunError, SessionError};
use crate::monitor::TrafficMonitor;
use crate::transport::{ChannelProvider, IdFilter};
use crate::xcp::{DiagnosticSession, TransactPolicy};

/// One end-to-end verification of a freshly flashed target
pub struct VerificationRun {
    ctx: RunContext,
    provider: Arc<dyn ChannelProvider>,
    config: VerifyConfig,
}

impl VerificationRun {
    pub fn new(ctx: RunContext, provider: Arc<dyn ChannelProvider>, config: VerifyConfig) -> Self {
        Self {
            ctx,
            provider,
            config,
        }
    }

    /// Handshake (unless skipped), then monitor every expected channel
    pub async fn execute(
        &self,
        expectations: &ExpectationSet,
        resolver: &dyn SymbolResolver,
        skip_handshake: bool,
    ) -> Result<VerificationReport, RunError> {
        let span = self.ctx.span().clone();

        async move {
            info!(
                channels = expectations.channels().count(),
                messages = expectations.len(),
                skip_handshake,
                "Verification run started"
            );

            let mut report = VerificationReport::new(self.ctx.run_id());

            if !skip_handshake {
                let versions = self.handshake(resolver).await?;
                report.set_versions(versions);
            }

            report.merge(self.monitor_all(expectations).await);

            info!(
                messages = report.len(),
                failures = report.failures().count(),
                passed = report.passed(),
                "Verification run finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Run and hand the report to `sink`
    pub async fn execute_into(
        &self,
        expectations: &ExpectationSet,
        resolver: &dyn SymbolResolver,
        skip_handshake: bool,
        sink: &mut dyn ReportSink,
    ) -> Result<VerificationReport, RunError> {
        let report = self.execute(expectations, resolver, skip_handshake).await?;
        sink.emit(&report)?;
        Ok(report)
    }

    /// Handshake and version queries only
    pub async fn versions(
        &self,
        resolver: &dyn SymbolResolver,
    ) -> Result<Vec<VersionMarker>, RunError> {
        let span = self.ctx.span().clone();
        self.handshake(resolver).instrument(span).await
    }

    async fn handshake(&self, resolver: &dyn SymbolResolver) -> Result<Vec<VersionMarker>, RunError> {
        let protocol = &self.config.protocol;
        let channel_id = protocol.channel_id()?;
        let request_id = protocol.request_can_id()?;
        let response_id = protocol.response_can_id()?;

        let channel = self
            .provider
            .open(channel_id, Some(IdFilter::exact(response_id)))
            .await?;
        let mut session = DiagnosticSession::new(
            &self.ctx,
            channel,
            request_id,
            response_id,
            TransactPolicy::from(protocol),
        );

        let outcome: Result<Vec<VersionMarker>, SessionError> = async {
            session.connect().await?;
            let versions = session
                .query_version_markers(&self.config.version_markers, resolver)
                .await?;
            session.disconnect().await?;
            Ok(versions)
        }
        .await;

        // No-op after a successful disconnect
        session.close().await;

        outcome.map_err(|e| {
            error!(channel = %channel_id, error = %e, "Handshake failed, aborting run");
            RunError::from(e)
        })
    }

    async fn monitor_all(&self, expectations: &ExpectationSet) -> VerificationReport {
        let monitor = TrafficMonitor::new(
            self.ctx.clone(),
            self.provider.clone(),
            self.config.monitor.clone(),
        );
        let channels: Vec<ChannelId> = expectations.channels().collect();
        let mut report = VerificationReport::new(self.ctx.run_id());

        if self.config.monitor.parallel {
            let partials = join_all(
                channels
                    .iter()
                    .map(|&channel| monitor.run(channel, expectations.for_channel(channel))),
            )
            .await;
            for partial in partials {
                report.merge(partial);
            }
        } else {
            for channel in channels {
                report.merge(monitor.run(channel, expectations.for_channel(channel)).await);
            }
        }

        report
    }
}
