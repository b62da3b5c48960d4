//! flashcheck - Post-flash verification over XCP-on-CAN
//!
//! Confirms that a freshly flashed target answers the XCP handshake,
//! reports its version markers, and transmits every expected periodic
//! message at (at most) its nominal cycle time.

mod config;
mod dbc;
mod output;
mod symbols;

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use flashcheck_can::{
    analyze_capture, create_provider, CaptureLog, ChannelProvider, RunContext, SamplingStrategy,
    VerificationRun, VerifyConfig,
};
use flashcheck_core::{ChannelId, ExpectationLoader, ExpectationSet, ReportSink, VerificationReport};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{AppConfig, Overrides, VariantConfig};
use crate::dbc::DbcLoader;
use crate::output::{FileSink, OutputContext, OutputFormat, Sinks, WriterSink};
use crate::symbols::MapFileResolver;

/// Every expected message passed
const EXIT_PASSED: u8 = 0;
/// At least one message missing or too slow
const EXIT_FAILED: u8 = 1;
/// Handshake, transport or configuration failure
const EXIT_FATAL: u8 = 2;

#[derive(Parser)]
#[command(name = "flashcheck")]
#[command(author, version, about = "Post-flash verification over XCP-on-CAN")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path (default: ./flashcheck.toml)
    #[arg(short, long, env = "FLASHCHECK_CONFIG")]
    config: Option<PathBuf>,

    /// Build variant whose symbols and message databases are used
    #[arg(long, default_value = "default")]
    variant: String,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Also write the report to a file (.json, .csv, otherwise a text table)
    #[arg(long)]
    report: Option<PathBuf>,

    /// Write logs to a file in addition to stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handshake with the target, then check periodic traffic
    Verify {
        /// Skip the XCP handshake and version queries
        #[arg(long)]
        skip_handshake: bool,

        /// Sampling strategy
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,

        /// Observation window in milliseconds
        #[arg(long)]
        window_ms: Option<u64>,

        /// Use the simulated bus instead of the configured transport
        #[arg(long)]
        simulate: bool,

        /// Directory for capture logs
        #[arg(long)]
        capture_dir: Option<PathBuf>,
    },

    /// Handshake and read version markers only
    Versions {
        /// Use the simulated bus instead of the configured transport
        #[arg(long)]
        simulate: bool,
    },

    /// Evaluate a recorded capture log offline
    Analyze {
        /// candump-format capture log
        #[arg(long)]
        capture: PathBuf,

        /// Channel whose expectations apply
        #[arg(long)]
        channel: u8,

        /// Leading occurrences to discard (default from config)
        #[arg(long)]
        discard: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Windowed,
    SingleShot,
}

impl From<StrategyArg> for SamplingStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Windowed => SamplingStrategy::Windowed,
            StrategyArg::SingleShot => SamplingStrategy::SingleShot,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let out = OutputContext::new(cli.output, cli.no_color, cli.quiet);

    if let Err(e) = init_tracing(&cli) {
        out.error(&format!("Error: {:#}", e));
        return ExitCode::from(EXIT_FATAL);
    }

    match run(&cli, &out).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "Verification aborted");
            out.error(&format!("Error: {:#}", e));
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let directives = format!(
        "flashcheck={0},flashcheck_can={0},flashcheck_core={0}",
        default_level
    );
    let filter = if cli.verbose {
        EnvFilter::new(directives)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives))
    };

    let file_layer = match &cli.log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(!cli.no_color)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    Ok(())
}

async fn run(cli: &Cli, out: &OutputContext) -> Result<u8> {
    let mut config = AppConfig::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Verify {
            skip_handshake,
            strategy,
            window_ms,
            simulate,
            capture_dir,
        } => {
            config.apply_overrides(&Overrides {
                strategy: strategy.map(Into::into),
                window_ms: *window_ms,
                simulate: *simulate,
                capture_dir: capture_dir.clone(),
            });
            let variant = config.variant(&cli.variant)?;
            let expectations = load_expectations(variant)?;
            let resolver = load_resolver(variant)?;

            let ctx = RunContext::new(config.verify.monitor.capture_dir.clone());
            out.info(&format!(
                "Run {}: {} message(s) on {} channel(s)",
                ctx.run_id(),
                expectations.len(),
                expectations.channels().count()
            ));

            let provider = provider_for(&config.verify)?;
            let run = VerificationRun::new(ctx, provider, config.verify.clone());
            let mut sinks = report_sinks(cli);
            let report = run
                .execute_into(&expectations, &resolver, *skip_handshake, &mut sinks)
                .await?;

            out.summary(&report);
            Ok(exit_code(&report))
        }

        Commands::Versions { simulate } => {
            config.apply_overrides(&Overrides {
                simulate: *simulate,
                ..Default::default()
            });
            let variant = config.variant(&cli.variant)?;
            let resolver = load_resolver(variant)?;

            let provider = provider_for(&config.verify)?;
            let run = VerificationRun::new(RunContext::new(None), provider, config.verify.clone());
            let versions = run.versions(&resolver).await?;

            out.print_versions(&versions);
            Ok(EXIT_PASSED)
        }

        Commands::Analyze {
            capture,
            channel,
            discard,
        } => {
            let channel = ChannelId::new(*channel).context("Invalid --channel")?;
            let variant = config.variant(&cli.variant)?;
            let expectations = load_expectations(variant)?;
            let log = CaptureLog::load(capture, channel)?;
            out.info(&format!(
                "Analyzing {} frame(s) from {}",
                log.len(),
                capture.display()
            ));

            let ctx = RunContext::new(None);
            let discard = discard.unwrap_or(config.verify.monitor.discard);
            let report = analyze_capture(&ctx, &log, expectations.for_channel(channel), discard);

            report_sinks(cli).emit(&report)?;
            out.summary(&report);
            Ok(exit_code(&report))
        }
    }
}

fn load_expectations(variant: &VariantConfig) -> Result<ExpectationSet> {
    let sources = variant
        .channels
        .iter()
        .map(|c| -> Result<(ChannelId, PathBuf)> {
            Ok((ChannelId::new(c.id)?, c.dbc.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    let raw = DbcLoader::new(sources)
        .load_expectations()
        .context("Failed to load message databases")?;
    Ok(ExpectationSet::build(raw))
}

fn load_resolver(variant: &VariantConfig) -> Result<MapFileResolver> {
    MapFileResolver::load(&variant.symbols, variant.symbol_map.as_deref())
}

fn provider_for(config: &VerifyConfig) -> Result<Arc<dyn ChannelProvider>> {
    let protocol = &config.protocol;
    create_provider(
        &config.transport,
        protocol.request_can_id()?,
        protocol.response_can_id()?,
    )
    .context("Failed to create CAN transport")
}

fn report_sinks(cli: &Cli) -> Sinks {
    let mut sinks = Sinks::default();
    sinks.push(Box::new(WriterSink::new(cli.output, std::io::stdout())));
    if let Some(path) = &cli.report {
        sinks.push(Box::new(FileSink::new(path.clone())));
    }
    sinks
}

fn exit_code(report: &VerificationReport) -> u8 {
    if report.passed() {
        EXIT_PASSED
    } else {
        EXIT_FAILED
    }
}
