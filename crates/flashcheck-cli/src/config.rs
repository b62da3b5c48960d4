//! Configuration file handling for flashcheck

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flashcheck_can::config::{parse_address, SamplingStrategy, TransportConfig, VerifyConfig};
use flashcheck_core::ChannelId;
use serde::{Deserialize, Serialize};

/// Config file used when neither `--config` nor `FLASHCHECK_CONFIG` is given
pub const DEFAULT_CONFIG_FILE: &str = "flashcheck.toml";

/// Configuration for the CLI tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Protocol, monitor and transport settings
    #[serde(flatten)]
    pub verify: VerifyConfig,
    /// Build variants, each with its own symbol table and message databases
    #[serde(default)]
    pub variants: BTreeMap<String, VariantConfig>,
}

/// Inputs of one build variant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantConfig {
    /// Linker map or `nm` output of the flashed image
    #[serde(default)]
    pub symbol_map: Option<PathBuf>,
    /// Explicit symbol addresses, taking precedence over the map file
    #[serde(default)]
    pub symbols: BTreeMap<String, String>,
    /// Message database per channel
    #[serde(default)]
    pub channels: Vec<ChannelSource>,
}

/// A channel and the DBC describing its traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSource {
    pub id: u8,
    pub dbc: PathBuf,
}

impl AppConfig {
    /// Load configuration, falling back to defaults when the implicit file is absent
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load_from(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::load_from(path)
                } else {
                    tracing::warn!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from a specific path
    ///
    /// Relative paths inside the file are resolved against its directory.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        if let Some(dir) = self.verify.monitor.capture_dir.as_mut() {
            join(dir);
        }
        for variant in self.variants.values_mut() {
            if let Some(map) = variant.symbol_map.as_mut() {
                join(map);
            }
            for channel in &mut variant.channels {
                join(&mut channel.dbc);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let protocol = &self.verify.protocol;
        protocol.request_can_id()?;
        protocol.response_can_id()?;
        protocol.channel_id()?;

        for marker in &self.verify.version_markers {
            if marker.size == 0 || marker.size > 7 {
                bail!(
                    "Version marker '{}' has size {}, expected 1..=7",
                    marker.label,
                    marker.size
                );
            }
        }

        for (name, variant) in &self.variants {
            for channel in &variant.channels {
                ChannelId::new(channel.id)
                    .with_context(|| format!("Variant '{}' has an invalid channel", name))?;
            }
            for (symbol, address) in &variant.symbols {
                if parse_address(address).is_none() {
                    bail!(
                        "Variant '{}': symbol {} has invalid address '{}'",
                        name,
                        symbol,
                        address
                    );
                }
            }
        }
        Ok(())
    }

    /// Look up a variant by name
    pub fn variant(&self, name: &str) -> Result<&VariantConfig> {
        match self.variants.get(name) {
            Some(variant) => Ok(variant),
            None => {
                let known: Vec<&str> = self.variants.keys().map(String::as_str).collect();
                if known.is_empty() {
                    bail!("Variant '{}' not found: no variants configured", name)
                }
                bail!(
                    "Variant '{}' not found (available: {})",
                    name,
                    known.join(", ")
                )
            }
        }
    }

    /// Merge CLI arguments over config file values
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        let monitor = &mut self.verify.monitor;
        if let Some(strategy) = overrides.strategy {
            monitor.strategy = strategy;
        }
        if let Some(window_ms) = overrides.window_ms {
            match monitor.strategy {
                SamplingStrategy::Windowed => monitor.window_ms = window_ms,
                SamplingStrategy::SingleShot => monitor.single_shot_window_ms = window_ms,
            }
        }
        if overrides.simulate && !matches!(self.verify.transport, TransportConfig::Simulated(_)) {
            tracing::info!("Using simulated transport with default target");
            self.verify.transport = TransportConfig::Simulated(Default::default());
        }
        if let Some(dir) = &overrides.capture_dir {
            monitor.capture_dir = Some(dir.clone());
        }
    }
}

/// Values given on the command line that replace file settings
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub strategy: Option<SamplingStrategy>,
    pub window_ms: Option<u64>,
    pub simulate: bool,
    pub capture_dir: Option<PathBuf>,
}
