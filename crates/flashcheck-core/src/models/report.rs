//! Verdicts and the verification report

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CanId, ChannelId, ExpectedMessage};

/// Outcome of observing one expected message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    /// Message absent (or too few occurrences) in the observation window
    NotReceived,
    /// Message seen; `passed` iff the observed cycle is within the nominal one
    Received { observed_cycle_ms: u32, passed: bool },
}

impl Verdict {
    /// Classify an observed cycle time against the nominal one
    pub fn classify(observed_cycle_ms: u32, expected_cycle_ms: u32) -> Self {
        Self::Received {
            observed_cycle_ms,
            passed: observed_cycle_ms <= expected_cycle_ms,
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, Self::Received { passed: true, .. })
    }

    pub fn received(&self) -> bool {
        matches!(self, Self::Received { .. })
    }

    pub fn observed_cycle_ms(&self) -> Option<u32> {
        match self {
            Self::Received {
                observed_cycle_ms, ..
            } => Some(*observed_cycle_ms),
            Self::NotReceived => None,
        }
    }
}

/// Key of a report row
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReportKey {
    pub channel: ChannelId,
    pub identifier: CanId,
}

impl From<&ExpectedMessage> for ReportKey {
    fn from(msg: &ExpectedMessage) -> Self {
        Self {
            channel: msg.channel,
            identifier: msg.identifier,
        }
    }
}

/// Verdict plus the context a reviewer needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub expected_cycle_ms: u32,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A version marker read from the target (absent when the query failed)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMarker {
    pub label: String,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<u8>>,
}

/// Aggregated results of one verification run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    run_id: Uuid,
    versions: Vec<VersionMarker>,
    entries: BTreeMap<ReportKey, ReportEntry>,
}

impl VerificationReport {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            versions: Vec::new(),
            entries: BTreeMap::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn set_versions(&mut self, versions: Vec<VersionMarker>) {
        self.versions = versions;
    }

    pub fn versions(&self) -> &[VersionMarker] {
        &self.versions
    }

    /// Record the verdict for an expected message (later inserts replace earlier ones)
    pub fn insert(&mut self, msg: &ExpectedMessage, verdict: Verdict, note: Option<String>) {
        self.entries.insert(
            ReportKey::from(msg),
            ReportEntry {
                expected_cycle_ms: msg.expected_cycle_ms,
                verdict,
                note,
            },
        );
    }

    /// Fold another partial report (e.g. from one channel) into this one
    pub fn merge(&mut self, other: VerificationReport) {
        self.entries.extend(other.entries);
    }

    pub fn get(&self, channel: ChannelId, identifier: CanId) -> Option<&ReportEntry> {
        self.entries.get(&ReportKey {
            channel,
            identifier,
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ReportKey, &ReportEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when every expected message was received within its cycle time
    pub fn passed(&self) -> bool {
        self.entries.values().all(|e| e.verdict.passed())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ReportKey, &ReportEntry)> {
        self.entries.iter().filter(|(_, e)| !e.verdict.passed())
    }

    /// Flatten into table rows, ordered by channel then identifier
    pub fn rows(&self) -> Vec<ReportRow> {
        self.entries
            .iter()
            .map(|(key, entry)| ReportRow::new(key, entry))
            .collect()
    }
}

/// One row of the persisted report table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub channel: u8,
    pub identifier: String,
    pub expected_cycle_ms: u32,
    pub observed_cycle_ms: String,
    pub received: bool,
    pub result: String,
    pub note: String,
}

impl ReportRow {
    fn new(key: &ReportKey, entry: &ReportEntry) -> Self {
        let result = match entry.verdict {
            Verdict::NotReceived => "N/A",
            Verdict::Received { passed: true, .. } => "Passed",
            Verdict::Received { passed: false, .. } => "Failed",
        };
        Self {
            channel: key.channel.get(),
            identifier: key.identifier.to_string(),
            expected_cycle_ms: entry.expected_cycle_ms,
            observed_cycle_ms: entry
                .verdict
                .observed_cycle_ms()
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "N/A".to_string()),
            received: entry.verdict.received(),
            result: result.to_string(),
            note: entry.note.clone().unwrap_or_default(),
        }
    }
}
