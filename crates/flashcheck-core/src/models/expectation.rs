//! Expected periodic messages

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CanId, ChannelId};
use crate::collaborators::RawExpectation;

/// A message that must appear on a channel at (at most) its nominal cycle time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedMessage {
    pub channel: ChannelId,
    pub identifier: CanId,
    pub expected_cycle_ms: u32,
}

/// The read-only set of expected messages for one run, grouped by channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectationSet {
    by_channel: BTreeMap<ChannelId, Vec<ExpectedMessage>>,
}

impl ExpectationSet {
    /// Build the set in a single pass over loader output.
    ///
    /// Aperiodic entries (cycle 0) are dropped, as are identifiers that do
    /// not fit a standard frame. The first entry for a `(channel, id)` wins.
    pub fn build(raw: impl IntoIterator<Item = RawExpectation>) -> Self {
        let mut seen = HashSet::new();
        let mut by_channel: BTreeMap<ChannelId, Vec<ExpectedMessage>> = BTreeMap::new();

        for entry in raw {
            if entry.cycle_ms == 0 {
                debug!(
                    channel = %entry.channel,
                    id = format!("0x{:X}", entry.identifier),
                    "Skipping aperiodic message"
                );
                continue;
            }

            let Ok(identifier) = CanId::new(entry.identifier) else {
                warn!(
                    channel = %entry.channel,
                    id = format!("0x{:X}", entry.identifier),
                    "Skipping message with non-standard identifier"
                );
                continue;
            };

            if !seen.insert((entry.channel, identifier)) {
                warn!(
                    channel = %entry.channel,
                    id = %identifier,
                    "Duplicate expectation, keeping first cycle time"
                );
                continue;
            }

            by_channel
                .entry(entry.channel)
                .or_default()
                .push(ExpectedMessage {
                    channel: entry.channel,
                    identifier,
                    expected_cycle_ms: entry.cycle_ms,
                });
        }

        Self { by_channel }
    }

    /// Channels with at least one expected message, in ascending order
    pub fn channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.by_channel.keys().copied()
    }

    pub fn for_channel(&self, channel: ChannelId) -> &[ExpectedMessage] {
        self.by_channel
            .get(&channel)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExpectedMessage> {
        self.by_channel.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_channel.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }
}
