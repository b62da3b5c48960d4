//! Collaborator traits - the seams between the verification core and its
//! inputs/outputs (symbol tables, message databases, report writers)

use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::models::{ChannelId, VerificationReport};

/// One raw `(channel, identifier, cycle_ms)` tuple as read from a message database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawExpectation {
    pub channel: ChannelId,
    /// Unvalidated identifier; may not fit 11 bits
    pub identifier: u32,
    /// Nominal cycle time; 0 marks an aperiodic message
    pub cycle_ms: u32,
}

/// Looks up target memory addresses by symbol name
pub trait SymbolResolver: Send + Sync {
    /// Returns the 32-bit address of `name`, or `None` when unknown
    fn resolve(&self, name: &str) -> Option<u32>;
}

/// Produces raw expectations for the channels of one run
pub trait ExpectationLoader {
    fn load_expectations(&self) -> Result<Vec<RawExpectation>, CollaboratorError>;
}

/// Receives the final report
pub trait ReportSink {
    fn emit(&mut self, report: &VerificationReport) -> Result<(), CollaboratorError>;
}

impl SymbolResolver for std::collections::HashMap<String, u32> {
    fn resolve(&self, name: &str) -> Option<u32> {
        self.get(name).copied()
    }
}
