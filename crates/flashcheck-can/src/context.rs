//! Run-scoped context handed to every component

use std::path::{Path, PathBuf};

use flashcheck_core::ChannelId;
use tracing::Span;
use uuid::Uuid;

/// Identity and artifacts location of one verification run
///
/// Cloned into each component instead of living in global state; the span
/// carries `run_id` so every log line of the run can be correlated.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: Uuid,
    capture_dir: Option<PathBuf>,
    span: Span,
}

impl RunContext {
    pub fn new(capture_dir: Option<PathBuf>) -> Self {
        Self::with_run_id(Uuid::new_v4(), capture_dir)
    }

    pub fn with_run_id(run_id: Uuid, capture_dir: Option<PathBuf>) -> Self {
        let span = tracing::info_span!("run", %run_id);
        Self {
            run_id,
            capture_dir,
            span,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn capture_dir(&self) -> Option<&Path> {
        self.capture_dir.as_deref()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Where the capture log of `channel` goes, if captures are kept
    pub fn capture_path(&self, channel: ChannelId) -> Option<PathBuf> {
        self.capture_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}_ch{}.log", self.run_id, channel.get())))
    }
}
