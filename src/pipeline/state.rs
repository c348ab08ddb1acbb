use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;
use tracing::debug;

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    Fetching,
    Extracting,
    Resolving,
    Done,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineState::NotStarted => "not started",
            PipelineState::Fetching => "fetching",
            PipelineState::Extracting => "extracting",
            PipelineState::Resolving => "resolving",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        })
    }
}

impl PipelineState {
    fn can_advance_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (NotStarted, Fetching)
                | (Fetching, Extracting)
                | (Extracting, Resolving)
                | (Resolving, Done)
                // cache hit
                | (NotStarted, Done)
        )
    }
}

/// Shared flag checked between pipeline stages. In-flight fetches are not
/// interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One ingestion's progress through the stages.
#[derive(Debug)]
pub struct PipelineRun {
    state: PipelineState,
    cancel: CancelToken,
}

impl PipelineRun {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            state: PipelineState::NotStarted,
            cancel,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Moves to `next`. Entering a working stage fails with `Cancelled` once
    /// the token is set; reaching `Done` never does.
    pub fn advance(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            let err = anyhow!("invalid pipeline transition {} -> {}", self.state, next);
            self.state = PipelineState::Failed;
            return Err(IngestError::Other(err));
        }
        if next != PipelineState::Done && self.cancel.is_cancelled() {
            self.state = PipelineState::Failed;
            return Err(IngestError::Cancelled(next));
        }
        debug!(from = %self.state, to = %next, "pipeline stage");
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self) {
        self.state = PipelineState::Failed;
    }
}
