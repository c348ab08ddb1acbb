use std::time::Duration;

use thiserror::Error;

use crate::pipeline::state::PipelineState;
use crate::strategy::Role;

/// Everything that can go wrong while ingesting a search.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("fetch of {url} timed out after {timeout:?}")]
    FetchTimeout { url: String, timeout: Duration },
    #[error("transport error fetching {url}: {message}")]
    FetchTransport { url: String, message: String },
    #[error("bot-block page served for {url}: {reason}")]
    BotBlocked { url: String, reason: String },
    #[error("unknown {role} strategy: {name}")]
    UnknownStrategy { role: Role, name: String },
    #[error("malformed page block: {0}")]
    MalformedPage(String),
    #[error("identity conflict on {0} could not be resolved by lookup")]
    IdentityConflict(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no result url found for search type {0}")]
    NoResultFound(String),
    #[error("ingestion cancelled before {0}")]
    Cancelled(PipelineState),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    /// Whether the orchestrator may retry the failed stage.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::FetchTimeout { .. } | IngestError::FetchTransport { .. }
        )
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        IngestError::InvalidInput(message.into())
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        IngestError::MalformedPage(message.into())
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
