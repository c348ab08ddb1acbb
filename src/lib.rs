//! Ingests image-search results into a local SQLite store: fetch a results
//! page, extract result URLs with a named strategy, and resolve them into
//! deduplicated Urls, Tags and MatchResults.

pub mod database;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod media;
pub mod pipeline;
pub mod resolve;
pub mod strategy;
pub mod utils;

pub use database::models::{SearchImagePageRecord, SearchQueryRecord, SearchType};
pub use database::repo::Store;
pub use error::{IngestError, Result};
pub use pipeline::{CancelToken, ImageInput, Orchestrator, PipelineState};
pub use strategy::{Registry, Role};
pub use utils::config::Config;
