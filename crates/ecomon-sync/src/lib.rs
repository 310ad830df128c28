//! Sync orchestration: configuration, the reconciler and the dataset
//! pipeline.

pub mod config;
pub mod memory;
pub mod pipeline;
pub mod reconcile;

use std::sync::Arc;

use anyhow::Result;

pub use config::{DatabaseConfig, DatasetConfig, DatasetRegistry, RowFailurePolicy, SyncConfig};
pub use memory::{MemoryEndpoint, StoredRow};
pub use pipeline::{
    build_scheduler, DatasetError, DatasetOutcome, DatasetReport, DatasetStage, SyncPipeline,
    SyncRunSummary,
};
pub use reconcile::{PersistError, PersistenceEndpoint, PersistenceSession, PgEndpoint};

pub const CRATE_NAME: &str = "ecomon-sync";

/// Live pipeline: GIS API over HTTP into Postgres.
pub fn pipeline_from_config(config: &SyncConfig) -> Result<SyncPipeline> {
    let source = SyncPipeline::http_source(config)?;
    let endpoint = PgEndpoint::connect_lazy(&config.database)?;
    Ok(SyncPipeline::new(config, Arc::new(source), Arc::new(endpoint)))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = pipeline_from_config(&config)?;
    Ok(pipeline.run_once().await)
}
