//! Per-dataset state machine: FETCH → PARSE → RECONCILE_EACH → COMMIT.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ecomon_adapters::{
    mapper_for, FeatureSource, HttpFeatureSource, SourceContext, SourceError,
};
use ecomon_core::{DatasetKind, FeatureCollection};
use ecomon_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, SnapshotArchive};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{DatasetConfig, DatasetRegistry, RowFailurePolicy, SyncConfig};
use crate::reconcile::{PersistError, PersistenceEndpoint, PersistenceSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetStage {
    Fetch,
    Parse,
    ReconcileEach,
    Commit,
}

impl DatasetStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Parse => "parse",
            Self::ReconcileEach => "reconcile",
            Self::Commit => "commit",
        }
    }
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] SourceError),
    #[error("opening persistence session: {0}")]
    Session(#[source] PersistError),
    #[error("feature #{index} not applied: {source}")]
    Reconcile {
        index: usize,
        #[source]
        source: PersistError,
    },
    #[error("commit failed: {0}")]
    Commit(#[source] PersistError),
}

impl DatasetError {
    /// Stage the dataset was in when it was abandoned.
    pub fn stage(&self) -> DatasetStage {
        match self {
            Self::Fetch(SourceError::Parse { .. }) => DatasetStage::Parse,
            Self::Fetch(_) => DatasetStage::Fetch,
            Self::Session(_) | Self::Reconcile { .. } => DatasetStage::ReconcileEach,
            Self::Commit(_) => DatasetStage::Commit,
        }
    }
}

#[derive(Debug)]
pub enum DatasetOutcome {
    /// `processed` rows were committed; `skipped` rows were rejected and left
    /// out (only under [`RowFailurePolicy::Skip`]).
    Done { processed: usize, skipped: usize },
    /// Nothing from this dataset was committed.
    Aborted(DatasetError),
}

impl DatasetOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    pub fn processed(&self) -> usize {
        match self {
            Self::Done { processed, .. } => *processed,
            Self::Aborted(_) => 0,
        }
    }
}

#[derive(Debug)]
pub struct DatasetReport {
    pub kind: DatasetKind,
    pub label: String,
    pub endpoint: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: DatasetOutcome,
}

impl DatasetReport {
    pub fn summary_line(&self) -> String {
        match &self.outcome {
            DatasetOutcome::Done { processed, skipped: 0 } => {
                format!("{} ({}): {processed} features processed", self.label, self.kind)
            }
            DatasetOutcome::Done { processed, skipped } => format!(
                "{} ({}): {processed} features processed, {skipped} rejected",
                self.label, self.kind
            ),
            DatasetOutcome::Aborted(err) => format!(
                "{} ({}): aborted at {}: {err}",
                self.label,
                self.kind,
                err.stage().as_str()
            ),
        }
    }
}

#[derive(Debug)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub datasets: Vec<DatasetReport>,
}

impl SyncRunSummary {
    pub fn failed_count(&self) -> usize {
        self.datasets.iter().filter(|d| !d.outcome.is_done()).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed_count() == 0
    }

    pub fn total_processed(&self) -> usize {
        self.datasets.iter().map(|d| d.outcome.processed()).sum()
    }

    pub fn report(&self, kind: DatasetKind) -> Option<&DatasetReport> {
        self.datasets.iter().find(|d| d.kind == kind)
    }
}

pub struct SyncPipeline {
    api_base_url: String,
    datasets: DatasetRegistry,
    row_failure_policy: RowFailurePolicy,
    source: Arc<dyn FeatureSource>,
    endpoint: Arc<dyn PersistenceEndpoint>,
}

impl SyncPipeline {
    pub fn new(
        config: &SyncConfig,
        source: Arc<dyn FeatureSource>,
        endpoint: Arc<dyn PersistenceEndpoint>,
    ) -> Self {
        Self {
            api_base_url: config.api_base_url.clone(),
            datasets: config.datasets.clone(),
            row_failure_policy: config.row_failure_policy,
            source,
            endpoint,
        }
    }

    /// Live source for `config`: HTTP with its timeout/retry budget, archiving
    /// payloads when a snapshot directory is configured.
    pub fn http_source(config: &SyncConfig) -> Result<HttpFeatureSource> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: config.http_max_retries,
                ..Default::default()
            },
        })?;
        let source = HttpFeatureSource::new(http);
        Ok(match &config.snapshot_dir {
            Some(dir) => source.with_archive(SnapshotArchive::new(dir.clone())),
            None => source,
        })
    }

    pub fn datasets(&self) -> &DatasetRegistry {
        &self.datasets
    }

    /// One best-effort pass over every enabled dataset, in order. A dataset
    /// failure is recorded in its report and never stops the others.
    pub async fn run_once(&self) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut datasets = Vec::new();

        for dataset in self.datasets.enabled() {
            let span = info_span!("dataset", %run_id, dataset = %dataset.kind);
            let report = self.run_dataset(run_id, dataset).instrument(span).await;
            datasets.push(report);
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            datasets,
        };
        info!(
            %run_id,
            processed = summary.total_processed(),
            failed = summary.failed_count(),
            "sync run finished"
        );
        summary
    }

    pub async fn run_dataset(&self, run_id: Uuid, dataset: &DatasetConfig) -> DatasetReport {
        let started_at = Utc::now();
        let endpoint = dataset.endpoint_url(&self.api_base_url);
        let ctx = SourceContext::new(run_id);

        let outcome = match self.sync_dataset(&ctx, dataset.kind, &endpoint).await {
            Ok((processed, skipped)) => {
                info!(processed, skipped, "dataset synced");
                DatasetOutcome::Done { processed, skipped }
            }
            Err(err) => {
                error!(stage = err.stage().as_str(), error = %err, "dataset aborted");
                DatasetOutcome::Aborted(err)
            }
        };

        DatasetReport {
            kind: dataset.kind,
            label: dataset.label().to_string(),
            endpoint,
            started_at,
            finished_at: Utc::now(),
            outcome,
        }
    }

    async fn sync_dataset(
        &self,
        ctx: &SourceContext,
        kind: DatasetKind,
        endpoint: &str,
    ) -> Result<(usize, usize), DatasetError> {
        let collection = self.source.fetch(ctx, kind, endpoint).await?;
        if collection.is_empty() {
            info!("feature collection is empty; nothing to reconcile");
            return Ok((0, 0));
        }

        let mut session = self.endpoint.begin().await.map_err(DatasetError::Session)?;
        let applied = self.reconcile_all(session.as_mut(), kind, &collection).await;
        match applied {
            Ok(counts) => {
                session.commit().await.map_err(DatasetError::Commit)?;
                Ok(counts)
            }
            Err(err) => {
                if let Err(rollback_err) = session.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn reconcile_all(
        &self,
        session: &mut dyn PersistenceSession,
        kind: DatasetKind,
        collection: &FeatureCollection,
    ) -> Result<(usize, usize), DatasetError> {
        let mapper = mapper_for(kind);
        let mut processed = 0usize;
        let mut skipped = 0usize;

        for (index, feature) in collection.features.iter().enumerate() {
            let plan = mapper.map(&feature.properties, Utc::now());
            let applied = match self.row_failure_policy {
                RowFailurePolicy::Abort => session.execute(&plan).await,
                RowFailurePolicy::Skip => session.execute_isolated(&plan).await,
            };

            match applied {
                Ok(()) => processed += 1,
                Err(source)
                    if source.is_row_rejection()
                        && self.row_failure_policy == RowFailurePolicy::Skip =>
                {
                    warn!(index, error = %source, "skipping rejected feature");
                    skipped += 1;
                }
                Err(source) => return Err(DatasetError::Reconcile { index, source }),
            }
        }

        Ok((processed, skipped))
    }
}

/// Runs `pipeline` on `cron` (six fields, seconds first). The scheduler is
/// returned unstarted.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let summary = pipeline.run_once().await;
            for report in &summary.datasets {
                info!(run_id = %summary.run_id, "{}", report.summary_line());
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
