//! Row mappers for the three GIS layers plus the feature-source contract the
//! sync pipeline fetches through.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ecomon_core::{
    BindValue, BirdRecord, DatasetKind, FeatureCollection, FeatureProperties, NormalizedRecord,
    PickupPointRecord, PollutionRecord, UpsertPlan,
};
use ecomon_storage::{FetchError, HttpFetcher, SnapshotArchive};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ecomon-adapters";

/// Sentinel stored when a feature carries no status.
pub const UNKNOWN_STATUS: &str = "Unknown";

/// Property keys used by the NextGIS layers.
pub mod keys {
    pub const LATITUDE: &str = "lat";
    pub const LONGITUDE: &str = "lon";
    pub const COMMENT: &str = "comment";
    pub const STATUS: &str = "status_us";
    pub const SOURCE: &str = "source";
    pub const DISCOVERED_AT: &str = "dt_auto";
    pub const SURFACE_TYPE: &str = "type_surf";
    pub const PRIORITY: &str = "priority";
}

const CAPTURED_TOKEN: &str = "captured";

/// Maps one feature's properties onto the upsert for its table.
///
/// Implementations are pure: the processing time is passed in and nothing is
/// validated. Values the store cannot accept are rejected at write time.
pub trait RowMapper: Send + Sync {
    fn kind(&self) -> DatasetKind;

    fn map(&self, properties: &FeatureProperties, processed_at: DateTime<Utc>) -> UpsertPlan;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PollutionMapper;

#[derive(Debug, Clone, Copy, Default)]
pub struct BirdMapper;

#[derive(Debug, Clone, Copy, Default)]
pub struct PickupPointMapper;

impl RowMapper for PollutionMapper {
    fn kind(&self) -> DatasetKind {
        DatasetKind::Pollution
    }

    fn map(&self, properties: &FeatureProperties, processed_at: DateTime<Utc>) -> UpsertPlan {
        UpsertPlan::new(NormalizedRecord::Pollution(map_pollution(
            properties,
            processed_at,
        )))
    }
}

impl RowMapper for BirdMapper {
    fn kind(&self) -> DatasetKind {
        DatasetKind::Bird
    }

    fn map(&self, properties: &FeatureProperties, _processed_at: DateTime<Utc>) -> UpsertPlan {
        UpsertPlan::new(NormalizedRecord::Bird(map_bird(properties)))
    }
}

impl RowMapper for PickupPointMapper {
    fn kind(&self) -> DatasetKind {
        DatasetKind::PickupPoint
    }

    fn map(&self, properties: &FeatureProperties, processed_at: DateTime<Utc>) -> UpsertPlan {
        UpsertPlan::new(NormalizedRecord::PickupPoint(map_pickup_point(
            properties,
            processed_at,
        )))
    }
}

static POLLUTION_MAPPER: PollutionMapper = PollutionMapper;
static BIRD_MAPPER: BirdMapper = BirdMapper;
static PICKUP_POINT_MAPPER: PickupPointMapper = PickupPointMapper;

pub fn mapper_for(kind: DatasetKind) -> &'static dyn RowMapper {
    match kind {
        DatasetKind::Pollution => &POLLUTION_MAPPER,
        DatasetKind::Bird => &BIRD_MAPPER,
        DatasetKind::PickupPoint => &PICKUP_POINT_MAPPER,
    }
}

fn status(properties: &FeatureProperties) -> BindValue {
    properties
        .truthy(keys::STATUS)
        .map(BindValue::from)
        .unwrap_or_else(|| BindValue::from(UNKNOWN_STATUS))
}

fn discovered_at_or(properties: &FeatureProperties, fallback: BindValue) -> BindValue {
    properties
        .truthy(keys::DISCOVERED_AT)
        .map(BindValue::from)
        .unwrap_or(fallback)
}

pub fn map_pollution(properties: &FeatureProperties, processed_at: DateTime<Utc>) -> PollutionRecord {
    PollutionRecord {
        longitude: properties.scalar(keys::LONGITUDE),
        latitude: properties.scalar(keys::LATITUDE),
        comment: properties.scalar(keys::COMMENT),
        status: status(properties),
        info_source: properties.scalar(keys::SOURCE),
        discovered_at: discovered_at_or(properties, BindValue::Timestamp(processed_at)),
        surface_type: properties.scalar(keys::SURFACE_TYPE),
    }
}

/// Bird sightings keep a missing discovery time as null.
pub fn map_bird(properties: &FeatureProperties) -> BirdRecord {
    BirdRecord {
        longitude: properties.scalar(keys::LONGITUDE),
        latitude: properties.scalar(keys::LATITUDE),
        status: status(properties),
        info_source: properties.scalar(keys::SOURCE),
        discovered_at: discovered_at_or(properties, BindValue::Null),
        priority: properties.scalar(keys::PRIORITY),
        comment: properties.scalar(keys::COMMENT),
        captured: is_captured(properties.text(keys::COMMENT)),
    }
}

pub fn map_pickup_point(
    properties: &FeatureProperties,
    processed_at: DateTime<Utc>,
) -> PickupPointRecord {
    PickupPointRecord {
        longitude: properties.scalar(keys::LONGITUDE),
        latitude: properties.scalar(keys::LATITUDE),
        comment: properties.scalar(keys::COMMENT),
        status: status(properties),
        info_source: properties.scalar(keys::SOURCE),
        discovered_at: discovered_at_or(properties, BindValue::Timestamp(processed_at)),
    }
}

/// Case-insensitive search for "captured" anywhere in the comment.
pub fn is_captured(comment: Option<&str>) -> bool {
    comment.is_some_and(|c| c.to_lowercase().contains(CAPTURED_TOKEN))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl SourceContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed feature collection from {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where a dataset's raw feature collection comes from.
#[async_trait]
pub trait FeatureSource: Send + Sync {
    async fn fetch(
        &self,
        ctx: &SourceContext,
        kind: DatasetKind,
        endpoint: &str,
    ) -> Result<FeatureCollection, SourceError>;
}

pub fn parse_feature_collection(
    origin: &str,
    bytes: &[u8],
) -> Result<FeatureCollection, SourceError> {
    serde_json::from_slice(bytes).map_err(|source| SourceError::Parse {
        origin: origin.to_string(),
        source,
    })
}

/// Live GIS API source, optionally archiving every payload it receives.
#[derive(Debug, Clone)]
pub struct HttpFeatureSource {
    http: HttpFetcher,
    archive: Option<SnapshotArchive>,
}

impl HttpFeatureSource {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            archive: None,
        }
    }

    pub fn with_archive(mut self, archive: SnapshotArchive) -> Self {
        self.archive = Some(archive);
        self
    }
}

#[async_trait]
impl FeatureSource for HttpFeatureSource {
    async fn fetch(
        &self,
        ctx: &SourceContext,
        kind: DatasetKind,
        endpoint: &str,
    ) -> Result<FeatureCollection, SourceError> {
        let response = self
            .http
            .fetch_bytes(ctx.run_id, kind.as_str(), endpoint)
            .await?;

        if let Some(archive) = &self.archive {
            match archive
                .store(ctx.fetched_at, kind.as_str(), &response.body)
                .await
            {
                Ok(stored) => debug!(
                    dataset = %kind,
                    path = %stored.relative_path.display(),
                    deduplicated = stored.deduplicated,
                    "archived raw payload"
                ),
                Err(err) => warn!(dataset = %kind, error = %err, "could not archive raw payload"),
            }
        }

        parse_feature_collection(&response.final_url, &response.body)
    }
}

/// Replays collections saved as `<root>/<dataset>.geojson`; the endpoint is
/// ignored.
#[derive(Debug, Clone)]
pub struct FileFeatureSource {
    root: PathBuf,
}

impl FileFeatureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, kind: DatasetKind) -> PathBuf {
        self.root.join(format!("{}.geojson", kind.as_str()))
    }
}

#[async_trait]
impl FeatureSource for FileFeatureSource {
    async fn fetch(
        &self,
        _ctx: &SourceContext,
        kind: DatasetKind,
        _endpoint: &str,
    ) -> Result<FeatureCollection, SourceError> {
        let path = self.path_for(kind);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| SourceError::Io {
                path: path.clone(),
                source,
            })?;
        parse_feature_collection(&path.display().to_string(), &bytes)
    }
}

pub fn load_fixture_collection(path: impl AsRef<Path>) -> anyhow::Result<FeatureCollection> {
    let path = path.as_ref();
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))
}
