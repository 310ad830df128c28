use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use ecomon_core::DatasetKind;
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

pub const DEFAULT_API_BASE_URL: &str = "https://blacksea-monitoring.nextgis.com";
pub const DEFAULT_SYNC_CRON: &str = "0 0 * * * *";

/// What to do when the store rejects one feature's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFailurePolicy {
    /// Roll back the whole dataset; nothing from it is committed.
    #[default]
    Abort,
    /// Undo only the rejected row and commit the rest.
    Skip,
}

impl FromStr for RowFailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            other => anyhow::bail!("unknown row failure policy `{other}` (expected abort or skip)"),
        }
    }
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: Option<String>,
    pub acquire_timeout: Duration,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl DatabaseConfig {
    /// `DATABASE_URL` wins over the individual `DB_*` parts.
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        if let Some(url) = &self.url {
            return url.parse();
        }
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user);
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }
}

/// One entry of the dataset registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatasetConfig {
    pub kind: DatasetKind,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub resource_id: Option<u32>,
    /// Full URL; overrides `resource_id`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl DatasetConfig {
    pub fn builtin(kind: DatasetKind) -> Self {
        let (label, resource_id) = match kind {
            DatasetKind::Pollution => ("Pollution", 60),
            DatasetKind::Bird => ("Birds", 100),
            DatasetKind::PickupPoint => ("Pickup points", 98),
        };
        Self {
            kind,
            label: Some(label.to_string()),
            resource_id: Some(resource_id),
            endpoint: None,
            enabled: true,
        }
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(self.kind.as_str())
    }

    pub fn endpoint_url(&self, api_base_url: &str) -> String {
        if let Some(endpoint) = &self.endpoint {
            return endpoint.clone();
        }
        let resource_id = self
            .resource_id
            .or(Self::builtin(self.kind).resource_id)
            .unwrap_or_default();
        format!(
            "{}/api/resource/{resource_id}/geojson",
            api_base_url.trim_end_matches('/')
        )
    }
}

/// The three datasets, always in declaration order of [`DatasetKind::ALL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRegistry {
    datasets: Vec<DatasetConfig>,
}

#[derive(Debug, Deserialize)]
struct DatasetsFile {
    #[serde(default)]
    datasets: Vec<DatasetConfig>,
}

impl Default for DatasetRegistry {
    fn default() -> Self {
        Self {
            datasets: DatasetKind::ALL.into_iter().map(DatasetConfig::builtin).collect(),
        }
    }
}

impl DatasetRegistry {
    /// Entries in the YAML replace the built-in entry of the same kind; file
    /// order does not change processing order.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: DatasetsFile = serde_yaml::from_str(yaml).context("parsing datasets registry")?;
        let mut registry = Self::default();
        for entry in file.datasets {
            let builtin = DatasetConfig::builtin(entry.kind);
            let merged = DatasetConfig {
                label: entry.label.or(builtin.label),
                resource_id: entry.resource_id.or(builtin.resource_id),
                ..entry
            };
            if let Some(slot) = registry.datasets.iter_mut().find(|d| d.kind == merged.kind) {
                *slot = merged;
            }
        }
        Ok(registry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DatasetConfig> {
        self.datasets.iter()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &DatasetConfig> {
        self.datasets.iter().filter(|d| d.enabled)
    }

    pub fn get(&self, kind: DatasetKind) -> Option<&DatasetConfig> {
        self.datasets.iter().find(|d| d.kind == kind)
    }

    /// Disable every dataset except `kind`.
    pub fn restrict_to(&mut self, kind: DatasetKind) {
        for dataset in &mut self.datasets {
            dataset.enabled = dataset.enabled && dataset.kind == kind;
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database: DatabaseConfig,
    pub api_base_url: String,
    pub datasets: DatasetRegistry,
    pub http_timeout: Duration,
    pub http_max_retries: usize,
    pub user_agent: String,
    pub row_failure_policy: RowFailurePolicy,
    pub snapshot_dir: Option<PathBuf>,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parsed = |key: &str, default: u64| {
            var(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        let datasets = match var("ECOMON_DATASETS_FILE") {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {path}"))?;
                DatasetRegistry::from_yaml_str(&text).with_context(|| format!("loading {path}"))?
            }
            None => DatasetRegistry::default(),
        };

        let row_failure_policy = match var("ECOMON_ROW_FAILURE_POLICY") {
            Some(v) => v.parse()?,
            None => RowFailurePolicy::default(),
        };

        Ok(Self {
            database: DatabaseConfig {
                url: var("DATABASE_URL"),
                host: var("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: var("DB_PORT")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(5432),
                name: var("DB_NAME").unwrap_or_else(|| "ecomon".to_string()),
                user: var("DB_USER").unwrap_or_else(|| "ecomon".to_string()),
                password: var("DB_PASSWORD"),
                acquire_timeout: Duration::from_secs(parsed("ECOMON_DB_ACQUIRE_TIMEOUT_SECS", 10)),
            },
            api_base_url: var("ECOMON_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            datasets,
            http_timeout: Duration::from_secs(parsed("ECOMON_HTTP_TIMEOUT_SECS", 30)),
            http_max_retries: usize::try_from(parsed("ECOMON_HTTP_MAX_RETRIES", 0)).unwrap_or(0),
            user_agent: var("ECOMON_USER_AGENT").unwrap_or_else(|| "ecomon-sync/0.1".to_string()),
            row_failure_policy,
            snapshot_dir: var("ECOMON_SNAPSHOT_DIR").map(PathBuf::from),
            sync_cron: var("ECOMON_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        })
    }
}
