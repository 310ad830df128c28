//! In-process store with the same upsert semantics as the Postgres tables.
//! Backs `--dry-run` and the pipeline tests.
//!
//! Values are checked the way the upsert's `CAST`s check them: coordinates
//! must be numeric, `discovered_at` a timestamp and `captured` a boolean.
//! Timestamps are accepted in ISO 8601 forms only, a subset of what Postgres
//! parses.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use ecomon_core::{BindValue, CoordinateKey, DatasetKind, TableSpec, UpsertPlan};

use crate::reconcile::{PersistError, PersistenceEndpoint, PersistenceSession};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: i64,
    pub values: BTreeMap<&'static str, BindValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StoredRow {
    pub fn get(&self, column: &str) -> Option<&BindValue> {
        self.values.get(column)
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: BTreeMap<DatasetKind, BTreeMap<CoordinateKey, StoredRow>>,
    last_id: i64,
}

impl MemoryState {
    fn apply(&mut self, plan: &UpsertPlan, now: DateTime<Utc>) -> Result<(), PersistError> {
        let table = plan.table();
        let key = plan.key().ok_or_else(|| PersistError::RowRejected {
            table: table.table,
            message: "latitude and longitude must be numeric".to_string(),
        })?;
        check_casts(table, plan)?;

        let rows = self.tables.entry(plan.kind()).or_default();
        if let Some(row) = rows.get_mut(&key) {
            for &column in table.update_columns {
                if let Some(value) = plan.value(column) {
                    row.values.insert(column, value.clone());
                }
            }
            row.updated_at = Some(now);
            return Ok(());
        }

        let mut values: BTreeMap<&'static str, BindValue> = table
            .columns
            .iter()
            .map(|c| c.name)
            .zip(plan.values.iter().cloned())
            .collect();
        values.insert("latitude", BindValue::Float(key.latitude()));
        values.insert("longitude", BindValue::Float(key.longitude()));

        self.last_id += 1;
        rows.insert(
            key,
            StoredRow {
                id: self.last_id,
                values,
                created_at: now,
                updated_at: None,
            },
        );
        Ok(())
    }
}

const NAIVE_TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

fn parses_as_timestamp(text: &str) -> bool {
    let text = text.trim();
    DateTime::parse_from_rfc3339(text).is_ok()
        || NAIVE_TIMESTAMP_FORMATS
            .iter()
            .any(|format| NaiveDateTime::parse_from_str(text, format).is_ok())
        || NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
}

fn parses_as_boolean(text: &str) -> bool {
    matches!(
        text.trim().to_ascii_lowercase().as_str(),
        "t" | "true" | "y" | "yes" | "on" | "1" | "f" | "false" | "n" | "no" | "off" | "0"
    )
}

/// Whether `CAST(<text> AS <sql_type>)` would succeed for this value.
fn casts_to(value: &BindValue, sql_type: &str) -> bool {
    let Some(text) = value.to_sql_text() else {
        return true;
    };
    match sql_type {
        "DOUBLE PRECISION" => text.trim().parse::<f64>().is_ok(),
        "TIMESTAMPTZ" => parses_as_timestamp(&text),
        "BOOLEAN" => parses_as_boolean(&text),
        _ => true,
    }
}

fn check_casts(table: &TableSpec, plan: &UpsertPlan) -> Result<(), PersistError> {
    for (column, value) in table.columns.iter().zip(&plan.values) {
        if !casts_to(value, column.sql_type) {
            return Err(PersistError::RowRejected {
                table: table.table,
                message: format!(
                    "invalid input for {} ({}): {}",
                    column.name,
                    column.sql_type,
                    value.to_sql_text().unwrap_or_default()
                ),
            });
        }
    }
    Ok(())
}

/// Sessions work on a private copy that replaces the shared state on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryEndpoint {
    state: Arc<Mutex<MemoryState>>,
    sessions_opened: Arc<AtomicUsize>,
    commits: Arc<AtomicUsize>,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of one table, oldest first.
    pub fn rows(&self, kind: DatasetKind) -> Vec<StoredRow> {
        let state = lock(&self.state);
        let mut rows: Vec<StoredRow> = state
            .tables
            .get(&kind)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|r| r.id);
        rows
    }

    pub fn row(&self, kind: DatasetKind, latitude: f64, longitude: f64) -> Option<StoredRow> {
        lock(&self.state)
            .tables
            .get(&kind)
            .and_then(|t| t.get(&CoordinateKey::new(latitude, longitude)))
            .cloned()
    }

    pub fn row_count(&self, kind: DatasetKind) -> usize {
        lock(&self.state).tables.get(&kind).map_or(0, BTreeMap::len)
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistenceEndpoint for MemoryEndpoint {
    async fn begin(&self) -> Result<Box<dyn PersistenceSession>, PersistError> {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        let working = lock(&self.state).clone();
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.state),
            commits: Arc::clone(&self.commits),
            working,
        }))
    }
}

pub struct MemorySession {
    shared: Arc<Mutex<MemoryState>>,
    commits: Arc<AtomicUsize>,
    working: MemoryState,
}

#[async_trait]
impl PersistenceSession for MemorySession {
    async fn execute(&mut self, plan: &UpsertPlan) -> Result<(), PersistError> {
        self.working.apply(plan, Utc::now())
    }

    async fn execute_isolated(&mut self, plan: &UpsertPlan) -> Result<(), PersistError> {
        // `apply` validates before mutating, so a rejection leaves no trace.
        self.working.apply(plan, Utc::now())
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistError> {
        let Self {
            shared,
            commits,
            working,
        } = *self;
        *lock(&shared) = working;
        commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), PersistError> {
        Ok(())
    }
}
