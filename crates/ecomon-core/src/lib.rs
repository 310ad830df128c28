//! Core domain model for ecomon: GIS feature collections, dataset kinds and
//! the upsert plans the reconciler applies.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "ecomon-core";

/// The three fixed dataset kinds, in the order a sync run processes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Pollution,
    Bird,
    PickupPoint,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 3] = [Self::Pollution, Self::Bird, Self::PickupPoint];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pollution => "pollution",
            Self::Bird => "bird",
            Self::PickupPoint => "pickup_point",
        }
    }

    pub fn table(&self) -> &'static TableSpec {
        match self {
            Self::Pollution => &POLLUTION_TABLE,
            Self::Bird => &BIRD_TABLE,
            Self::PickupPoint => &PICKUP_POINT_TABLE,
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDatasetKind(pub String);

impl fmt::Display for UnknownDatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown dataset kind `{}` (expected pollution, bird or pickup-point)",
            self.0
        )
    }
}

impl std::error::Error for UnknownDatasetKind {}

impl FromStr for DatasetKind {
    type Err = UnknownDatasetKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pollution" => Ok(Self::Pollution),
            "bird" => Ok(Self::Bird),
            "pickup_point" | "pick_up_point" => Ok(Self::PickupPoint),
            _ => Err(UnknownDatasetKind(s.to_string())),
        }
    }
}

/// GeoJSON-style collection as returned by the GIS API.
///
/// Only `features[].properties` is read; geometry and any other members are
/// ignored. A body without `features` is an empty collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub properties: FeatureProperties,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<FeatureProperties, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<FeatureProperties>::deserialize(deserializer)?.unwrap_or_default())
}

/// Attribute mapping of one feature with typed optional accessors.
///
/// A key holding JSON `null` reads the same as a missing key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureProperties(Map<String, JsonValue>);

impl FeatureProperties {
    pub fn new(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    /// Raw value for a positional bind, `Null` when absent.
    pub fn scalar(&self, key: &str) -> BindValue {
        self.get(key).map(BindValue::from).unwrap_or(BindValue::Null)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(JsonValue::as_str)
    }

    /// Value only when it is "set" in the upstream's sense: not null, `false`,
    /// zero or empty.
    pub fn truthy(&self, key: &str) -> Option<&JsonValue> {
        self.get(key).filter(|v| is_truthy(v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, JsonValue>> for FeatureProperties {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
    }
}

/// One positional parameter of an upsert statement.
///
/// Values are carried through from the feature unvalidated; the store decides
/// whether it accepts them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BindValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(JsonValue),
}

impl BindValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric reading the way a `DOUBLE PRECISION` column would coerce it.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Literal text the store casts to the column type. Every parameter is
    /// sent as text, so the statement's parameter types never depend on the
    /// JSON type a feature happened to use.
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(v) => Some(if *v { "true" } else { "false" }.to_string()),
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::Text(v) => Some(v.clone()),
            Self::Timestamp(v) => Some(v.to_rfc3339()),
            Self::Json(v) => Some(v.to_string()),
        }
    }
}

impl From<&JsonValue> for BindValue {
    fn from(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            JsonValue::String(s) => Self::Text(s.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

impl From<&str> for BindValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<f64> for BindValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for BindValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for BindValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// Identity of a stored row: the exact (latitude, longitude) pair.
///
/// No rounding is applied. `-0.0` and `0.0` compare equal, as they do in a
/// `DOUBLE PRECISION` unique index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoordinateKey {
    latitude_bits: u64,
    longitude_bits: u64,
}

impl CoordinateKey {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude_bits: canonical_bits(latitude),
            longitude_bits: canonical_bits(longitude),
        }
    }

    pub fn latitude(&self) -> f64 {
        f64::from_bits(self.latitude_bits)
    }

    pub fn longitude(&self) -> f64 {
        f64::from_bits(self.longitude_bits)
    }
}

fn canonical_bits(value: f64) -> u64 {
    if value == 0.0 {
        0.0f64.to_bits()
    } else {
        value.to_bits()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollutionRecord {
    pub longitude: BindValue,
    pub latitude: BindValue,
    pub comment: BindValue,
    pub status: BindValue,
    pub info_source: BindValue,
    pub discovered_at: BindValue,
    pub surface_type: BindValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BirdRecord {
    pub longitude: BindValue,
    pub latitude: BindValue,
    pub status: BindValue,
    pub info_source: BindValue,
    pub discovered_at: BindValue,
    pub priority: BindValue,
    pub comment: BindValue,
    pub captured: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PickupPointRecord {
    pub longitude: BindValue,
    pub latitude: BindValue,
    pub comment: BindValue,
    pub status: BindValue,
    pub info_source: BindValue,
    pub discovered_at: BindValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedRecord {
    Pollution(PollutionRecord),
    Bird(BirdRecord),
    PickupPoint(PickupPointRecord),
}

impl NormalizedRecord {
    pub fn kind(&self) -> DatasetKind {
        match self {
            Self::Pollution(_) => DatasetKind::Pollution,
            Self::Bird(_) => DatasetKind::Bird,
            Self::PickupPoint(_) => DatasetKind::PickupPoint,
        }
    }

    /// Bind values in the column order of [`DatasetKind::table`].
    pub fn bind_values(&self) -> Vec<BindValue> {
        match self {
            Self::Pollution(r) => vec![
                r.longitude.clone(),
                r.latitude.clone(),
                r.comment.clone(),
                r.status.clone(),
                r.info_source.clone(),
                r.discovered_at.clone(),
                r.surface_type.clone(),
            ],
            Self::Bird(r) => vec![
                r.longitude.clone(),
                r.latitude.clone(),
                r.status.clone(),
                r.info_source.clone(),
                r.discovered_at.clone(),
                r.priority.clone(),
                r.comment.clone(),
                BindValue::Bool(r.captured),
            ],
            Self::PickupPoint(r) => vec![
                r.longitude.clone(),
                r.latitude.clone(),
                r.comment.clone(),
                r.status.clone(),
                r.info_source.clone(),
                r.discovered_at.clone(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub sql_type: &'static str,
}

const fn column(name: &'static str, sql_type: &'static str) -> ColumnSpec {
    ColumnSpec { name, sql_type }
}

/// Target table of one dataset kind plus its conflict-resolution rule.
///
/// Rows are keyed by `(latitude, longitude)`. On conflict only
/// `update_columns` are overwritten and `updated_at` is stamped; every other
/// column keeps its first-insert value.
#[derive(Debug, PartialEq, Eq)]
pub struct TableSpec {
    pub table: &'static str,
    pub columns: &'static [ColumnSpec],
    pub update_columns: &'static [&'static str],
}

pub const KEY_COLUMNS: [&str; 2] = ["latitude", "longitude"];

pub static POLLUTION_TABLE: TableSpec = TableSpec {
    table: "pollution",
    columns: &[
        column("longitude", "DOUBLE PRECISION"),
        column("latitude", "DOUBLE PRECISION"),
        column("comment", "TEXT"),
        column("status", "TEXT"),
        column("info_source", "TEXT"),
        column("discovered_at", "TIMESTAMPTZ"),
        column("surface_type", "TEXT"),
    ],
    update_columns: &["comment", "status", "info_source", "surface_type"],
};

pub static BIRD_TABLE: TableSpec = TableSpec {
    table: "bird",
    columns: &[
        column("longitude", "DOUBLE PRECISION"),
        column("latitude", "DOUBLE PRECISION"),
        column("status", "TEXT"),
        column("info_source", "TEXT"),
        column("discovered_at", "TIMESTAMPTZ"),
        column("priority", "TEXT"),
        column("comment", "TEXT"),
        column("captured", "BOOLEAN"),
    ],
    update_columns: &["status", "info_source", "priority", "comment", "captured"],
};

pub static PICKUP_POINT_TABLE: TableSpec = TableSpec {
    table: "pick_up_point",
    columns: &[
        column("longitude", "DOUBLE PRECISION"),
        column("latitude", "DOUBLE PRECISION"),
        column("comment", "TEXT"),
        column("status", "TEXT"),
        column("info_source", "TEXT"),
        column("discovered_at", "TIMESTAMPTZ"),
    ],
    update_columns: &["comment", "status", "info_source"],
};

impl TableSpec {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Single conditional write: insert, or overwrite the mutable columns of
    /// the row already holding this coordinate pair.
    ///
    /// Each placeholder is cast to its column type so text-encoded numbers and
    /// timestamps coerce the way SQL literals do.
    pub fn upsert_statement(&self) -> String {
        let names = self
            .columns
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("CAST(${} AS {})", i + 1, c.sql_type))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = self
            .update_columns
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .chain(std::iter::once("updated_at = now()".to_string()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {table} ({names}) VALUES ({placeholders}) \
             ON CONFLICT ({key}) DO UPDATE SET {updates}",
            table = self.table,
            key = KEY_COLUMNS.join(", "),
        )
    }
}

/// A mapped feature ready for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertPlan {
    pub record: NormalizedRecord,
    pub values: Vec<BindValue>,
}

impl UpsertPlan {
    pub fn new(record: NormalizedRecord) -> Self {
        let values = record.bind_values();
        Self { record, values }
    }

    pub fn kind(&self) -> DatasetKind {
        self.record.kind()
    }

    pub fn table(&self) -> &'static TableSpec {
        self.kind().table()
    }

    pub fn value(&self, column: &str) -> Option<&BindValue> {
        self.table()
            .column_index(column)
            .and_then(|i| self.values.get(i))
    }

    /// Coordinate identity, or `None` when either coordinate is not numeric.
    pub fn key(&self) -> Option<CoordinateKey> {
        let latitude = self.value("latitude")?.as_f64()?;
        let longitude = self.value("longitude")?.as_f64()?;
        Some(CoordinateKey::new(latitude, longitude))
    }
}
