use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use ecomon_adapters::{load_fixture_collection, mapper_for};
use ecomon_core::{DatasetKind, NormalizedRecord};

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn assert_matches_snapshot(kind: DatasetKind) {
    let root = workspace_root();
    let collection =
        load_fixture_collection(root.join("fixtures/sample").join(format!("{kind}.geojson")))
            .expect("sample collection");
    let processed_at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().unwrap();

    let records: Vec<NormalizedRecord> = collection
        .features
        .iter()
        .map(|f| mapper_for(kind).map(&f.properties, processed_at).record)
        .collect();

    let expected_path = root.join("fixtures/expected").join(format!("{kind}.json"));
    let expected: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&expected_path).expect("expected snapshot"))
            .expect("parse expected snapshot");

    assert_eq!(serde_json::to_value(&records).unwrap(), expected, "{kind}");
}

#[test]
fn pollution_sample_matches_snapshot() {
    assert_matches_snapshot(DatasetKind::Pollution);
}

#[test]
fn bird_sample_matches_snapshot() {
    assert_matches_snapshot(DatasetKind::Bird);
}

#[test]
fn pickup_point_sample_matches_snapshot() {
    assert_matches_snapshot(DatasetKind::PickupPoint);
}
