use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ecomon_adapters::{
    parse_feature_collection, FeatureSource, FileFeatureSource, SourceContext, SourceError,
};
use ecomon_core::{BindValue, DatasetKind, FeatureCollection};
use ecomon_sync::{
    DatasetStage, MemoryEndpoint, RowFailurePolicy, SyncConfig, SyncPipeline,
};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Serves canned payloads per dataset; kinds without a payload fail to fetch.
#[derive(Default)]
struct StubSource {
    payloads: Mutex<HashMap<DatasetKind, Vec<u8>>>,
}

impl StubSource {
    fn with(self, kind: DatasetKind, body: Value) -> Self {
        self.set(kind, body);
        self
    }

    fn with_raw(self, kind: DatasetKind, body: &str) -> Self {
        self.payloads
            .lock()
            .unwrap()
            .insert(kind, body.as_bytes().to_vec());
        self
    }

    fn set(&self, kind: DatasetKind, body: Value) {
        self.payloads
            .lock()
            .unwrap()
            .insert(kind, serde_json::to_vec(&body).unwrap());
    }
}

#[async_trait]
impl FeatureSource for StubSource {
    async fn fetch(
        &self,
        _ctx: &SourceContext,
        kind: DatasetKind,
        endpoint: &str,
    ) -> Result<FeatureCollection, SourceError> {
        let body = self.payloads.lock().unwrap().get(&kind).cloned();
        match body {
            Some(bytes) => parse_feature_collection(endpoint, &bytes),
            None => Err(SourceError::Io {
                path: PathBuf::from(endpoint),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "unreachable"),
            }),
        }
    }
}

fn collection(properties: &[Value]) -> Value {
    json!({
        "type": "FeatureCollection",
        "features": properties
            .iter()
            .map(|p| json!({ "type": "Feature", "geometry": null, "properties": p }))
            .collect::<Vec<_>>(),
    })
}

fn empty() -> Value {
    collection(&[])
}

fn test_config(policy: RowFailurePolicy) -> SyncConfig {
    let mut config = SyncConfig::from_lookup(|_| None).unwrap();
    config.row_failure_policy = policy;
    config
}

fn pipeline(source: Arc<StubSource>, endpoint: &MemoryEndpoint) -> SyncPipeline {
    SyncPipeline::new(
        &test_config(RowFailurePolicy::Abort),
        source,
        Arc::new(endpoint.clone()),
    )
}

fn oil_spill(status: &str) -> Value {
    json!({
        "lat": 44.5,
        "lon": 37.9,
        "status_us": status,
        "source": "patrol",
        "dt_auto": "2024-05-01T10:00:00",
        "type_surf": "oil"
    })
}

#[tokio::test]
async fn rerunning_a_status_change_updates_only_status_and_updated_at() {
    let source = Arc::new(
        StubSource::default()
            .with(DatasetKind::Pollution, collection(&[oil_spill("confirmed")]))
            .with(DatasetKind::Bird, empty())
            .with(DatasetKind::PickupPoint, empty()),
    );
    let endpoint = MemoryEndpoint::new();
    let pipeline = pipeline(Arc::clone(&source), &endpoint);

    let first = pipeline.run_once().await;
    assert!(first.all_succeeded());
    let before = endpoint.row(DatasetKind::Pollution, 44.5, 37.9).unwrap();
    assert_eq!(before.get("status"), Some(&BindValue::from("confirmed")));
    assert_eq!(before.get("info_source"), Some(&BindValue::from("patrol")));
    assert_eq!(before.get("surface_type"), Some(&BindValue::from("oil")));
    assert_eq!(
        before.get("discovered_at"),
        Some(&BindValue::from("2024-05-01T10:00:00"))
    );
    assert!(before.updated_at.is_none());

    source.set(DatasetKind::Pollution, collection(&[oil_spill("resolved")]));
    pipeline.run_once().await;

    let after = endpoint.row(DatasetKind::Pollution, 44.5, 37.9).unwrap();
    assert_eq!(endpoint.row_count(DatasetKind::Pollution), 1);
    assert_eq!(after.id, before.id);
    assert_eq!(after.created_at, before.created_at);
    assert_eq!(after.get("status"), Some(&BindValue::from("resolved")));
    assert!(after.updated_at.is_some());
    for column in ["latitude", "longitude", "info_source", "surface_type", "discovered_at"] {
        assert_eq!(after.get(column), before.get(column), "{column}");
    }
}

#[tokio::test]
async fn repeated_runs_leave_rows_unchanged() {
    let source = Arc::new(
        StubSource::default()
            .with(
                DatasetKind::Pollution,
                collection(&[oil_spill("confirmed"), json!({ "lat": 44.61, "lon": 37.72 })]),
            )
            .with(
                DatasetKind::Bird,
                collection(&[json!({ "lat": 45.0, "lon": 36.6, "comment": "captured" })]),
            )
            .with(
                DatasetKind::PickupPoint,
                collection(&[json!({ "lat": 44.9, "lon": 37.3 })]),
            ),
    );
    let endpoint = MemoryEndpoint::new();
    let pipeline = pipeline(source, &endpoint);

    pipeline.run_once().await;
    let after_first: Vec<_> = DatasetKind::ALL
        .iter()
        .map(|k| endpoint.rows(*k))
        .collect();
    pipeline.run_once().await;
    pipeline.run_once().await;

    let counts: Vec<usize> = after_first.iter().map(Vec::len).collect();
    assert_eq!(counts, vec![2, 1, 1]);
    for (kind, before) in DatasetKind::ALL.iter().zip(&after_first) {
        let after = endpoint.rows(*kind);
        assert_eq!(after.len(), before.len(), "{kind}");
        for (old, new) in before.iter().zip(&after) {
            assert_eq!(new.id, old.id, "{kind}");
            assert_eq!(new.created_at, old.created_at, "{kind}");
            assert_eq!(new.values, old.values, "{kind}");
        }
    }
}

#[tokio::test]
async fn later_feature_with_same_coordinates_wins() {
    let source = Arc::new(
        StubSource::default()
            .with(
                DatasetKind::PickupPoint,
                collection(&[
                    json!({ "lat": 44.9, "lon": 37.3, "status_us": "open" }),
                    json!({ "lat": 44.9, "lon": 37.3, "status_us": "closed" }),
                ]),
            )
            .with(DatasetKind::Pollution, empty())
            .with(DatasetKind::Bird, empty()),
    );
    let endpoint = MemoryEndpoint::new();

    let summary = pipeline(source, &endpoint).run_once().await;

    assert_eq!(
        summary.report(DatasetKind::PickupPoint).unwrap().outcome.processed(),
        2
    );
    let rows = endpoint.rows(DatasetKind::PickupPoint);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some(&BindValue::from("closed")));
}

#[tokio::test]
async fn failed_fetch_skips_only_that_dataset() {
    let source = Arc::new(
        StubSource::default()
            .with(
                DatasetKind::Bird,
                collection(&[json!({ "lat": 45.0, "lon": 36.6 })]),
            )
            .with(
                DatasetKind::PickupPoint,
                collection(&[json!({ "lat": 44.9, "lon": 37.3 })]),
            ),
    );
    let endpoint = MemoryEndpoint::new();

    let summary = pipeline(source, &endpoint).run_once().await;

    assert_eq!(summary.failed_count(), 1);
    assert!(!summary.all_succeeded());
    let pollution = summary.report(DatasetKind::Pollution).unwrap();
    match &pollution.outcome {
        ecomon_sync::DatasetOutcome::Aborted(err) => {
            assert_eq!(err.stage(), DatasetStage::Fetch)
        }
        other => panic!("expected pollution to abort, got {other:?}"),
    }
    assert_eq!(endpoint.row_count(DatasetKind::Pollution), 0);
    assert_eq!(endpoint.row_count(DatasetKind::Bird), 1);
    assert_eq!(endpoint.row_count(DatasetKind::PickupPoint), 1);
    assert_eq!(endpoint.sessions_opened(), 2);
    assert_eq!(endpoint.commits(), 2);
}

#[tokio::test]
async fn malformed_payload_aborts_at_parse_without_a_session() {
    let source = Arc::new(
        StubSource::default()
            .with_raw(DatasetKind::Pollution, "<html>maintenance</html>")
            .with(DatasetKind::Bird, empty())
            .with(DatasetKind::PickupPoint, empty()),
    );
    let endpoint = MemoryEndpoint::new();

    let summary = pipeline(source, &endpoint).run_once().await;

    let report = summary.report(DatasetKind::Pollution).unwrap();
    match &report.outcome {
        ecomon_sync::DatasetOutcome::Aborted(err) => {
            assert_eq!(err.stage(), DatasetStage::Parse)
        }
        other => panic!("expected parse failure, got {other:?}"),
    }
    assert!(report.summary_line().contains("aborted at parse"));
    assert_eq!(endpoint.sessions_opened(), 0);
}

#[tokio::test]
async fn empty_collections_succeed_without_opening_a_session() {
    let source = Arc::new(
        StubSource::default()
            .with(DatasetKind::Pollution, empty())
            .with_raw(DatasetKind::Bird, r#"{"type": "FeatureCollection"}"#)
            .with(DatasetKind::PickupPoint, empty()),
    );
    let endpoint = MemoryEndpoint::new();

    let summary = pipeline(source, &endpoint).run_once().await;

    assert!(summary.all_succeeded());
    assert_eq!(summary.total_processed(), 0);
    assert_eq!(endpoint.sessions_opened(), 0);
}

fn with_bad_latitude() -> Arc<StubSource> {
    Arc::new(
        StubSource::default()
            .with(
                DatasetKind::Pollution,
                collection(&[
                    json!({ "lat": 44.1, "lon": 37.1 }),
                    json!({ "lat": "north", "lon": 37.2 }),
                    json!({ "lat": 44.3, "lon": 37.3 }),
                ]),
            )
            .with(DatasetKind::Bird, empty())
            .with(DatasetKind::PickupPoint, empty()),
    )
}

#[tokio::test]
async fn rejected_row_aborts_the_whole_dataset_by_default() {
    let endpoint = MemoryEndpoint::new();
    let pipeline = SyncPipeline::new(
        &test_config(RowFailurePolicy::Abort),
        with_bad_latitude(),
        Arc::new(endpoint.clone()),
    );

    let summary = pipeline.run_once().await;

    let report = summary.report(DatasetKind::Pollution).unwrap();
    match &report.outcome {
        ecomon_sync::DatasetOutcome::Aborted(ecomon_sync::DatasetError::Reconcile {
            index,
            source,
        }) => {
            assert_eq!(*index, 1);
            assert!(source.is_row_rejection());
        }
        other => panic!("expected reconcile abort, got {other:?}"),
    }
    assert_eq!(endpoint.row_count(DatasetKind::Pollution), 0);
    assert_eq!(endpoint.commits(), 0);
}

#[tokio::test]
async fn skip_policy_commits_the_valid_rows() {
    let endpoint = MemoryEndpoint::new();
    let pipeline = SyncPipeline::new(
        &test_config(RowFailurePolicy::Skip),
        with_bad_latitude(),
        Arc::new(endpoint.clone()),
    );

    let summary = pipeline.run_once().await;

    let report = summary.report(DatasetKind::Pollution).unwrap();
    assert!(matches!(
        report.outcome,
        ecomon_sync::DatasetOutcome::Done {
            processed: 2,
            skipped: 1
        }
    ));
    assert_eq!(endpoint.row_count(DatasetKind::Pollution), 2);
    assert!(endpoint.row(DatasetKind::Pollution, 44.3, 37.3).is_some());
}

#[tokio::test]
async fn unreadable_discovery_time_is_rejected_like_the_database_would() {
    let source = Arc::new(
        StubSource::default()
            .with(
                DatasetKind::Pollution,
                collection(&[
                    oil_spill("confirmed"),
                    json!({ "lat": 44.2, "lon": 37.2, "dt_auto": "spring 2024" }),
                ]),
            )
            .with(DatasetKind::Bird, empty())
            .with(DatasetKind::PickupPoint, empty()),
    );
    let endpoint = MemoryEndpoint::new();

    let summary = pipeline(source, &endpoint).run_once().await;

    let report = summary.report(DatasetKind::Pollution).unwrap();
    match &report.outcome {
        ecomon_sync::DatasetOutcome::Aborted(ecomon_sync::DatasetError::Reconcile {
            index,
            source,
        }) => {
            assert_eq!(*index, 1);
            assert!(source.is_row_rejection());
        }
        other => panic!("expected reconcile abort, got {other:?}"),
    }
    assert_eq!(endpoint.row_count(DatasetKind::Pollution), 0);
}

#[tokio::test]
async fn only_enabled_datasets_are_processed() {
    let source = Arc::new(
        StubSource::default().with(
            DatasetKind::Bird,
            collection(&[json!({ "lat": 45.0, "lon": 36.6 })]),
        ),
    );
    let endpoint = MemoryEndpoint::new();
    let mut config = test_config(RowFailurePolicy::Abort);
    config.datasets.restrict_to(DatasetKind::Bird);

    let summary = SyncPipeline::new(&config, source, Arc::new(endpoint.clone()))
        .run_once()
        .await;

    assert_eq!(summary.datasets.len(), 1);
    assert!(summary.all_succeeded());
    assert_eq!(endpoint.row_count(DatasetKind::Bird), 1);
}

#[tokio::test]
async fn syncs_all_datasets_over_http() {
    let server = MockServer::start().await;
    let payloads = [
        (60, collection(&[oil_spill("confirmed")])),
        (
            100,
            collection(&[json!({ "lat": 45.0, "lon": 36.6, "comment": "Captured, oiled" })]),
        ),
        (98, collection(&[json!({ "lat": 44.9, "lon": 37.3 })])),
    ];
    for (resource_id, body) in payloads {
        Mock::given(method("GET"))
            .and(path(format!("/api/resource/{resource_id}/geojson")))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(&server)
            .await;
    }

    let snapshots = tempfile::tempdir().unwrap();
    let mut config = test_config(RowFailurePolicy::Abort);
    config.api_base_url = server.uri();
    config.snapshot_dir = Some(snapshots.path().to_path_buf());
    let source = SyncPipeline::http_source(&config).unwrap();
    let endpoint = MemoryEndpoint::new();

    let summary = SyncPipeline::new(&config, Arc::new(source), Arc::new(endpoint.clone()))
        .run_once()
        .await;

    assert!(summary.all_succeeded(), "{summary:?}");
    assert_eq!(summary.total_processed(), 3);
    let bird = endpoint.row(DatasetKind::Bird, 45.0, 36.6).unwrap();
    assert_eq!(bird.get("captured"), Some(&BindValue::Bool(true)));
    assert_eq!(bird.get("status"), Some(&BindValue::from("Unknown")));
    assert_eq!(bird.get("discovered_at"), Some(&BindValue::Null));
    assert!(std::fs::read_dir(snapshots.path()).unwrap().next().is_some());
}

#[tokio::test]
async fn http_error_status_aborts_dataset() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/resource/60/geojson"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(empty()))
        .mount(&server)
        .await;

    let mut config = test_config(RowFailurePolicy::Abort);
    config.api_base_url = server.uri();
    let source = SyncPipeline::http_source(&config).unwrap();
    let endpoint = MemoryEndpoint::new();

    let summary = SyncPipeline::new(&config, Arc::new(source), Arc::new(endpoint.clone()))
        .run_once()
        .await;

    assert_eq!(summary.failed_count(), 1);
    assert!(!summary.report(DatasetKind::Pollution).unwrap().outcome.is_done());
    assert!(summary.report(DatasetKind::Bird).unwrap().outcome.is_done());
    assert_eq!(endpoint.sessions_opened(), 0);
}

#[tokio::test]
async fn replays_sample_fixtures_from_disk() {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample");
    let endpoint = MemoryEndpoint::new();
    let pipeline = SyncPipeline::new(
        &test_config(RowFailurePolicy::Abort),
        Arc::new(FileFeatureSource::new(root)),
        Arc::new(endpoint.clone()),
    );

    let summary = pipeline.run_once().await;

    assert!(summary.all_succeeded(), "{summary:?}");
    let spill = endpoint.row(DatasetKind::Pollution, 44.5, 37.9).unwrap();
    assert_eq!(spill.get("status"), Some(&BindValue::from("confirmed")));
    let unlabelled = endpoint.row(DatasetKind::Pollution, 44.61, 37.72).unwrap();
    assert_eq!(unlabelled.get("status"), Some(&BindValue::from("Unknown")));
    assert!(matches!(
        unlabelled.get("discovered_at"),
        Some(BindValue::Timestamp(_))
    ));
}
