// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end batch tests: geometry files on disk, a local primary layer,
//! and a stubbed planning service.

use afecciones_engine::{
    BatchOrchestrator, BatchStatus, BatchSummary, EngineConfig, FetchFailure, FetchLayer,
    LayerCache, RetryPolicy,
};
use afecciones_core::{Extent, FeatureSet, LayerDescriptor};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Scratch directory with geometry downloads and batch outputs, removed on
/// drop.
struct TestEnv {
    root: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let root = std::env::temp_dir().join(format!("afecciones-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(root.join("descargas")).unwrap();
        Self { root }
    }

    fn geometry_dir(&self) -> PathBuf {
        self.root.join("descargas")
    }

    fn output_dir(&self) -> PathBuf {
        self.root.join("resultados")
    }

    fn write_parcel(&self, referencia: &str) {
        // 25 m x 40 m rectangle = 1000 m².
        let content = r#"{"type":"FeatureCollection",
            "crs":{"type":"name","properties":{"name":"EPSG:25830"}},
            "features":[{"type":"Feature","properties":{},
              "geometry":{"type":"Polygon","coordinates":[[[0,0],[25,0],[25,40],[0,40],[0,0]]]}}]}"#;
        std::fs::write(
            self.geometry_dir().join(format!("{referencia}.geojson")),
            content,
        )
        .unwrap();
    }

    fn write_point_parcel(&self, referencia: &str) {
        let content = r#"{"type":"FeatureCollection",
            "crs":{"type":"name","properties":{"name":"EPSG:25830"}},
            "features":[{"type":"Feature","properties":{},
              "geometry":{"type":"Point","coordinates":[10,10]}}]}"#;
        std::fs::write(
            self.geometry_dir().join(format!("{referencia}.geojson")),
            content,
        )
        .unwrap();
    }

    /// Local primary layer: a 25 m x 20 m strip classified by `tipo`,
    /// covering half of the standard test parcel.
    fn write_primary_layer(&self) -> LayerDescriptor {
        let path = self.root.join("iepf_zonas.geojson");
        let content = r#"{"type":"FeatureCollection",
            "crs":{"type":"name","properties":{"name":"EPSG:25830"}},
            "features":[{"type":"Feature","properties":{"tipo":"Protegida"},
              "geometry":{"type":"Polygon","coordinates":[[[0,0],[25,0],[25,20],[0,20],[0,0]]]}}]}"#;
        std::fs::write(&path, content).unwrap();
        LayerDescriptor::local(path)
    }

    fn config(&self, worker_count: usize) -> EngineConfig {
        EngineConfig {
            wfs_base_url: "https://example.test/wfs".into(),
            wfs_typename: "plu:clases".into(),
            classification_field: "clasificacion".into(),
            scope_field: "ambito".into(),
            request_timeout_secs: 5,
            max_retries: 1,
            retry_base_ms: 1,
            wfs_extent_margin_m: 250.0,
            worker_count,
            geometry_dir: self.geometry_dir(),
            output_dir: self.output_dir(),
        }
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

const PLANNING_PAYLOAD: &str = r#"{"type":"FeatureCollection",
    "crs":{"type":"name","properties":{"name":"EPSG:25830"}},
    "features":[{"type":"Feature",
      "properties":{"clasificacion":"Suelo Urbano"},
      "geometry":{"type":"Polygon","coordinates":
        [[[-1000,-1000],[1000,-1000],[1000,1000],[-1000,1000],[-1000,-1000]]]}}]}"#;

/// Same coverage, but without any classification attribute.
const UNCLASSIFIED_PAYLOAD: &str = r#"{"type":"FeatureCollection",
    "crs":{"type":"name","properties":{"name":"EPSG:25830"}},
    "features":[{"type":"Feature",
      "properties":{"otra":"x"},
      "geometry":{"type":"Polygon","coordinates":
        [[[-1000,-1000],[1000,-1000],[1000,1000],[-1000,1000],[-1000,-1000]]]}}]}"#;

/// Stubbed planning service covering the whole test area.
struct PlanningStub {
    payload: &'static str,
    unreachable: AtomicBool,
    delay: Duration,
}

impl PlanningStub {
    fn up() -> Arc<Self> {
        Arc::new(Self {
            payload: PLANNING_PAYLOAD,
            unreachable: AtomicBool::new(false),
            delay: Duration::ZERO,
        })
    }

    fn down() -> Arc<Self> {
        Arc::new(Self {
            payload: PLANNING_PAYLOAD,
            unreachable: AtomicBool::new(true),
            delay: Duration::ZERO,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            payload: PLANNING_PAYLOAD,
            unreachable: AtomicBool::new(false),
            delay,
        })
    }

    fn without_classification_field() -> Arc<Self> {
        Arc::new(Self {
            payload: UNCLASSIFIED_PAYLOAD,
            unreachable: AtomicBool::new(false),
            delay: Duration::ZERO,
        })
    }
}

#[async_trait]
impl FetchLayer for PlanningStub {
    async fn fetch(
        &self,
        _descriptor: &LayerDescriptor,
        _extent: &Extent,
    ) -> Result<FeatureSet, FetchFailure> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(FetchFailure::transient("connection refused"));
        }
        FeatureSet::from_geojson_str(self.payload)
            .map_err(|e| FetchFailure::permanent(e.to_string()))
    }
}

fn orchestrator(env: &TestEnv, stub: Arc<PlanningStub>, worker_count: usize) -> BatchOrchestrator {
    let cache = Arc::new(LayerCache::new(
        stub,
        RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
        },
    ));
    let primary = vec![env.write_primary_layer()];
    BatchOrchestrator::new(env.config(worker_count), cache, primary)
}

async fn wait_for_summary(orchestrator: &BatchOrchestrator, lote_id: &Uuid) -> BatchSummary {
    for _ in 0..500 {
        if let Some(summary) = orchestrator.get_summary(lote_id) {
            return summary;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("batch {lote_id} did not complete in time");
}

#[tokio::test]
async fn test_reference_failure_does_not_poison_the_batch() {
    let env = TestEnv::new();
    env.write_parcel("30016A00100001");
    env.write_point_parcel("30016A00100002");
    env.write_parcel("30016A00100003");

    let orchestrator = orchestrator(&env, PlanningStub::up(), 2);
    let lote_id = orchestrator.submit(vec![
        "30016A00100001".into(),
        "30016A00100002".into(),
        "30016A00100003".into(),
    ]);

    let summary = wait_for_summary(&orchestrator, &lote_id).await;
    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.parciales, 0);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].referencia, "30016A00100002");
    assert_eq!(summary.failures[0].categoria, "geometria_invalida");

    let outcome = orchestrator
        .get_outcome(&lote_id, "30016A00100001")
        .unwrap();
    assert!(!outcome.is_partial());
    assert_eq!(outcome.afecciones.len(), 1);
    assert!(outcome.afecciones[0].detalle.contains_key("Protegida"));
    assert!(outcome.urbanismo.detalle.contains_key("Suelo Urbano"));
}

#[tokio::test]
async fn test_unreachable_planning_service_degrades_not_fails() {
    let env = TestEnv::new();
    env.write_parcel("30016A00200001");

    let orchestrator = orchestrator(&env, PlanningStub::down(), 2);
    let lote_id = orchestrator.submit(vec!["30016A00200001".into()]);

    let summary = wait_for_summary(&orchestrator, &lote_id).await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.parciales, 1);

    let outcome = orchestrator
        .get_outcome(&lote_id, "30016A00200001")
        .unwrap();
    assert!(outcome.is_partial());
    assert!(outcome.urbanismo.is_empty());
    // Primary layers are local and unaffected by the outage.
    assert_eq!(outcome.afecciones.len(), 1);
}

#[tokio::test]
async fn test_planning_layer_without_field_degrades_not_fails() {
    let env = TestEnv::new();
    env.write_parcel("30016A00200002");

    let orchestrator = orchestrator(&env, PlanningStub::without_classification_field(), 2);
    let lote_id = orchestrator.submit(vec!["30016A00200002".into()]);

    let summary = wait_for_summary(&orchestrator, &lote_id).await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.parciales, 1);

    // The primary overlay survives; only the urbanistic half degrades.
    let outcome = orchestrator
        .get_outcome(&lote_id, "30016A00200002")
        .unwrap();
    assert!(outcome.urbanismo.parcial);
    assert!(outcome.urbanismo.is_empty());
    assert_eq!(outcome.afecciones.len(), 1);
    assert!(outcome.afecciones[0].detalle.contains_key("Protegida"));
}

#[tokio::test]
async fn test_from_config_wires_the_production_client() {
    let env = TestEnv::new();
    env.write_parcel("30016A00700001");

    let mut config = env.config(2);
    // Nothing listens on the discard port; connections are refused at once,
    // exercising the configured retry policy end to end.
    config.wfs_base_url = "http://127.0.0.1:9".into();
    let primary = vec![env.write_primary_layer()];
    let orchestrator = BatchOrchestrator::from_config(config, primary);

    let lote_id = orchestrator.submit(vec!["30016A00700001".into()]);
    let summary = wait_for_summary(&orchestrator, &lote_id).await;
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.parciales, 1);
}

#[tokio::test]
async fn test_abandoned_batch_fails_pending_references() {
    let env = TestEnv::new();
    for i in 1..=4 {
        env.write_parcel(&format!("30016A0030000{i}"));
    }

    // One worker and a slow planning service keep later references pending
    // long enough to abandon them.
    let orchestrator = orchestrator(&env, PlanningStub::slow(Duration::from_millis(300)), 1);
    let lote_id = orchestrator.submit(vec![
        "30016A00300001".into(),
        "30016A00300002".into(),
        "30016A00300003".into(),
        "30016A00300004".into(),
    ]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(orchestrator.abandon(&lote_id));

    let summary = wait_for_summary(&orchestrator, &lote_id).await;
    assert_eq!(summary.total, 4);
    let abandoned = summary
        .failures
        .iter()
        .filter(|f| f.categoria == "abandonado")
        .count();
    assert!(abandoned >= 1, "no reference was abandoned");
    // In-flight work still completes normally.
    assert!(summary.succeeded >= 1);
    assert_eq!(summary.succeeded + summary.failed, 4);
}

#[tokio::test]
async fn test_status_buckets_always_sum_to_total() {
    let env = TestEnv::new();
    for i in 1..=5 {
        env.write_parcel(&format!("30016A0040000{i}"));
    }

    let orchestrator = orchestrator(&env, PlanningStub::slow(Duration::from_millis(20)), 2);
    let referencias: Vec<String> = (1..=5).map(|i| format!("30016A0040000{i}")).collect();
    let lote_id = orchestrator.submit(referencias);

    loop {
        let Some(status) = orchestrator.get_status(&lote_id) else {
            panic!("unknown batch");
        };
        let BatchStatus {
            total,
            pending,
            processing,
            succeeded,
            failed,
        } = status;
        assert_eq!(pending + processing + succeeded + failed, total);
        if orchestrator.get_summary(&lote_id).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_duplicate_references_are_collapsed() {
    let env = TestEnv::new();
    env.write_parcel("30016A00500001");

    let orchestrator = orchestrator(&env, PlanningStub::up(), 2);
    let lote_id = orchestrator.submit(vec![
        "30016A00500001".into(),
        "30016A00500001".into(),
        "30016A00500001".into(),
    ]);

    let summary = wait_for_summary(&orchestrator, &lote_id).await;
    assert_eq!(summary.total, 1);
    assert_eq!(summary.succeeded, 1);
}

#[tokio::test]
async fn test_summary_is_persisted_as_json() {
    let env = TestEnv::new();
    env.write_parcel("30016A00600001");

    let orchestrator = orchestrator(&env, PlanningStub::up(), 2);
    let lote_id = orchestrator.submit(vec!["30016A00600001".into()]);
    wait_for_summary(&orchestrator, &lote_id).await;

    let path = env.output_dir().join(format!("{lote_id}_resumen.json"));
    // The summary is written after the job turns terminal; allow a moment.
    let mut content = None;
    for _ in 0..100 {
        if let Ok(c) = std::fs::read_to_string(&path) {
            content = Some(c);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let parsed: serde_json::Value =
        serde_json::from_str(&content.expect("summary file missing")).unwrap();
    assert_eq!(parsed["lote_id"], lote_id.to_string());
    assert_eq!(parsed["total"], 1);
    assert_eq!(parsed["succeeded"], 1);
    assert_eq!(parsed["failed"], 0);
}

#[tokio::test]
async fn test_unknown_batch_has_no_status() {
    let env = TestEnv::new();
    let orchestrator = orchestrator(&env, PlanningStub::up(), 2);
    let unknown = Uuid::new_v4();
    assert!(orchestrator.get_status(&unknown).is_none());
    assert!(orchestrator.get_summary(&unknown).is_none());
    assert!(!orchestrator.abandon(&unknown));
}
