// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Batch orchestration: runs the analysis pipeline over a list of cadastral
//! references with per-reference state tracking.
//!
//! References are processed independently on a bounded worker pool; a
//! failure on one reference never aborts or corrupts its siblings. The only
//! shared mutable resource across the pool is the layer cache.

use crate::cache::{LayerCache, RetryPolicy};
use crate::client::WfsClient;
use crate::config::EngineConfig;
use crate::overlay::overlay_auto;
use crate::urbanistic::UrbanisticClassifier;
use afecciones_core::{
    load_parcel, AffectionResult, ClassificationLayer, Error, LayerDescriptor, ParcelGeometry,
    Result,
};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Per-reference processing state.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "estado", rename_all = "snake_case")]
pub enum ReferenceState {
    Pending,
    Processing,
    Succeeded,
    Failed { categoria: String, mensaje: String },
}

impl ReferenceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReferenceState::Succeeded | ReferenceState::Failed { .. })
    }
}

/// Consistent snapshot of a batch's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchStatus {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// One failed reference in a batch summary.
#[derive(Debug, Clone, Serialize)]
pub struct FailureEntry {
    pub referencia: String,
    pub categoria: String,
    pub mensaje: String,
}

/// Terminal batch summary, persisted as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub lote_id: Uuid,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Successes whose urbanistic analysis degraded to partial data.
    pub parciales: usize,
    pub failures: Vec<FailureEntry>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Full analysis output for one reference.
#[derive(Debug, Clone)]
pub struct ReferenceOutcome {
    /// One result per primary classification layer.
    pub afecciones: Vec<AffectionResult>,
    /// Planning-layer result, possibly flagged `parcial`.
    pub urbanismo: AffectionResult,
}

impl ReferenceOutcome {
    pub fn is_partial(&self) -> bool {
        self.urbanismo.parcial
    }
}

struct BatchJob {
    referencias: Vec<String>,
    states: FxHashMap<String, ReferenceState>,
    outcomes: FxHashMap<String, ReferenceOutcome>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    abandoned: bool,
}

impl BatchJob {
    fn new(referencias: Vec<String>) -> Self {
        let states = referencias
            .iter()
            .map(|r| (r.clone(), ReferenceState::Pending))
            .collect();
        Self {
            referencias,
            states,
            outcomes: FxHashMap::default(),
            created_at: Utc::now(),
            completed_at: None,
            abandoned: false,
        }
    }

    fn status(&self) -> BatchStatus {
        let mut status = BatchStatus {
            total: self.referencias.len(),
            pending: 0,
            processing: 0,
            succeeded: 0,
            failed: 0,
        };
        for state in self.states.values() {
            match state {
                ReferenceState::Pending => status.pending += 1,
                ReferenceState::Processing => status.processing += 1,
                ReferenceState::Succeeded => status.succeeded += 1,
                ReferenceState::Failed { .. } => status.failed += 1,
            }
        }
        status
    }

    fn is_terminal(&self) -> bool {
        self.states.values().all(ReferenceState::is_terminal)
    }

    fn summary(&self, lote_id: Uuid) -> Option<BatchSummary> {
        let completed_at = self.completed_at?;
        let status = self.status();
        // Failures in submission order for stable summaries.
        let failures = self
            .referencias
            .iter()
            .filter_map(|r| match self.states.get(r) {
                Some(ReferenceState::Failed { categoria, mensaje }) => Some(FailureEntry {
                    referencia: r.clone(),
                    categoria: categoria.clone(),
                    mensaje: mensaje.clone(),
                }),
                _ => None,
            })
            .collect();
        let parciales = self.outcomes.values().filter(|o| o.is_partial()).count();

        Some(BatchSummary {
            lote_id,
            total: status.total,
            succeeded: status.succeeded,
            failed: status.failed,
            parciales,
            failures,
            created_at: self.created_at,
            completed_at,
        })
    }
}

struct Inner {
    config: EngineConfig,
    cache: Arc<LayerCache>,
    urbanistic: UrbanisticClassifier,
    primary_layers: Vec<LayerDescriptor>,
    jobs: StdMutex<FxHashMap<Uuid, BatchJob>>,
    semaphore: Arc<Semaphore>,
}

/// Orchestrates batches of references over a bounded worker pool.
#[derive(Clone)]
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
}

impl BatchOrchestrator {
    pub fn new(
        config: EngineConfig,
        cache: Arc<LayerCache>,
        primary_layers: Vec<LayerDescriptor>,
    ) -> Self {
        let urbanistic = UrbanisticClassifier::new(Arc::clone(&cache), &config);
        let semaphore = Arc::new(Semaphore::new(config.worker_count.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                cache,
                urbanistic,
                primary_layers,
                jobs: StdMutex::new(FxHashMap::default()),
                semaphore,
            }),
        }
    }

    /// Production wiring: a `WfsClient` and `RetryPolicy` built from the
    /// configuration's timeout and retry settings.
    pub fn from_config(config: EngineConfig, primary_layers: Vec<LayerDescriptor>) -> Self {
        let client = WfsClient::new(Duration::from_secs(config.request_timeout_secs));
        let cache = Arc::new(LayerCache::new(
            Arc::new(client),
            RetryPolicy::from_config(&config),
        ));
        Self::new(config, cache, primary_layers)
    }

    /// Submit a batch of references; processing starts immediately on the
    /// current runtime. Duplicate references are collapsed, keeping order.
    pub fn submit(&self, referencias: Vec<String>) -> Uuid {
        let mut seen = std::collections::HashSet::new();
        let referencias: Vec<String> = referencias
            .into_iter()
            .filter(|r| seen.insert(r.clone()))
            .collect();

        let lote_id = Uuid::new_v4();
        tracing::info!(lote = %lote_id, referencias = referencias.len(), "Batch submitted");
        {
            let mut jobs = self.lock_jobs();
            jobs.insert(lote_id, BatchJob::new(referencias.clone()));
        }

        let this = self.clone();
        tokio::spawn(async move { this.run_batch(lote_id, referencias).await });
        lote_id
    }

    /// Progress snapshot, safe to call at any time.
    pub fn get_status(&self, lote_id: &Uuid) -> Option<BatchStatus> {
        self.lock_jobs().get(lote_id).map(BatchJob::status)
    }

    /// Terminal summary; `None` until every reference is terminal.
    pub fn get_summary(&self, lote_id: &Uuid) -> Option<BatchSummary> {
        self.lock_jobs()
            .get(lote_id)
            .and_then(|job| job.summary(*lote_id))
    }

    /// Analysis output for a finished reference.
    pub fn get_outcome(&self, lote_id: &Uuid, referencia: &str) -> Option<ReferenceOutcome> {
        self.lock_jobs()
            .get(lote_id)
            .and_then(|job| job.outcomes.get(referencia).cloned())
    }

    /// Stop dequeueing pending references; in-flight work finishes.
    pub fn abandon(&self, lote_id: &Uuid) -> bool {
        let mut jobs = self.lock_jobs();
        match jobs.get_mut(lote_id) {
            Some(job) => {
                job.abandoned = true;
                tracing::info!(lote = %lote_id, "Batch abandoned");
                true
            }
            None => false,
        }
    }

    async fn run_batch(&self, lote_id: Uuid, referencias: Vec<String>) {
        let mut workers = JoinSet::new();
        for referencia in referencias {
            let this = self.clone();
            let semaphore = Arc::clone(&self.inner.semaphore);
            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                if !this.begin_processing(lote_id, &referencia) {
                    return;
                }
                let outcome = this.process_reference(&referencia).await;
                this.record_outcome(lote_id, &referencia, outcome);
            });
        }
        while workers.join_next().await.is_some() {}
        self.finalize(lote_id).await;
    }

    /// `pending -> processing`, unless the batch was abandoned, in which
    /// case the reference fails with the `abandonado` category so the batch
    /// can still reach a terminal state.
    fn begin_processing(&self, lote_id: Uuid, referencia: &str) -> bool {
        let mut jobs = self.lock_jobs();
        let Some(job) = jobs.get_mut(&lote_id) else {
            return false;
        };
        if job.abandoned {
            job.states.insert(
                referencia.to_string(),
                ReferenceState::Failed {
                    categoria: "abandonado".into(),
                    mensaje: "batch abandoned before processing started".into(),
                },
            );
            return false;
        }
        job.states
            .insert(referencia.to_string(), ReferenceState::Processing);
        tracing::debug!(lote = %lote_id, referencia, "Processing reference");
        true
    }

    fn record_outcome(
        &self,
        lote_id: Uuid,
        referencia: &str,
        outcome: Result<ReferenceOutcome>,
    ) {
        let mut jobs = self.lock_jobs();
        let Some(job) = jobs.get_mut(&lote_id) else {
            return;
        };
        match outcome {
            Ok(outcome) => {
                tracing::info!(
                    lote = %lote_id,
                    referencia,
                    parcial = outcome.is_partial(),
                    "Reference succeeded"
                );
                job.outcomes.insert(referencia.to_string(), outcome);
                job.states
                    .insert(referencia.to_string(), ReferenceState::Succeeded);
            }
            Err(e) => {
                tracing::warn!(lote = %lote_id, referencia, error = %e, "Reference failed");
                job.states.insert(
                    referencia.to_string(),
                    ReferenceState::Failed {
                        categoria: e.category().to_string(),
                        mensaje: e.to_string(),
                    },
                );
            }
        }
    }

    /// Per-reference pipeline: geometry adapter, then the primary overlays
    /// and the urbanistic classifier concurrently.
    async fn process_reference(&self, referencia: &str) -> Result<ReferenceOutcome> {
        let path = self
            .inner
            .config
            .geometry_dir
            .join(format!("{referencia}.geojson"));
        // File decode is synchronous work; keep it off the async workers.
        let referencia_owned = referencia.to_string();
        let parcel = tokio::task::spawn_blocking(move || load_parcel(&path, &referencia_owned))
            .await
            .map_err(join_error)??;

        let (afecciones, urbanismo) = tokio::join!(
            self.primary_overlays(&parcel),
            self.inner.urbanistic.analyze(&parcel)
        );
        Ok(ReferenceOutcome {
            afecciones: afecciones?,
            urbanismo: urbanismo?,
        })
    }

    /// Overlay the parcel against every primary classification layer.
    ///
    /// A layer that fails to load or lacks a usable classification field is
    /// skipped; a remote fetch failure on the primary path is fatal for the
    /// reference.
    async fn primary_overlays(&self, parcel: &ParcelGeometry) -> Result<Vec<AffectionResult>> {
        let mut results = Vec::with_capacity(self.inner.primary_layers.len());
        for descriptor in &self.inner.primary_layers {
            let layer = match descriptor {
                LayerDescriptor::Local { path, .. } => {
                    let path = path.clone();
                    let loaded =
                        tokio::task::spawn_blocking(move || ClassificationLayer::load_local(&path))
                            .await
                            .map_err(join_error)
                            .and_then(|r| r);
                    match loaded {
                        Ok(layer) => layer,
                        Err(e) => {
                            tracing::warn!(
                                layer = %descriptor.name(),
                                error = %e,
                                "Skipping unloadable local layer"
                            );
                            continue;
                        }
                    }
                }
                LayerDescriptor::Wfs { .. } => {
                    let query = parcel
                        .extent()
                        .expanded(self.inner.config.wfs_extent_margin_m);
                    let features = self.inner.cache.fetch(descriptor, &query, false).await?;
                    ClassificationLayer::new(descriptor.name().to_string(), (*features).clone())
                }
            };

            match overlay_auto(parcel, &layer) {
                Ok(result) => results.push(result),
                Err(e @ Error::ClassificationFieldMissing { .. }) => {
                    tracing::warn!(layer = %layer.name, error = %e, "Layer skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    async fn finalize(&self, lote_id: Uuid) {
        let summary = {
            let mut jobs = self.lock_jobs();
            let Some(job) = jobs.get_mut(&lote_id) else {
                return;
            };
            if !job.is_terminal() {
                tracing::error!(lote = %lote_id, "Batch finalize with non-terminal references");
            }
            job.completed_at = Some(Utc::now());
            job.summary(lote_id)
        };

        let Some(summary) = summary else { return };
        let (hits, misses) = self.inner.cache.stats();
        tracing::info!(
            lote = %lote_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            parciales = summary.parciales,
            cache_hits = hits,
            cache_misses = misses,
            "Batch complete"
        );

        if let Err(e) = self.persist_summary(&summary).await {
            tracing::error!(lote = %lote_id, error = %e, "Could not persist batch summary");
        }
    }

    async fn persist_summary(&self, summary: &BatchSummary) -> Result<()> {
        let dir = &self.inner.config.output_dir;
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}_resumen.json", summary.lote_id));
        let bytes =
            serde_json::to_vec_pretty(summary).map_err(|e| Error::Decode(e.to_string()))?;
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(path = %path.display(), "Batch summary persisted");
        Ok(())
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, FxHashMap<Uuid, BatchJob>> {
        self.inner.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}
