// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Spatial affection analysis engine.
//!
//! Orchestrates the full pipeline over cadastral parcels: local geometry
//! loading, remote classification layers behind a single-flight cache,
//! per-category geometric overlay, urbanistic classification with graceful
//! degradation, and batch processing with per-reference state tracking.

pub mod batch;
pub mod cache;
pub mod client;
pub mod config;
pub mod overlay;
pub mod urbanistic;

pub use batch::{
    BatchOrchestrator, BatchStatus, BatchSummary, FailureEntry, ReferenceOutcome, ReferenceState,
};
pub use cache::{LayerCache, RetryPolicy};
pub use client::{FetchFailure, FetchLayer, WfsClient};
pub use config::EngineConfig;
pub use overlay::{overlay, overlay_auto};
pub use urbanistic::UrbanisticClassifier;
