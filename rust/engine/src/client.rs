// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Layer fetching: the `FetchLayer` seam and the production WFS client.

use afecciones_core::{Extent, FeatureSet, LayerDescriptor, WORKING_EPSG};
use async_trait::async_trait;
use std::time::Duration;

/// A single failed fetch attempt.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub reason: String,
    pub retryable: bool,
}

impl FetchFailure {
    /// Transient failure: timeouts, connection errors, 5xx responses.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    /// Permanent failure: malformed payloads, 4xx responses.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// Seam between the layer cache and the network. Tests substitute stubs.
#[async_trait]
pub trait FetchLayer: Send + Sync {
    async fn fetch(
        &self,
        descriptor: &LayerDescriptor,
        extent: &Extent,
    ) -> Result<FeatureSet, FetchFailure>;
}

/// WFS GetFeature client requesting GeoJSON in the working projection.
pub struct WfsClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl WfsClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl FetchLayer for WfsClient {
    async fn fetch(
        &self,
        descriptor: &LayerDescriptor,
        extent: &Extent,
    ) -> Result<FeatureSet, FetchFailure> {
        let (base_url, typename) = match descriptor {
            LayerDescriptor::Wfs { base_url, typename } => (base_url, typename),
            LayerDescriptor::Local { path, .. } => {
                // Local datasets flow through the same seam so callers can
                // cache them uniformly.
                let content = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| FetchFailure::permanent(e.to_string()))?;
                return FeatureSet::from_geojson_str(&content)
                    .map_err(|e| FetchFailure::permanent(e.to_string()));
            }
        };

        let srs = format!("urn:ogc:def:crs:EPSG::{WORKING_EPSG}");
        let bbox = format!(
            "{},{},{},{},{}",
            extent.min_x, extent.min_y, extent.max_x, extent.max_y, srs
        );

        tracing::debug!(typename = %typename, bbox = %bbox, "Requesting WFS layer");

        let response = self
            .http
            .get(base_url)
            .timeout(self.timeout)
            .query(&[
                ("service", "WFS"),
                ("version", "2.0.0"),
                ("request", "GetFeature"),
                ("typenames", typename.as_str()),
                ("outputFormat", "application/json"),
                ("srsName", srs.as_str()),
                ("bbox", bbox.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    FetchFailure::transient(format!("request failed: {e}"))
                } else {
                    FetchFailure::permanent(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FetchFailure::transient(format!(
                "server returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(FetchFailure::permanent(format!(
                "server returned {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchFailure::transient(format!("body read failed: {e}")))?;

        if body.trim().is_empty() {
            return Err(FetchFailure::transient("empty WFS response".to_string()));
        }

        FeatureSet::from_geojson_str(&body)
            .map_err(|e| FetchFailure::permanent(format!("WFS payload decode failed: {e}")))
    }
}
