// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Engine configuration loaded from environment variables.

use std::path::PathBuf;

/// Analysis engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the planning WFS service.
    pub wfs_base_url: String,
    /// Feature typename of the planning classification layer.
    pub wfs_typename: String,
    /// Classification attribute on the planning layer.
    pub classification_field: String,
    /// Protection-scope attribute refining planning categories.
    pub scope_field: String,
    /// Per-request timeout in seconds for remote layer fetches.
    pub request_timeout_secs: u64,
    /// Retries after the initial attempt for transient fetch failures.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds (doubles per attempt).
    pub retry_base_ms: u64,
    /// Margin in metres added around a parcel extent for WFS queries, so
    /// neighbouring parcels reuse the cached extent.
    pub wfs_extent_margin_m: f64,
    /// Bounded worker pool size for batch processing.
    pub worker_count: usize,
    /// Directory where the downloader leaves `<referencia>.geojson` files.
    pub geometry_dir: PathBuf,
    /// Directory for persisted batch summaries.
    pub output_dir: PathBuf,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            wfs_base_url: std::env::var("AFECCIONES_WFS_URL").unwrap_or_else(|_| {
                "https://mapas-gis-inter.carm.es/geoserver/SIT_USU_PLA_URB_CARM/wfs".into()
            }),
            wfs_typename: std::env::var("AFECCIONES_WFS_TYPENAME")
                .unwrap_or_else(|_| "SIT_USU_PLA_URB_CARM:clases_plu_ze_37mun".into()),
            classification_field: std::env::var("AFECCIONES_CLASSIFICATION_FIELD")
                .unwrap_or_else(|_| "clasificacion".into()),
            scope_field: std::env::var("AFECCIONES_SCOPE_FIELD")
                .unwrap_or_else(|_| "ambito".into()),
            request_timeout_secs: std::env::var("AFECCIONES_REQUEST_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".into())
                .parse()
                .unwrap_or(30),
            max_retries: std::env::var("AFECCIONES_MAX_RETRIES")
                .unwrap_or_else(|_| "3".into())
                .parse()
                .unwrap_or(3),
            retry_base_ms: std::env::var("AFECCIONES_RETRY_BASE_MS")
                .unwrap_or_else(|_| "500".into())
                .parse()
                .unwrap_or(500),
            wfs_extent_margin_m: std::env::var("AFECCIONES_WFS_EXTENT_MARGIN_M")
                .unwrap_or_else(|_| "250".into())
                .parse()
                .unwrap_or(250.0),
            worker_count: std::env::var("AFECCIONES_WORKERS")
                .unwrap_or_else(|_| num_cpus::get().to_string())
                .parse()
                .unwrap_or_else(|_| num_cpus::get()),
            geometry_dir: std::env::var("AFECCIONES_GEOMETRY_DIR")
                .unwrap_or_else(|_| "descargas".into())
                .into(),
            output_dir: std::env::var("AFECCIONES_OUTPUT_DIR")
                .unwrap_or_else(|_| "resultados_lotes".into())
                .into(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
