// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Affection result records consumed by the report generator and the API
//! layer. Field names follow the legacy JSON contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Affected area and percentage for one classification category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryAffection {
    pub area_afectada_m2: f64,
    pub porcentaje: f64,
}

/// Result of overlaying one parcel against one classification layer.
///
/// Percentages are ratios against the parcel area, computed from unrounded
/// accumulated areas. `detalle` is ordered so repeated runs serialize
/// identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffectionResult {
    pub referencia: String,
    pub capa: String,
    pub area_parcela_m2: f64,
    pub detalle: BTreeMap<String, CategoryAffection>,
    pub total_afectado_m2: f64,
    pub total_afectado_percent: f64,
    /// Set when the analysis degraded (e.g. the planning service was
    /// unreachable and only cached or no data was available).
    #[serde(default)]
    pub parcial: bool,
    /// Path of a rendered comparison map, owned by the rendering
    /// collaborator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapa_path: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AffectionResult {
    /// Build a result from accumulated per-category areas in m².
    pub fn from_areas(
        referencia: impl Into<String>,
        capa: impl Into<String>,
        area_parcela_m2: f64,
        areas: impl IntoIterator<Item = (String, f64)>,
    ) -> Self {
        let mut detalle = BTreeMap::new();
        let mut total_afectado_m2 = 0.0;
        for (categoria, area) in areas {
            total_afectado_m2 += area;
            detalle.insert(
                categoria,
                CategoryAffection {
                    area_afectada_m2: area,
                    porcentaje: percentage(area, area_parcela_m2),
                },
            );
        }

        AffectionResult {
            referencia: referencia.into(),
            capa: capa.into(),
            area_parcela_m2,
            total_afectado_percent: percentage(total_afectado_m2, area_parcela_m2),
            total_afectado_m2,
            detalle,
            parcial: false,
            mapa_path: None,
            timestamp: Utc::now(),
        }
    }

    /// Zero-affection result for a parcel disjoint from the layer.
    pub fn empty(
        referencia: impl Into<String>,
        capa: impl Into<String>,
        area_parcela_m2: f64,
    ) -> Self {
        Self::from_areas(referencia, capa, area_parcela_m2, std::iter::empty())
    }

    /// Mark this result as degraded.
    pub fn into_partial(mut self) -> Self {
        self.parcial = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.detalle.is_empty()
    }
}

fn percentage(area: f64, parcel_area: f64) -> f64 {
    if parcel_area > 0.0 {
        area / parcel_area * 100.0
    } else {
        0.0
    }
}
