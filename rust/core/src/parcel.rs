// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Geometry source adapter: loads a downloaded parcel geometry file into a
//! validated multipolygon in the working projection.

use crate::crs::{self, Crs};
use crate::error::{Error, Result};
use crate::extent::Extent;
use crate::layer::{parse_feature_collection, polygonal_geometry};
use geo::{Area, MultiPolygon, Validation};
use std::path::Path;

/// Polygons below this area (m²) are treated as degenerate.
const MIN_PARCEL_AREA_M2: f64 = 1e-6;

/// A cadastral parcel polygon, immutable once loaded.
#[derive(Debug, Clone)]
pub struct ParcelGeometry {
    referencia: String,
    geometry: MultiPolygon<f64>,
    source_crs: Crs,
    area_m2: f64,
    extent: Extent,
}

impl ParcelGeometry {
    /// Cadastral reference this parcel was loaded for.
    pub fn referencia(&self) -> &str {
        &self.referencia
    }

    /// Parcel geometry in the working projection.
    pub fn geometry(&self) -> &MultiPolygon<f64> {
        &self.geometry
    }

    /// CRS the source file declared (or the inferred WGS84 default).
    pub fn source_crs(&self) -> Crs {
        self.source_crs
    }

    /// Parcel area in m², computed once at load time.
    pub fn area_m2(&self) -> f64 {
        self.area_m2
    }

    /// Bounding extent in the working projection.
    pub fn extent(&self) -> Extent {
        self.extent
    }
}

/// Load a parcel geometry file produced by the catastro downloader.
pub fn load_parcel(path: &Path, referencia: &str) -> Result<ParcelGeometry> {
    let content = std::fs::read_to_string(path)?;
    parcel_from_geojson(&content, referencia)
}

/// Decode a parcel from GeoJSON content.
///
/// The document must contain exactly one polygonal feature; a MultiPolygon
/// counts as one. The geometry is normalized to the working projection and
/// validated before any area is computed.
pub fn parcel_from_geojson(content: &str, referencia: &str) -> Result<ParcelGeometry> {
    let (features, source_crs) = parse_feature_collection(content)?;

    if features.is_empty() {
        return Err(Error::InvalidGeometry(format!(
            "{referencia}: geometry file contains no features"
        )));
    }
    if features.len() > 1 {
        return Err(Error::InvalidGeometry(format!(
            "{referencia}: expected a single parcel feature, found {}",
            features.len()
        )));
    }

    let feature = &features[0];
    let geometry = feature
        .geometry
        .as_ref()
        .ok_or_else(|| Error::InvalidGeometry(format!("{referencia}: feature has no geometry")))?;

    let multipolygon = polygonal_geometry(geometry)?.ok_or_else(|| {
        Error::InvalidGeometry(format!("{referencia}: parcel geometry is not polygonal"))
    })?;

    let working = crs::to_working(&multipolygon, source_crs);

    if !working.is_valid() {
        return Err(Error::InvalidGeometry(format!(
            "{referencia}: parcel polygon is self-intersecting or malformed"
        )));
    }

    let area_m2 = working.unsigned_area();
    if area_m2 < MIN_PARCEL_AREA_M2 {
        return Err(Error::InvalidGeometry(format!(
            "{referencia}: parcel polygon has zero area"
        )));
    }

    let extent = Extent::of(&working).ok_or_else(|| {
        Error::InvalidGeometry(format!("{referencia}: parcel polygon is empty"))
    })?;

    tracing::debug!(
        referencia,
        area_m2,
        source_epsg = source_crs.epsg(),
        "Parcel loaded"
    );

    Ok(ParcelGeometry {
        referencia: referencia.to_string(),
        geometry: working,
        source_crs,
        area_m2,
        extent,
    })
}
