// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Classification layers: feature records with polygonal geometry and a
//! loosely-typed attribute map.
//!
//! Layers come from local vector files or remote WFS services. Both decode
//! through GeoJSON and normalize into the working projection, so the overlay
//! engine never sees mixed coordinate systems.

use crate::crs::{self, Crs};
use crate::error::{Error, Result};
use crate::extent::Extent;
use geo::MultiPolygon;
use geojson::GeoJson;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Attribute names probed, in order, when no classification field is pinned.
///
/// Matches the field list the legacy analysis used against heterogeneous
/// municipal datasets.
pub const CLASSIFICATION_FIELD_CANDIDATES: [&str; 8] = [
    "clasificacion",
    "clase",
    "tipo",
    "uso",
    "category",
    "name",
    "nombre",
    "denominacion",
];

/// Synthetic category used when a layer carries no recognizable
/// classification attribute at all.
pub const GENERIC_CATEGORY: &str = "General";

/// A single layer feature: polygonal geometry plus its attribute record.
#[derive(Debug, Clone)]
pub struct Feature {
    pub geometry: MultiPolygon<f64>,
    pub attributes: Map<String, Value>,
}

impl Feature {
    pub fn new(geometry: MultiPolygon<f64>, attributes: Map<String, Value>) -> Self {
        Self {
            geometry,
            attributes,
        }
    }

    /// True if the attribute key exists on this feature, even with a null
    /// value. Field presence and value presence are distinct conditions.
    pub fn has_field(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Non-null attribute value rendered as a string.
    ///
    /// Numeric and boolean classification codes are stringified; null,
    /// missing and empty values yield `None`.
    pub fn attribute(&self, name: &str) -> Option<String> {
        match self.attributes.get(name)? {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn set_attribute(&mut self, name: &str, value: String) {
        self.attributes.insert(name.to_string(), Value::String(value));
    }
}

/// An immutable set of features, as stored in the layer cache.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub features: Vec<Feature>,
}

impl FeatureSet {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    /// Decode a GeoJSON document into a feature set in the working
    /// projection. Non-polygonal features are skipped; classification
    /// overlay is polygon-on-polygon only.
    pub fn from_geojson_str(content: &str) -> Result<FeatureSet> {
        let (raw_features, source_crs) = parse_feature_collection(content)?;

        let mut features = Vec::with_capacity(raw_features.len());
        let mut skipped = 0usize;
        for raw in raw_features {
            let Some(geometry) = raw.geometry.as_ref() else {
                skipped += 1;
                continue;
            };
            match polygonal_geometry(geometry)? {
                Some(mp) => {
                    let attributes = raw.properties.unwrap_or_default();
                    features.push(Feature::new(crs::to_working(&mp, source_crs), attributes));
                }
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            tracing::debug!(skipped, kept = features.len(), "Skipped non-polygonal features");
        }

        Ok(FeatureSet::new(features))
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// First candidate attribute present on any feature, if one exists.
    pub fn detect_classification_field(&self) -> Option<&'static str> {
        CLASSIFICATION_FIELD_CANDIDATES
            .iter()
            .copied()
            .find(|candidate| self.features.iter().any(|f| f.has_field(candidate)))
    }

    /// Bounding extent over all features, `None` for an empty set.
    pub fn extent(&self) -> Option<Extent> {
        let mut acc: Option<Extent> = None;
        for f in &self.features {
            if let Some(e) = Extent::of(&f.geometry) {
                acc = Some(match acc {
                    None => e,
                    Some(prev) => Extent::new(
                        prev.min_x.min(e.min_x),
                        prev.min_y.min(e.min_y),
                        prev.max_x.max(e.max_x),
                        prev.max_y.max(e.max_y),
                    ),
                });
            }
        }
        acc
    }
}

/// Where a classification layer comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LayerDescriptor {
    /// Local vector dataset addressed by file path.
    Local { path: PathBuf, name: String },
    /// Remote WFS feature type.
    Wfs { base_url: String, typename: String },
}

impl LayerDescriptor {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        LayerDescriptor::Local { path, name }
    }

    pub fn wfs(base_url: impl Into<String>, typename: impl Into<String>) -> Self {
        LayerDescriptor::Wfs {
            base_url: base_url.into(),
            typename: typename.into(),
        }
    }

    /// Stable identifier used as the cache key prefix.
    pub fn id(&self) -> String {
        match self {
            LayerDescriptor::Local { path, .. } => format!("local:{}", path.display()),
            LayerDescriptor::Wfs { base_url, typename } => {
                format!("wfs:{base_url}#{typename}")
            }
        }
    }

    /// Human-readable layer name for results and logs.
    pub fn name(&self) -> &str {
        match self {
            LayerDescriptor::Local { name, .. } => name,
            LayerDescriptor::Wfs { typename, .. } => typename,
        }
    }
}

/// A named, read-only classification layer ready for overlay.
#[derive(Debug, Clone)]
pub struct ClassificationLayer {
    pub name: String,
    pub features: FeatureSet,
}

impl ClassificationLayer {
    pub fn new(name: impl Into<String>, features: FeatureSet) -> Self {
        Self {
            name: name.into(),
            features,
        }
    }

    /// Load a local GeoJSON layer, taking its name from the file stem.
    pub fn load_local(path: &Path) -> Result<ClassificationLayer> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let content = std::fs::read_to_string(path)?;
        let features = FeatureSet::from_geojson_str(&content)?;
        tracing::debug!(layer = %name, features = features.len(), "Loaded local layer");
        Ok(ClassificationLayer::new(name, features))
    }

    pub fn extent(&self) -> Option<Extent> {
        self.features.extent()
    }
}

/// Parse a GeoJSON document into its raw features and declared CRS.
///
/// A bare Feature or Geometry is treated as a one-element collection. An
/// absent `crs` member means WGS84 per RFC 7946.
pub(crate) fn parse_feature_collection(
    content: &str,
) -> Result<(Vec<geojson::Feature>, Crs)> {
    let gj: GeoJson = content
        .parse()
        .map_err(|e: geojson::Error| Error::Decode(e.to_string()))?;

    let collection = match gj {
        GeoJson::FeatureCollection(fc) => fc,
        GeoJson::Feature(feature) => geojson::FeatureCollection {
            bbox: None,
            features: vec![feature],
            foreign_members: None,
        },
        GeoJson::Geometry(geometry) => geojson::FeatureCollection {
            bbox: None,
            features: vec![geojson::Feature {
                bbox: None,
                geometry: Some(geometry),
                id: None,
                properties: None,
                foreign_members: None,
            }],
            foreign_members: None,
        },
    };

    let source_crs = declared_crs(collection.foreign_members.as_ref())?;
    Ok((collection.features, source_crs))
}

fn declared_crs(foreign_members: Option<&Map<String, Value>>) -> Result<Crs> {
    let Some(crs_member) = foreign_members.and_then(|m| m.get("crs")) else {
        return Ok(Crs::Wgs84);
    };
    let name = crs_member
        .pointer("/properties/name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::UnsupportedProjection("malformed crs member".into()))?;
    Crs::parse(name)
}

/// Convert a GeoJSON geometry into a multipolygon, `None` for other types.
pub(crate) fn polygonal_geometry(
    geometry: &geojson::Geometry,
) -> Result<Option<MultiPolygon<f64>>> {
    let converted: geo::Geometry<f64> = geometry
        .value
        .clone()
        .try_into()
        .map_err(|e: geojson::Error| Error::Decode(e.to_string()))?;

    Ok(match converted {
        geo::Geometry::Polygon(p) => Some(MultiPolygon(vec![p])),
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        _ => None,
    })
}
