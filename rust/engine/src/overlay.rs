// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Overlay engine: geometric intersection of a parcel against a
//! classification layer, aggregated per category.
//!
//! Overlapping features of the same category are summed independently;
//! categories are independently meaningful overlays, not a partition of the
//! parcel.

use afecciones_core::{
    AffectionResult, ClassificationLayer, Error, Extent, ParcelGeometry, Result, GENERIC_CATEGORY,
};
use geo::{Area, BooleanOps};
use rustc_hash::FxHashMap;

/// Intersections below this area (m²) are boolean-op noise, not affection.
const MIN_INTERSECTION_AREA_M2: f64 = 1e-6;

/// Overlay the parcel against a layer using a pinned classification field.
///
/// Features whose field value is null or missing contribute no category,
/// but the field must exist on at least one feature of a non-empty layer.
/// Disjoint parcel/layer extents yield a zero-affection result.
pub fn overlay(
    parcel: &ParcelGeometry,
    layer: &ClassificationLayer,
    classification_field: &str,
) -> Result<AffectionResult> {
    if layer.features.is_empty() {
        return Ok(AffectionResult::empty(
            parcel.referencia(),
            &layer.name,
            parcel.area_m2(),
        ));
    }

    let field_exists = layer
        .features
        .features
        .iter()
        .any(|f| f.has_field(classification_field));
    if !field_exists {
        return Err(Error::ClassificationFieldMissing {
            field: classification_field.to_string(),
            layer: layer.name.clone(),
        });
    }

    accumulate(parcel, layer, |feature| feature.attribute(classification_field))
}

/// Overlay with the layer's own classification field, detected from the
/// candidate list; a layer without any recognizable field is analyzed under
/// the single generic category.
pub fn overlay_auto(parcel: &ParcelGeometry, layer: &ClassificationLayer) -> Result<AffectionResult> {
    match layer.features.detect_classification_field() {
        Some(field) => overlay(parcel, layer, field),
        None => {
            tracing::debug!(layer = %layer.name, "No classification field, using generic category");
            accumulate(parcel, layer, |_| Some(GENERIC_CATEGORY.to_string()))
        }
    }
}

fn accumulate(
    parcel: &ParcelGeometry,
    layer: &ClassificationLayer,
    label_of: impl Fn(&afecciones_core::Feature) -> Option<String>,
) -> Result<AffectionResult> {
    let parcel_extent = parcel.extent();

    match layer.extent() {
        None => {
            return Ok(AffectionResult::empty(
                parcel.referencia(),
                &layer.name,
                parcel.area_m2(),
            ))
        }
        Some(layer_extent) if !layer_extent.intersects(&parcel_extent) => {
            tracing::debug!(
                layer = %layer.name,
                referencia = parcel.referencia(),
                "Parcel and layer extents are disjoint"
            );
            return Ok(AffectionResult::empty(
                parcel.referencia(),
                &layer.name,
                parcel.area_m2(),
            ));
        }
        Some(_) => {}
    }

    let mut areas: FxHashMap<String, f64> = FxHashMap::default();
    for feature in &layer.features.features {
        let Some(label) = label_of(feature) else {
            continue;
        };
        let Some(feature_extent) = Extent::of(&feature.geometry) else {
            continue;
        };
        if !feature_extent.intersects(&parcel_extent) {
            continue;
        }

        let intersection = parcel.geometry().intersection(&feature.geometry);
        let area = intersection.unsigned_area();
        if area > MIN_INTERSECTION_AREA_M2 {
            *areas.entry(label).or_insert(0.0) += area;
        }
    }

    tracing::debug!(
        layer = %layer.name,
        referencia = parcel.referencia(),
        categories = areas.len(),
        "Overlay complete"
    );

    Ok(AffectionResult::from_areas(
        parcel.referencia(),
        &layer.name,
        parcel.area_m2(),
        areas,
    ))
}
