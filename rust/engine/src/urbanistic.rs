// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Urbanistic classifier: overlay against the designated remote planning
//! layer, with protection-scope label refinement and graceful degradation
//! when the service is unreachable.

use crate::cache::LayerCache;
use crate::config::EngineConfig;
use crate::overlay::overlay;
use afecciones_core::{
    AffectionResult, ClassificationLayer, Error, FeatureSet, LayerDescriptor, ParcelGeometry,
    Result,
};
use std::sync::Arc;

/// Analyzer for the planning classification WFS layer.
pub struct UrbanisticClassifier {
    cache: Arc<LayerCache>,
    descriptor: LayerDescriptor,
    classification_field: String,
    scope_field: String,
    extent_margin_m: f64,
}

impl UrbanisticClassifier {
    pub fn new(cache: Arc<LayerCache>, config: &EngineConfig) -> Self {
        Self {
            cache,
            descriptor: LayerDescriptor::wfs(&config.wfs_base_url, &config.wfs_typename),
            classification_field: config.classification_field.clone(),
            scope_field: config.scope_field.clone(),
            extent_margin_m: config.wfs_extent_margin_m,
        }
    }

    /// Analyze a parcel against the planning layer.
    ///
    /// An unreachable planning service degrades to a `parcial` result built
    /// from previously cached data (empty if none) rather than failing the
    /// reference. Other errors propagate.
    pub async fn analyze(&self, parcel: &ParcelGeometry) -> Result<AffectionResult> {
        let query = parcel.extent().expanded(self.extent_margin_m);

        let features = match self.cache.fetch(&self.descriptor, &query, false).await {
            Ok(features) => features,
            Err(Error::LayerFetch { layer, reason }) => {
                tracing::warn!(
                    layer = %layer,
                    reason = %reason,
                    referencia = parcel.referencia(),
                    "Planning service unreachable, degrading to partial result"
                );
                // The expanded query just missed; the raw parcel extent may
                // still fit inside an older cached extent.
                return match self.cache.cached(&self.descriptor, &parcel.extent()) {
                    Some(cached) => Ok(self.overlay_degradable(parcel, &cached)?.into_partial()),
                    None => Ok(self.empty_partial(parcel)),
                };
            }
            Err(e) => return Err(e),
        };

        self.overlay_degradable(parcel, &features)
    }

    /// Overlay against the planning features; a layer without the configured
    /// classification field degrades this contribution to an empty partial
    /// result instead of failing the reference.
    fn overlay_degradable(
        &self,
        parcel: &ParcelGeometry,
        features: &FeatureSet,
    ) -> Result<AffectionResult> {
        match self.overlay_composed(parcel, features) {
            Err(Error::ClassificationFieldMissing { field, layer }) => {
                tracing::warn!(
                    layer = %layer,
                    field = %field,
                    referencia = parcel.referencia(),
                    "Planning layer lacks the classification field, degrading to partial result"
                );
                Ok(self.empty_partial(parcel))
            }
            other => other,
        }
    }

    fn empty_partial(&self, parcel: &ParcelGeometry) -> AffectionResult {
        AffectionResult::empty(
            parcel.referencia(),
            self.descriptor.name(),
            parcel.area_m2(),
        )
        .into_partial()
    }

    /// Overlay against the planning features with scope-refined labels: a
    /// non-empty scope attribute turns `<base>` into `"<base> - <scope>"`.
    fn overlay_composed(
        &self,
        parcel: &ParcelGeometry,
        features: &FeatureSet,
    ) -> Result<AffectionResult> {
        let mut composed = features.clone();
        for feature in &mut composed.features {
            if let Some(base) = feature.attribute(&self.classification_field) {
                if let Some(scope) = feature.attribute(&self.scope_field) {
                    feature.set_attribute(&self.classification_field, format!("{base} - {scope}"));
                }
            }
        }

        let layer = ClassificationLayer::new(self.descriptor.name(), composed);
        overlay(parcel, &layer, &self.classification_field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RetryPolicy;
    use crate::client::{FetchFailure, FetchLayer};
    use afecciones_core::{parcel_from_geojson, Extent};
    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn parcel_1000m2() -> ParcelGeometry {
        let content = r#"{"type":"FeatureCollection",
            "crs":{"type":"name","properties":{"name":"EPSG:25830"}},
            "features":[{"type":"Feature","properties":{},
              "geometry":{"type":"Polygon","coordinates":[[[0,0],[25,0],[25,40],[0,40],[0,0]]]}}]}"#;
        parcel_from_geojson(content, "parcela-test").unwrap()
    }

    fn planning_features(features_json: &str) -> FeatureSet {
        let content = format!(
            r#"{{"type":"FeatureCollection",
                 "crs":{{"type":"name","properties":{{"name":"EPSG:25830"}}}},
                 "features":[{features_json}]}}"#
        );
        FeatureSet::from_geojson_str(&content).unwrap()
    }

    /// Stub planning service: serves a fixed payload, optionally switchable
    /// to unreachable.
    struct PlanningStub {
        payload: FeatureSet,
        unreachable: AtomicBool,
    }

    #[async_trait]
    impl FetchLayer for PlanningStub {
        async fn fetch(
            &self,
            _descriptor: &LayerDescriptor,
            _extent: &Extent,
        ) -> std::result::Result<FeatureSet, FetchFailure> {
            if self.unreachable.load(Ordering::SeqCst) {
                Err(FetchFailure::transient("connection refused"))
            } else {
                Ok(self.payload.clone())
            }
        }
    }

    fn classifier_with(
        payload: FeatureSet,
        unreachable: bool,
    ) -> (UrbanisticClassifier, Arc<PlanningStub>) {
        let stub = Arc::new(PlanningStub {
            payload,
            unreachable: AtomicBool::new(unreachable),
        });
        let cache = Arc::new(LayerCache::new(
            stub.clone(),
            RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
            },
        ));
        let config = EngineConfig {
            wfs_base_url: "https://example.test/wfs".into(),
            wfs_typename: "plu:clases".into(),
            classification_field: "clasificacion".into(),
            scope_field: "ambito".into(),
            request_timeout_secs: 5,
            max_retries: 1,
            retry_base_ms: 1,
            wfs_extent_margin_m: 250.0,
            worker_count: 2,
            geometry_dir: "descargas".into(),
            output_dir: "resultados_lotes".into(),
        };
        (UrbanisticClassifier::new(cache, &config), stub)
    }

    #[tokio::test]
    async fn test_scope_refines_category_label() {
        // 25 m x 10 m strip = 250 m² of the 1000 m² parcel.
        let payload = planning_features(
            r#"{"type":"Feature",
                "properties":{"clasificacion":"Suelo Urbanizable","ambito":"Sector"},
                "geometry":{"type":"Polygon","coordinates":[[[0,0],[25,0],[25,10],[0,10],[0,0]]]}}"#,
        );
        let (classifier, _) = classifier_with(payload, false);

        let result = classifier.analyze(&parcel_1000m2()).await.unwrap();
        let affection = &result.detalle["Suelo Urbanizable - Sector"];
        assert_relative_eq!(affection.area_afectada_m2, 250.0, epsilon = 1e-6);
        assert_relative_eq!(result.total_afectado_percent, 25.0, epsilon = 1e-6);
        assert!(!result.parcial);
    }

    #[tokio::test]
    async fn test_empty_scope_keeps_base_label() {
        let payload = planning_features(
            r#"{"type":"Feature",
                "properties":{"clasificacion":"Suelo Urbano","ambito":""},
                "geometry":{"type":"Polygon","coordinates":[[[-100,-100],[200,-100],[200,200],[-100,200],[-100,-100]]]}}"#,
        );
        let (classifier, _) = classifier_with(payload, false);

        let result = classifier.analyze(&parcel_1000m2()).await.unwrap();
        assert_relative_eq!(result.detalle["Suelo Urbano"].porcentaje, 100.0, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn test_missing_classification_field_degrades_to_partial() {
        // The service is reachable but its features carry no usable
        // classification attribute; the contribution degrades instead of
        // failing the reference.
        let payload = planning_features(
            r#"{"type":"Feature",
                "properties":{"otra":"x"},
                "geometry":{"type":"Polygon","coordinates":[[[0,0],[25,0],[25,10],[0,10],[0,0]]]}}"#,
        );
        let (classifier, _) = classifier_with(payload, false);

        let result = classifier.analyze(&parcel_1000m2()).await.unwrap();
        assert!(result.parcial);
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_service_degrades_to_partial() {
        let (classifier, _) = classifier_with(FeatureSet::default(), true);

        let result = classifier.analyze(&parcel_1000m2()).await.unwrap();
        assert!(result.parcial);
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_parcel_is_served_from_cache_while_down() {
        let payload = planning_features(
            r#"{"type":"Feature",
                "properties":{"clasificacion":"Suelo Urbano"},
                "geometry":{"type":"Polygon","coordinates":[[[-500,-500],[600,-500],[600,600],[-500,600],[-500,-500]]]}}"#,
        );
        let (classifier, stub) = classifier_with(payload, false);
        let parcel = parcel_1000m2();

        let warm = classifier.analyze(&parcel).await.unwrap();
        assert!(!warm.parcial);
        stub.unreachable.store(true, Ordering::SeqCst);

        // Same parcel again: the cached extent contains the query, so the
        // network is never consulted and the result stays full.
        let again = classifier.analyze(&parcel).await.unwrap();
        assert!(!again.parcial);
        assert_relative_eq!(again.total_afectado_percent, 100.0, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn test_degraded_result_reuses_cached_layer_for_nearby_parcel() {
        let payload = planning_features(
            r#"{"type":"Feature",
                "properties":{"clasificacion":"Suelo Urbano"},
                "geometry":{"type":"Polygon","coordinates":[[[-500,-500],[600,-500],[600,600],[-500,600],[-500,-500]]]}}"#,
        );
        let (classifier, stub) = classifier_with(payload, false);

        // Warm the cache with the first parcel, then lose the service.
        classifier.analyze(&parcel_1000m2()).await.unwrap();
        stub.unreachable.store(true, Ordering::SeqCst);

        // A nearby parcel whose expanded query exceeds the cached extent:
        // the fetch misses, but its raw extent still fits inside the cached
        // one, so the degraded result carries real classification data.
        let nearby = r#"{"type":"FeatureCollection",
            "crs":{"type":"name","properties":{"name":"EPSG:25830"}},
            "features":[{"type":"Feature","properties":{},
              "geometry":{"type":"Polygon","coordinates":[[[200,0],[225,0],[225,40],[200,40],[200,0]]]}}]}"#;
        let parcel_b = parcel_from_geojson(nearby, "parcela-vecina").unwrap();

        let degraded = classifier.analyze(&parcel_b).await.unwrap();
        assert!(degraded.parcial);
        assert_relative_eq!(degraded.total_afectado_percent, 100.0, epsilon = 1e-6);
    }
}
