// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Afecciones Core
//!
//! Data model for cadastral affection analysis: parcel geometry loading,
//! classification layers, spatial extents and result records. All geometry
//! is normalized into EPSG:25830 so areas come out in m².

pub mod crs;
pub mod error;
pub mod extent;
pub mod layer;
pub mod parcel;
pub mod result;

pub use crs::{Crs, WORKING_EPSG};
pub use error::{Error, Result};
pub use extent::Extent;
pub use layer::{
    ClassificationLayer, Feature, FeatureSet, LayerDescriptor, CLASSIFICATION_FIELD_CANDIDATES,
    GENERIC_CATEGORY,
};
pub use parcel::{load_parcel, parcel_from_geojson, ParcelGeometry};
pub use result::{AffectionResult, CategoryAffection};
