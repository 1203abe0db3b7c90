// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Result type for affection analysis operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading geometry or analyzing layers
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid parcel geometry: {0}")]
    InvalidGeometry(String),

    #[error("Unsupported projection: {0}")]
    UnsupportedProjection(String),

    #[error("Layer fetch failed for '{layer}': {reason}")]
    LayerFetch { layer: String, reason: String },

    #[error("Classification field '{field}' missing from layer '{layer}'")]
    ClassificationFieldMissing { field: String, layer: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Stable category string used in batch failure summaries.
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidGeometry(_) => "geometria_invalida",
            Error::UnsupportedProjection(_) => "proyeccion_no_soportada",
            Error::LayerFetch { .. } => "descarga_capa",
            Error::ClassificationFieldMissing { .. } => "campo_clasificacion_ausente",
            Error::Io(_) => "io",
            Error::Decode(_) => "decodificacion",
        }
    }
}
