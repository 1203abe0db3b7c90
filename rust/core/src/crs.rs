// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coordinate reference system tags and normalization to the working
//! projection.
//!
//! All overlay arithmetic runs in EPSG:25830 (ETRS89 / UTM zone 30N), the
//! projection in which cadastral areas are reported in m². Inputs declared
//! in EPSG:4326 or EPSG:3857 are projected on load; anything else is
//! rejected as unsupported.

use crate::error::{Error, Result};
use geo::{Coord, MapCoords, MultiPolygon};

/// EPSG code of the working projection (ETRS89 / UTM zone 30N).
pub const WORKING_EPSG: u32 = 25830;

// GRS80 ellipsoid and UTM zone 30N projection constants.
const SEMI_MAJOR: f64 = 6_378_137.0;
const FLATTENING: f64 = 1.0 / 298.257_222_101;
const SCALE_FACTOR: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const CENTRAL_MERIDIAN_DEG: f64 = -3.0;

/// Coordinate reference system tag of a loaded dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    /// ETRS89 / UTM zone 30N - the working projection, metres.
    Etrs89Utm30,
    /// WGS84 geographic coordinates (lon/lat degrees).
    Wgs84,
    /// Spherical Web Mercator, metres.
    WebMercator,
}

impl Crs {
    /// Parse a CRS declaration as found in GeoJSON `crs` members or WFS
    /// `srsName` parameters.
    ///
    /// Accepts `EPSG:<code>`, `urn:ogc:def:crs:EPSG::<code>` and the OGC
    /// CRS84 identifier (equivalent to EPSG:4326 for our purposes). Returns
    /// `UnsupportedProjection` for any other declared system.
    pub fn parse(name: &str) -> Result<Crs> {
        let trimmed = name.trim();
        if trimmed.eq_ignore_ascii_case("urn:ogc:def:crs:OGC:1.3:CRS84")
            || trimmed.eq_ignore_ascii_case("CRS84")
        {
            return Ok(Crs::Wgs84);
        }

        let code = trimmed
            .rsplit(':')
            .next()
            .and_then(|c| c.parse::<u32>().ok())
            .ok_or_else(|| Error::UnsupportedProjection(format!("cannot parse CRS '{trimmed}'")))?;

        Crs::from_epsg(code)
    }

    /// Resolve an EPSG code to a supported CRS tag.
    pub fn from_epsg(code: u32) -> Result<Crs> {
        match code {
            25830 => Ok(Crs::Etrs89Utm30),
            4326 => Ok(Crs::Wgs84),
            3857 => Ok(Crs::WebMercator),
            other => Err(Error::UnsupportedProjection(format!("EPSG:{other}"))),
        }
    }

    /// EPSG code of this CRS.
    pub fn epsg(&self) -> u32 {
        match self {
            Crs::Etrs89Utm30 => 25830,
            Crs::Wgs84 => 4326,
            Crs::WebMercator => 3857,
        }
    }
}

/// Project a geometry declared in `source` into the working projection.
pub fn to_working(geometry: &MultiPolygon<f64>, source: Crs) -> MultiPolygon<f64> {
    match source {
        Crs::Etrs89Utm30 => geometry.clone(),
        Crs::Wgs84 => geometry.map_coords(|c| utm30_forward(c.x, c.y)),
        Crs::WebMercator => geometry.map_coords(|c| {
            let (lon, lat) = mercator_inverse(c.x, c.y);
            utm30_forward(lon, lat)
        }),
    }
}

/// Forward transverse Mercator projection onto UTM zone 30N (Snyder series).
pub fn utm30_forward(lon_deg: f64, lat_deg: f64) -> Coord<f64> {
    let e2 = 2.0 * FLATTENING - FLATTENING * FLATTENING;
    let ep2 = e2 / (1.0 - e2);
    let phi = lat_deg.to_radians();
    let lam = lon_deg.to_radians();
    let lam0 = CENTRAL_MERIDIAN_DEG.to_radians();

    let sin_phi = phi.sin();
    let cos_phi = phi.cos();
    let tan_phi = phi.tan();

    let n = SEMI_MAJOR / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = tan_phi * tan_phi;
    let c = ep2 * cos_phi * cos_phi;
    let a = (lam - lam0) * cos_phi;

    let m = SEMI_MAJOR
        * ((1.0 - e2 / 4.0 - 3.0 * e2 * e2 / 64.0 - 5.0 * e2 * e2 * e2 / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e2 * e2 / 32.0 + 45.0 * e2 * e2 * e2 / 1024.0)
                * (2.0 * phi).sin()
            + (15.0 * e2 * e2 / 256.0 + 45.0 * e2 * e2 * e2 / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e2 * e2 * e2 / 3072.0) * (6.0 * phi).sin());

    let x = FALSE_EASTING
        + SCALE_FACTOR
            * n
            * (a + (1.0 - t + c) * a.powi(3) / 6.0
                + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0);
    let y = SCALE_FACTOR
        * (m + n
            * tan_phi
            * (a * a / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6) / 720.0));

    Coord { x, y }
}

/// Inverse spherical Mercator: EPSG:3857 metres to lon/lat degrees.
fn mercator_inverse(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / SEMI_MAJOR).to_degrees();
    let lat = (y / SEMI_MAJOR).sinh().atan().to_degrees();
    (lon, lat)
}
