//! Map projections and the geographic <-> tile-space conversions the
//! resolver and region query build on.

use glam::DVec2;

use crate::error::{EngineError, EngineResult};
use crate::view::TileKey;

/// EPSG code for the web mercator CRS.
pub const WEB_MERCATOR_EPSG: u32 = 3857;
/// EPSG code for the equirectangular (plate carree) CRS.
pub const EQUIRECTANGULAR_EPSG: u32 = 4326;

/// Latitude bound of the mercator square.
pub const MERCATOR_LAT_LIMIT: f64 = 85.051129;

/// The two supported data projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Mercator,
    Equirectangular,
}

impl Projection {
    pub fn from_name(name: &str) -> EngineResult<Self> {
        match name {
            "mercator" => Ok(Projection::Mercator),
            "equirectangular" => Ok(Projection::Equirectangular),
            other => Err(EngineError::projection(format!("unknown projection: {other}"))),
        }
    }

    pub fn from_crs(crs: &str) -> EngineResult<Self> {
        match parse_epsg_code(crs) {
            Some(WEB_MERCATOR_EPSG) => Ok(Projection::Mercator),
            Some(EQUIRECTANGULAR_EPSG) => Ok(Projection::Equirectangular),
            _ => Err(EngineError::projection(format!("unknown crs: {crs}"))),
        }
    }

    /// Shader-side discriminant.
    pub fn code(self) -> u32 {
        match self {
            Projection::Mercator => 0,
            Projection::Equirectangular => 1,
        }
    }

    /// Fractional tile-space position of a geographic point at level `z`.
    /// X is wrapped into `[0, 2^z)`; Y is unclamped.
    pub fn point_to_camera(self, lng: f64, lat: f64, z: u32) -> DVec2 {
        let z2 = (1u64 << z) as f64;
        let mut x = z2 * (lng / 360.0 + 0.5);
        x = x.rem_euclid(z2);
        let y = match self {
            Projection::Mercator => z2 * mercator_y_from_lat(lat),
            Projection::Equirectangular => z2 * (0.5 - lat / 180.0),
        };
        DVec2::new(x, y)
    }

    /// The tile containing a geographic point at level `z`; Y clamped into
    /// range so polar cameras land on the edge row.
    pub fn point_to_tile(self, lng: f64, lat: f64, z: u32) -> TileKey {
        let camera = self.point_to_camera(lng, lat, z);
        let max = (1u32 << z) - 1;
        let x = (camera.x.floor() as i64).clamp(0, max as i64) as u32;
        let y = (camera.y.floor() as i64).clamp(0, max as i64) as u32;
        TileKey::new(x, y, z)
    }

    /// Geographic position of a pixel center inside a tile.
    pub fn pixel_to_lng_lat(self, tile: TileKey, i: u32, j: u32, tile_size: u32, order: Order) -> (f64, f64) {
        let z2 = (1u64 << tile.z) as f64;
        let (fi, fj) = order.orient_pixel(i, j, tile_size);
        let xf = (tile.x as f64 + (fi as f64 + 0.5) / tile_size as f64) / z2;
        let yf = (tile.y as f64 + (fj as f64 + 0.5) / tile_size as f64) / z2;
        let lng = (xf - 0.5) * 360.0;
        let lat = match self {
            Projection::Mercator => lat_from_mercator_y(yf),
            Projection::Equirectangular => (0.5 - yf) * 180.0,
        };
        (lng, lat)
    }
}

/// Mercator Y as a fraction of the world square: 0 at the north clip
/// latitude, 1 at the south.
pub fn mercator_y_from_lat(lat: f64) -> f64 {
    let lat = lat.clamp(-MERCATOR_LAT_LIMIT, MERCATOR_LAT_LIMIT);
    (180.0 - (180.0 / std::f64::consts::PI)
        * ((std::f64::consts::FRAC_PI_4) + lat * std::f64::consts::PI / 360.0).tan().ln())
        / 360.0
}

/// Inverse of `mercator_y_from_lat`.
pub fn lat_from_mercator_y(y: f64) -> f64 {
    let deg = 180.0 - y * 360.0;
    (360.0 / std::f64::consts::PI)
        * ((deg * std::f64::consts::PI / 180.0).exp().atan())
        - 90.0
}

/// Get the EPSG code from a CRS string if it's in EPSG format.
pub fn parse_epsg_code(crs: &str) -> Option<u32> {
    let upper = crs.to_uppercase();
    upper.strip_prefix("EPSG:")?.parse().ok()
}

/// Axis orientation of stored tiles relative to the lng/lat convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Order {
    pub x: i8,
    pub y: i8,
}

impl Order {
    pub fn new(x: i8, y: i8) -> Self {
        Self { x, y }
    }

    /// Flip pixel indices on reversed axes.
    fn orient_pixel(self, i: u32, j: u32, size: u32) -> (u32, u32) {
        let fi = if self.x == 1 { i } else { size - 1 - i };
        let fj = if self.y == 1 { j } else { size - 1 - j };
        (fi, fj)
    }
}

impl Default for Order {
    fn default() -> Self {
        Self { x: 1, y: 1 }
    }
}
