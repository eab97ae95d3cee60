//! Geodesic circle regions and the tile enumeration behind region queries.

use std::collections::BTreeSet;

use glam::DVec2;

use crate::error::{EngineError, EngineResult};
use crate::view::projection::{Order, Projection};
use crate::view::TileKey;

/// Mean Earth radius in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0088;
pub const KM_PER_MILE: f64 = 1.609344;

/// Vertices used to approximate the circle's polygon.
pub const CIRCLE_VERTICES: usize = 64;

/// Radius units accepted for regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadiusUnits {
    Kilometers,
    Miles,
}

impl RadiusUnits {
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "kilometers" => Ok(RadiusUnits::Kilometers),
            "miles" => Ok(RadiusUnits::Miles),
            other => Err(EngineError::UnitsInvalid(other.to_string())),
        }
    }

    pub fn to_km(self, radius: f64) -> f64 {
        match self {
            RadiusUnits::Kilometers => radius,
            RadiusUnits::Miles => radius * KM_PER_MILE,
        }
    }
}

/// A geodesic circle: center, radius, and the spherical polygon that
/// approximates its outline.
#[derive(Debug, Clone)]
pub struct Region {
    pub center: DVec2,
    pub radius: f64,
    pub units: RadiusUnits,
    pub polygon: Vec<DVec2>,
}

impl Region {
    /// Build a circle at `(lng, lat)` with the given radius.
    pub fn circle(lng: f64, lat: f64, radius: f64, units: RadiusUnits) -> Self {
        let radius_km = units.to_km(radius);
        let polygon = (0..CIRCLE_VERTICES)
            .map(|i| {
                let bearing = 360.0 * i as f64 / CIRCLE_VERTICES as f64;
                destination_point(lng, lat, radius_km, bearing)
            })
            .collect();
        Self {
            center: DVec2::new(lng, lat),
            radius,
            units,
            polygon,
        }
    }

    pub fn radius_km(&self) -> f64 {
        self.units.to_km(self.radius)
    }

    /// Whether a geographic point falls inside the circle.
    pub fn contains(&self, lng: f64, lat: f64) -> bool {
        haversine_km(self.center.x, self.center.y, lng, lat) <= self.radius_km()
    }
}

/// Great-circle distance between two geographic points, in kilometers.
pub fn haversine_km(lng1: f64, lat1: f64, lng2: f64, lat2: f64) -> f64 {
    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = lat2 - lat1;
    let dlng = (lng2 - lng1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Point reached from `(lng, lat)` by traveling `distance_km` along the
/// initial `bearing` (degrees clockwise from north) on the sphere.
pub fn destination_point(lng: f64, lat: f64, distance_km: f64, bearing: f64) -> DVec2 {
    let angular = distance_km / EARTH_RADIUS_KM;
    let bearing = bearing.to_radians();
    let lat1 = lat.to_radians();
    let lng1 = lng.to_radians();

    let lat2 =
        (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * bearing.cos()).asin();
    let lng2 = lng1
        + (bearing.sin() * angular.sin() * lat1.cos())
            .atan2(angular.cos() - lat1.sin() * lat2.sin());

    let mut lng_deg = lng2.to_degrees();
    if lng_deg > 180.0 {
        lng_deg -= 360.0;
    } else if lng_deg < -180.0 {
        lng_deg += 360.0;
    }
    DVec2::new(lng_deg, lat2.to_degrees())
}

/// Tiles a region's circle intersects at one level: the center's tile,
/// every polygon vertex's tile, and the tiles along the line from the
/// center to each vertex, stepped once per tile unit.
pub fn tiles_of_region(
    region: &Region,
    level: u32,
    projection: Projection,
    _order: Order,
) -> BTreeSet<TileKey> {
    let mut tiles = BTreeSet::new();
    let center = projection.point_to_tile(region.center.x, region.center.y, level);
    tiles.insert(center);

    for vertex in &region.polygon {
        let tile = projection.point_to_tile(vertex.x, vertex.y, level);
        tiles.insert(tile);

        // Walk intermediate tiles along the rhumb segment so thin slivers
        // between the center and a far vertex are not skipped.
        let dx = tile.x as i64 - center.x as i64;
        let dy = tile.y as i64 - center.y as i64;
        let steps = dx.abs().max(dy.abs());
        for step in 1..steps {
            let t = step as f64 / steps as f64;
            let lng = region.center.x + (vertex.x - region.center.x) * t;
            let lat = region.center.y + (vertex.y - region.center.y) * t;
            tiles.insert(projection.point_to_tile(lng, lat, level));
        }
    }
    tiles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_parse_and_convert() {
        assert_eq!(RadiusUnits::parse("kilometers").unwrap(), RadiusUnits::Kilometers);
        assert_eq!(RadiusUnits::parse("miles").unwrap(), RadiusUnits::Miles);
        assert!(matches!(
            RadiusUnits::parse("furlongs"),
            Err(EngineError::UnitsInvalid(_))
        ));
        assert!((RadiusUnits::Miles.to_km(10.0) - 16.09344).abs() < 1e-9);
    }

    #[test]
    fn haversine_equator_degree() {
        // One degree of longitude at the equator is about 111.2 km.
        let d = haversine_km(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111.195).abs() < 0.1, "got {d}");
    }

    #[test]
    fn destination_round_trips_distance() {
        for bearing in [0.0, 45.0, 90.0, 180.0, 270.0] {
            let p = destination_point(10.0, 50.0, 25.0, bearing);
            let d = haversine_km(10.0, 50.0, p.x, p.y);
            assert!((d - 25.0).abs() < 1e-6, "bearing {bearing}: {d}");
        }
    }

    #[test]
    fn circle_polygon_has_expected_vertices() {
        let region = Region::circle(0.0, 0.0, 1.0, RadiusUnits::Kilometers);
        assert_eq!(region.polygon.len(), CIRCLE_VERTICES);
        for v in &region.polygon {
            let d = haversine_km(0.0, 0.0, v.x, v.y);
            assert!((d - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn small_circle_stays_in_one_tile() {
        let region = Region::circle(0.5, 0.5, 1.0, RadiusUnits::Kilometers);
        let tiles = tiles_of_region(&region, 2, Projection::Mercator, Order::default());
        assert_eq!(tiles.len(), 1);
        assert!(tiles.contains(&Projection::Mercator.point_to_tile(0.5, 0.5, 2)));
    }

    #[test]
    fn large_circle_spans_neighbors() {
        let region = Region::circle(0.0, 0.0, 2000.0, RadiusUnits::Kilometers);
        let tiles = tiles_of_region(&region, 4, Projection::Mercator, Order::default());
        assert!(tiles.len() > 4, "got {}", tiles.len());
        // All four quadrants around the origin are touched.
        assert!(tiles.iter().any(|t| t.x == 7 && t.y == 7));
        assert!(tiles.iter().any(|t| t.x == 8 && t.y == 8));
    }

    #[test]
    fn circle_contains_its_interior() {
        let region = Region::circle(0.0, 0.0, 100.0, RadiusUnits::Kilometers);
        assert!(region.contains(0.0, 0.0));
        assert!(region.contains(0.5, 0.0));
        assert!(!region.contains(2.0, 0.0));
    }
}
