//! Viewport-to-tile resolution: which tiles must be drawn for the current
//! camera, and at which world-wrap positions.

use std::collections::BTreeMap;

use glam::DVec2;

use crate::view::projection::{mercator_y_from_lat, Order, Projection, MERCATOR_LAT_LIMIT};
use crate::view::TileKey;

/// Base display size of one tile in CSS pixels.
pub const TILE_DISPLAY_SIZE: f64 = 512.0;

/// Viewport size in physical pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

/// A position a canonical tile is rendered at: the un-wrapped tile
/// coordinates plus the level they are expressed at. X may leave
/// `[0, 2^z)` for world-wrap copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOffset {
    pub x: i64,
    pub y: i64,
    pub level: u32,
}

/// The set of tiles to draw: canonical key -> render positions.
pub type ActiveTiles = BTreeMap<TileKey, Vec<RenderOffset>>;

/// Inputs of one resolution pass.
#[derive(Debug, Clone, Copy)]
pub struct ResolveParams {
    /// The tile containing the camera.
    pub tile: TileKey,
    /// Fractional tile-space camera position at the tile's level.
    pub camera: DVec2,
    pub viewport: Viewport,
    pub zoom: f64,
    pub order: Order,
    pub projection: Projection,
    pub pixel_ratio: f64,
}

/// Resolve the active tile set for a camera.
pub fn resolve_active(params: &ResolveParams) -> ActiveTiles {
    let ResolveParams {
        tile,
        camera,
        viewport,
        zoom,
        order,
        projection,
        pixel_ratio,
    } = *params;

    let scale = pixel_ratio * TILE_DISPLAY_SIZE * 2f64.powf(zoom - tile.z as f64);
    let n = 1i64 << tile.z;

    let (min_dx, max_dx) = axis_offsets(
        viewport.width,
        scale,
        camera.x - camera.x.floor(),
        order.x,
    );
    let (min_dy, max_dy) = match projection {
        Projection::Mercator => axis_offsets(
            viewport.height,
            scale,
            camera.y - camera.y.floor(),
            order.y,
        ),
        Projection::Equirectangular => lat_based_offsets(
            viewport.height,
            scale,
            tile,
            camera.y,
            order.y,
        ),
    };

    let mut active = ActiveTiles::new();
    for dy in min_dy..=max_dy {
        let ty = tile.y as i64 + dy;
        // No vertical wrap.
        if ty < 0 || ty >= n {
            continue;
        }
        for dx in min_dx..=max_dx {
            let tx = tile.x as i64 + dx;
            let wrapped = tx.rem_euclid(n);
            let key = TileKey::new(wrapped as u32, ty as u32, tile.z);
            active.entry(key).or_default().push(RenderOffset {
                x: tx,
                y: ty,
                level: tile.z,
            });
        }
    }
    active
}

/// Walk outward from the camera's tile along one axis until the viewport is
/// covered, returning the inclusive delta range. Near-zero sibling demand
/// collapses to `[0, 0]`.
pub fn axis_offsets(length: f64, tile_size: f64, camera_offset: f64, order: i8) -> (i64, i64) {
    let sibling_count = (length / tile_size - 1.0) / 2.0;
    if sibling_count < 0.001 {
        return (0, 0);
    }

    // The camera maps to the viewport center; its tile's origin sits
    // camera_offset tile-widths back along the axis direction.
    let anchor = if order == 1 { camera_offset } else { 1.0 - camera_offset };
    let edge = |delta: f64| length / 2.0 + (delta - anchor) * tile_size;

    let mut min = 0i64;
    while edge(min as f64) > 0.0 {
        min -= 1;
    }
    let mut max = 0i64;
    while edge(max as f64 + 1.0) < length {
        max += 1;
    }
    (min, max)
}

/// Vertical offsets for equirectangular data on a mercator screen: each
/// data row covers an equal latitude band, so its rendered height varies
/// with latitude. Rows are walked outward until the viewport is covered,
/// using each row's mercator-space pixel height as its effective size.
pub fn lat_based_offsets(
    viewport_height: f64,
    scale: f64,
    tile: TileKey,
    camera_y: f64,
    order: i8,
) -> (i64, i64) {
    let n = 1i64 << tile.z;
    let world_px = scale * n as f64;
    let camera_merc = mercator_fraction_of_row_position(camera_y, tile.z, order);

    let screen_top = |row: i64| -> f64 {
        let (lat_top, _) = row_lat_bounds(row, tile.z, order);
        viewport_height / 2.0 + (mercator_y_from_lat(lat_top) - camera_merc) * world_px
    };
    let screen_bottom = |row: i64| -> f64 {
        let (_, lat_bottom) = row_lat_bounds(row, tile.z, order);
        viewport_height / 2.0 + (mercator_y_from_lat(lat_bottom) - camera_merc) * world_px
    };

    let base = tile.y as i64;
    let mut min = 0i64;
    while base + min > 0 && screen_top(base + min) > 0.0 {
        min -= 1;
    }
    let mut max = 0i64;
    while base + max < n - 1 && screen_bottom(base + max) < viewport_height {
        max += 1;
    }
    (min, max)
}

/// Latitude band covered by a data row, top first. A reversed Y order
/// stores the south pole in row zero.
fn row_lat_bounds(row: i64, z: u32, order: i8) -> (f64, f64) {
    let n = (1i64 << z) as f64;
    let row = if order == 1 { row as f64 } else { n - 1.0 - row as f64 };
    let lat_top = (90.0 - 180.0 * row / n).clamp(-MERCATOR_LAT_LIMIT, MERCATOR_LAT_LIMIT);
    let lat_bottom = (90.0 - 180.0 * (row + 1.0) / n).clamp(-MERCATOR_LAT_LIMIT, MERCATOR_LAT_LIMIT);
    (lat_top, lat_bottom)
}

/// Mercator world fraction of a fractional equirectangular row position.
fn mercator_fraction_of_row_position(camera_y: f64, z: u32, order: i8) -> f64 {
    let n = (1i64 << z) as f64;
    let row = if order == 1 { camera_y } else { n - camera_y };
    let lat = 90.0 - 180.0 * row / n;
    mercator_y_from_lat(lat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(tile: TileKey, camera: DVec2, viewport: Viewport, zoom: f64) -> ResolveParams {
        ResolveParams {
            tile,
            camera,
            viewport,
            zoom,
            order: Order::default(),
            projection: Projection::Mercator,
            pixel_ratio: 1.0,
        }
    }

    #[test]
    fn single_root_tile_at_zoom_zero() {
        let active = resolve_active(&params(
            TileKey::new(0, 0, 0),
            DVec2::new(0.5, 0.5),
            Viewport { width: 512.0, height: 512.0 },
            0.0,
        ));
        assert_eq!(active.len(), 1);
        assert_eq!(
            active[&TileKey::new(0, 0, 0)],
            vec![RenderOffset { x: 0, y: 0, level: 0 }]
        );
    }

    #[test]
    fn all_canonical_keys_in_range() {
        // A wide viewport at the antimeridian forces horizontal wrap.
        let camera = Projection::Mercator.point_to_camera(179.5, 0.0, 2);
        let tile = Projection::Mercator.point_to_tile(179.5, 0.0, 2);
        let active = resolve_active(&params(
            tile,
            camera,
            Viewport { width: 1024.0, height: 512.0 },
            2.0,
        ));
        for (key, offsets) in &active {
            assert!(key.x < 4 && key.y < 4, "canonical key out of range: {key}");
            for o in offsets {
                assert!(o.y >= 0 && o.y < 4, "vertical wrap is not allowed");
            }
        }
        let xs: Vec<u32> = active.keys().map(|k| k.x).collect();
        assert!(xs.contains(&3) && xs.contains(&0), "wrap should span the seam: {xs:?}");
    }

    #[test]
    fn wrap_offsets_reconstruct_continuity() {
        let camera = Projection::Mercator.point_to_camera(179.5, 0.0, 2);
        let tile = Projection::Mercator.point_to_tile(179.5, 0.0, 2);
        let active = resolve_active(&params(
            tile,
            camera,
            Viewport { width: 1024.0, height: 512.0 },
            2.0,
        ));
        // The copy of tile x=0 drawn east of the seam has unwrapped x=4.
        let offsets = &active[&TileKey::new(0, 1, 2)];
        assert!(offsets.iter().any(|o| o.x == 4));
    }

    #[test]
    fn narrow_viewport_collapses_to_center_tile() {
        let (min, max) = axis_offsets(500.0, 512.0, 0.3, 1);
        assert_eq!((min, max), (0, 0));
    }

    #[test]
    fn offsets_cover_viewport() {
        // 3 tiles of 512px are needed for a 1200px viewport.
        let (min, max) = axis_offsets(1200.0, 512.0, 0.5, 1);
        assert!(min <= -1 && max >= 1);
        // Off-center camera shifts the walk asymmetrically.
        let (min2, max2) = axis_offsets(1200.0, 512.0, 0.05, 1);
        assert!(max2 >= max);
        // An off-center camera may need one extra tile, never fewer.
        let spread = (max2 - min2) - (max - min);
        assert!((0..=1).contains(&spread));
    }

    #[test]
    fn reversed_order_mirrors_walk() {
        let (min_a, max_a) = axis_offsets(1200.0, 512.0, 0.1, 1);
        let (min_b, max_b) = axis_offsets(1200.0, 512.0, 0.9, -1);
        assert_eq!((min_a, max_a), (min_b, max_b));
    }

    #[test]
    fn equirectangular_rows_clip_at_poles() {
        let camera = Projection::Equirectangular.point_to_camera(0.0, 80.0, 2);
        let tile = Projection::Equirectangular.point_to_tile(0.0, 80.0, 2);
        let mut p = params(tile, camera, Viewport { width: 512.0, height: 2048.0 }, 2.0);
        p.projection = Projection::Equirectangular;
        let active = resolve_active(&p);
        for key in active.keys() {
            assert!(key.y < 4);
        }
        assert!(!active.is_empty());
    }

    #[test]
    fn equirectangular_covers_equator_viewport() {
        let camera = Projection::Equirectangular.point_to_camera(0.0, 0.0, 1);
        let tile = Projection::Equirectangular.point_to_tile(0.0, 0.0, 1);
        let mut p = params(tile, camera, Viewport { width: 512.0, height: 1024.0 }, 1.0);
        p.projection = Projection::Equirectangular;
        let active = resolve_active(&p);
        let ys: Vec<u32> = active.keys().map(|k| k.y).collect();
        assert!(ys.contains(&0) && ys.contains(&1));
    }
}
