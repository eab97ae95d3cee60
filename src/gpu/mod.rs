//! GPU seams consumed by the core: texture planes for band data, a colormap
//! texture, and a draw pass submitting one call per rendered tile.
//!
//! The engine never talks to a graphics API directly; tests drive it with a
//! CPU implementation and production uses the wgpu backend.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::EngineResult;

pub mod wgpu_backend;

/// One GPU-resident 2-D plane of f32 texels (a band's data).
pub trait TexturePlane: Send + Sync + fmt::Debug {
    /// Replace the whole plane. `data` is row-major, `size * size` texels.
    fn write(&self, data: &[f32]);
    /// Texel count per side.
    fn size(&self) -> u32;
    /// Concrete-type access for backends.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// The 1-D colormap lookup texture, rewritten whole on update.
pub trait ColormapTexture: Send + Sync + fmt::Debug {
    fn write(&self, rgba: &[[u8; 4]]);
    /// Concrete-type access for backends.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Allocator for the textures the engine owns.
pub trait RenderContext: Send + Sync {
    fn create_band_plane(&self, label: &str, size: u32) -> Arc<dyn TexturePlane>;
    fn create_colormap(&self, rgba: &[[u8; 4]]) -> Arc<dyn ColormapTexture>;
}

/// Draw mode for the raster layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawMode {
    Texture,
    Grid,
    DotGrid,
}

impl DrawMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "texture" => Some(DrawMode::Texture),
            "grid" => Some(DrawMode::Grid),
            "dotgrid" => Some(DrawMode::DotGrid),
            _ => None,
        }
    }
}

/// Scalar uniforms shared by every draw call of a frame, in the shader
/// contract's terms.
#[derive(Debug, Clone)]
pub struct FrameUniforms {
    pub camera: [f64; 2],
    pub viewport_width: f64,
    pub viewport_height: f64,
    pub pixel_ratio: f64,
    pub zoom: f64,
    /// Tile size in texels.
    pub size: u32,
    /// The zoom level the camera resolved to.
    pub global_level: u32,
    pub order: [i8; 2],
    /// 0 = mercator, 1 = equirectangular.
    pub projection_code: u32,
    pub clim: [f32; 2],
    pub opacity: f32,
    pub fill_value: f32,
    pub center_y: f64,
    pub mode: DrawMode,
    /// Host-registered extra scalar uniforms.
    pub custom: BTreeMap<String, f32>,
}

/// One draw call: a rendered tile, its level, its render offset, and its
/// band planes in band order.
pub struct TileProps {
    pub key: crate::view::TileKey,
    pub level: u32,
    pub offset: [i64; 2],
    pub bands: Vec<(String, Arc<dyn TexturePlane>)>,
}

/// Submission of a frame: one draw call per prop.
pub trait DrawPass: Send + Sync {
    fn draw(
        &self,
        props: &[TileProps],
        colormap: &Arc<dyn ColormapTexture>,
        uniforms: &FrameUniforms,
    ) -> EngineResult<()>;
}

/// Build a 256-entry RGBA LUT from `(value, #RRGGBB)` stops over a domain.
pub fn colormap_from_stops(
    stops: &[(f32, String)],
    domain: (f32, f32),
) -> EngineResult<Vec<[u8; 4]>> {
    use crate::error::EngineError;

    if stops.len() < 2 {
        return Err(EngineError::metadata("colormap needs at least two stops"));
    }
    if domain.0 >= domain.1 {
        return Err(EngineError::metadata("colormap domain min must be < max"));
    }

    let mut sorted = stops.to_vec();
    sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let colors = sorted
        .iter()
        .map(|(_, hex)| parse_html_color(hex))
        .collect::<EngineResult<Vec<_>>>()?;

    let resolution = 256usize;
    let mut out = Vec::with_capacity(resolution);
    for i in 0..resolution {
        let t = i as f32 / (resolution - 1) as f32;
        let value = domain.0 + t * (domain.1 - domain.0);
        out.push(color_at(value, &sorted, &colors));
    }
    Ok(out)
}

fn parse_html_color(hex: &str) -> EngineResult<[u8; 4]> {
    use crate::error::EngineError;

    let trimmed = hex.trim().trim_start_matches('#');
    if trimmed.len() != 6 {
        return Err(EngineError::metadata(format!(
            "color must be #RRGGBB, got: #{trimmed}"
        )));
    }
    let parse = |range: std::ops::Range<usize>| {
        u8::from_str_radix(&trimmed[range], 16)
            .map_err(|e| EngineError::metadata(format!("invalid hex color: {e}")))
    };
    Ok([parse(0..2)?, parse(2..4)?, parse(4..6)?, 255])
}

fn color_at(value: f32, stops: &[(f32, String)], colors: &[[u8; 4]]) -> [u8; 4] {
    if value <= stops[0].0 {
        return colors[0];
    }
    if value >= stops[stops.len() - 1].0 {
        return colors[colors.len() - 1];
    }
    for i in 0..stops.len() - 1 {
        let (v0, v1) = (stops[i].0, stops[i + 1].0);
        if value >= v0 && value <= v1 {
            let t = if v1 > v0 { (value - v0) / (v1 - v0) } else { 0.0 };
            let (c0, c1) = (colors[i], colors[i + 1]);
            return [
                lerp_u8(c0[0], c1[0], t),
                lerp_u8(c0[1], c1[1], t),
                lerp_u8(c0[2], c1[2], t),
                lerp_u8(c0[3], c1[3], t),
            ];
        }
    }
    colors[colors.len() - 1]
}

fn lerp_u8(a: u8, b: u8, t: f32) -> u8 {
    (a as f32 + (b as f32 - a as f32) * t.clamp(0.0, 1.0))
        .round()
        .clamp(0.0, 255.0) as u8
}
