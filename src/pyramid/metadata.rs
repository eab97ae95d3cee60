//! Pyramid metadata documents: the v2 consolidated layout and the v3
//! hierarchical `zarr.json` layout, parsed into one typed description.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::pyramid::dtype::Dtype;
use crate::selector::CoordValue;

/// Store layout version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVersion {
    V2,
    V3,
}

/// Chunk codec applied on top of the raw dtype bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Raw,
    Zlib,
    Gzip,
}

/// Description of one stored array (the variable at one pyramid level, or a
/// coordinate axis).
#[derive(Debug, Clone)]
pub struct ArrayMeta {
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    pub dtype: Dtype,
    pub fill_value: f32,
    pub dimensions: Vec<String>,
    pub codec: Codec,
}

/// Pyramid-wide description assembled from the store metadata.
#[derive(Debug, Clone)]
pub struct PyramidMeta {
    pub levels: Vec<u32>,
    pub max_zoom: u32,
    pub tile_size: u32,
    pub crs: String,
    /// The selected variable's array at each level.
    pub arrays: BTreeMap<u32, ArrayMeta>,
    /// Dimension names of the variable, in storage order.
    pub dimensions: Vec<String>,
    /// Axis values for every non-spatial dimension.
    pub coordinates: BTreeMap<String, Vec<CoordValue>>,
    pub fill_value: f32,
}

/// Extract levels, tile size and CRS from a `multiscales` attribute value.
///
/// Each failure condition carries its own message so callers can tell a
/// truncated store from a mislabeled one.
pub fn parse_multiscales(multiscales: Option<&Value>) -> EngineResult<(Vec<u32>, u32, u32, String)> {
    let multiscales = multiscales
        .and_then(|m| m.as_array())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| EngineError::metadata("missing multiscales value in metadata"))?;

    let datasets = multiscales[0]
        .get("datasets")
        .and_then(|d| d.as_array())
        .filter(|d| !d.is_empty())
        .ok_or_else(|| EngineError::metadata("no datasets provided in multiscales metadata"))?;

    let mut levels = Vec::with_capacity(datasets.len());
    for d in datasets {
        let path = d
            .get("path")
            .and_then(|p| p.as_str().map(str::to_string).or_else(|| p.as_u64().map(|v| v.to_string())))
            .ok_or_else(|| EngineError::metadata("dataset entry missing path"))?;
        let level: u32 = path
            .parse()
            .map_err(|_| EngineError::metadata(format!("non-integer dataset path: {path}")))?;
        levels.push(level);
    }

    let max_zoom = *levels.iter().max().unwrap();

    let tile_size = datasets[0]
        .get("pixels_per_tile")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| EngineError::metadata("missing pixels_per_tile in multiscales metadata"))?
        as u32;

    let crs = match datasets[0].get("crs").and_then(|v| v.as_str()) {
        Some(crs) => crs.to_string(),
        None => {
            log::warn!("no crs in multiscales metadata, assuming EPSG:3857");
            "EPSG:3857".to_string()
        }
    };

    Ok((levels, max_zoom, tile_size, crs))
}

fn shape_list(value: Option<&Value>, what: &str) -> EngineResult<Vec<u64>> {
    value
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_u64()).collect::<Vec<_>>())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngineError::metadata(format!("missing or malformed {what}")))
}

fn fill_from(value: Option<&Value>, dtype: Dtype) -> f32 {
    match value {
        Some(Value::Number(n)) => n.as_f64().map(|v| v as f32).unwrap_or(dtype.default_fill()),
        // v3 allows "NaN"/"Infinity" string spellings
        Some(Value::String(s)) => match s.as_str() {
            "NaN" => f32::NAN,
            "Infinity" => f32::INFINITY,
            "-Infinity" => f32::NEG_INFINITY,
            _ => dtype.default_fill(),
        },
        _ => dtype.default_fill(),
    }
}

/// Parse a v2 `.zarray` document plus its sibling `.zattrs`.
pub fn parse_v2_array(zarray: &Value, zattrs: Option<&Value>) -> EngineResult<ArrayMeta> {
    let shape = shape_list(zarray.get("shape"), ".zarray shape")?;
    let chunks = shape_list(zarray.get("chunks"), ".zarray chunks")?;
    let dtype = Dtype::parse(
        zarray
            .get("dtype")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::metadata("missing dtype in .zarray"))?,
    )?;

    let codec = match zarray.get("compressor") {
        None | Some(Value::Null) => Codec::Raw,
        Some(c) => match c.get("id").and_then(|v| v.as_str()) {
            Some("zlib") => Codec::Zlib,
            Some("gzip") => Codec::Gzip,
            other => {
                return Err(EngineError::metadata(format!(
                    "unsupported compressor: {other:?}"
                )))
            }
        },
    };

    let dimensions = zattrs
        .and_then(|a| a.get("_ARRAY_DIMENSIONS"))
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(ArrayMeta {
        fill_value: fill_from(zarray.get("fill_value"), dtype),
        shape,
        chunks,
        dtype,
        dimensions,
        codec,
    })
}

/// Parse a v3 array `zarr.json`. Sharded arrays expose the inner codec
/// chunk shape as the effective chunk grid.
pub fn parse_v3_array(doc: &Value) -> EngineResult<ArrayMeta> {
    let shape = shape_list(doc.get("shape"), "zarr.json shape")?;

    let grid_shape = shape_list(
        doc.get("chunk_grid")
            .and_then(|g| g.get("configuration"))
            .and_then(|c| c.get("chunk_shape")),
        "chunk_grid chunk_shape",
    )?;

    let codecs = doc.get("codecs").and_then(|v| v.as_array());
    let first_codec = codecs.and_then(|c| c.first());
    let sharding = first_codec
        .filter(|c| c.get("name").and_then(|n| n.as_str()) == Some("sharding_indexed"));

    let chunks = match sharding {
        Some(codec) => shape_list(
            codec.get("configuration").and_then(|c| c.get("chunk_shape")),
            "sharding codec chunk_shape",
        )?,
        None => grid_shape,
    };

    let mut codec = Codec::Raw;
    if let Some(codecs) = codecs {
        for c in codecs {
            match c.get("name").and_then(|n| n.as_str()) {
                Some("gzip") => codec = Codec::Gzip,
                Some("zlib") => codec = Codec::Zlib,
                Some("bytes") | Some("sharding_indexed") | None => {}
                Some(other) => {
                    return Err(EngineError::metadata(format!("unsupported codec: {other}")))
                }
            }
        }
    }

    let dtype = Dtype::parse(
        doc.get("data_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::metadata("missing data_type in zarr.json"))?,
    )?;

    let dimensions = doc
        .get("attributes")
        .and_then(|a| a.get("_ARRAY_DIMENSIONS"))
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(ArrayMeta {
        fill_value: fill_from(doc.get("fill_value"), dtype),
        shape,
        chunks,
        dtype,
        dimensions,
        codec,
    })
}

impl PyramidMeta {
    pub fn array(&self, level: u32) -> EngineResult<&ArrayMeta> {
        self.arrays
            .get(&level)
            .ok_or_else(|| EngineError::metadata(format!("no array for level {level}")))
    }

    /// Non-spatial dimension names, in storage order.
    pub fn selector_dimensions(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .filter(|d| !crate::selector::is_spatial_dim(d))
            .cloned()
            .collect()
    }
}
