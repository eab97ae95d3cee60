//! Selector algebra: expanding list-valued selectors into bands and mapping
//! bands onto the chunks they require.
//!
//! A selector fixes each non-spatial dimension to either one coordinate
//! value or an ordered list of values. List entries multiply out into one
//! band per combination; scalar entries are merged into every band.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use crate::error::{EngineError, EngineResult};
use crate::pyramid::dtype::format_number;

/// One coordinate value along a non-spatial dimension.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordValue {
    Num(f64),
    Str(String),
}

impl CoordValue {
    /// Band-name token for this value: bare string, or `dim_value` for
    /// numbers (assembled by the caller).
    pub fn token(&self, dim: &str) -> String {
        match self {
            CoordValue::Str(s) => s.clone(),
            CoordValue::Num(n) => format!("{}_{}", dim, format_number(*n)),
        }
    }

    /// Label used for point-value keys and region-query grouping.
    pub fn label(&self) -> String {
        match self {
            CoordValue::Str(s) => s.clone(),
            CoordValue::Num(n) => format_number(*n),
        }
    }

    fn hash_into(&self, h: &mut DefaultHasher) {
        match self {
            CoordValue::Num(n) => n.to_bits().hash(h),
            CoordValue::Str(s) => s.hash(h),
        }
    }
}

impl From<f64> for CoordValue {
    fn from(v: f64) -> Self {
        CoordValue::Num(v)
    }
}

impl From<i64> for CoordValue {
    fn from(v: i64) -> Self {
        CoordValue::Num(v as f64)
    }
}

impl From<&str> for CoordValue {
    fn from(v: &str) -> Self {
        CoordValue::Str(v.to_string())
    }
}

/// Selector entry: one fixed value or an ordered list of them.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectorValue {
    Scalar(CoordValue),
    List(Vec<CoordValue>),
}

impl SelectorValue {
    pub fn scalar<T: Into<CoordValue>>(v: T) -> Self {
        SelectorValue::Scalar(v.into())
    }

    pub fn list<T: Into<CoordValue>, I: IntoIterator<Item = T>>(vs: I) -> Self {
        SelectorValue::List(vs.into_iter().map(Into::into).collect())
    }
}

/// Mapping from non-spatial dimension name to its selector entry. A
/// `BTreeMap` keeps band naming and hashing stable across runs.
pub type Selector = BTreeMap<String, SelectorValue>;

/// Per-band dimension fixings produced by expanding a selector.
pub type BandFixing = BTreeMap<String, CoordValue>;

/// Spatial dimension names recognized along each axis.
pub const X_DIMS: [&str; 2] = ["x", "lon"];
pub const Y_DIMS: [&str; 2] = ["y", "lat"];

pub fn is_x_dim(name: &str) -> bool {
    X_DIMS.contains(&name)
}

pub fn is_y_dim(name: &str) -> bool {
    Y_DIMS.contains(&name)
}

pub fn is_spatial_dim(name: &str) -> bool {
    is_x_dim(name) || is_y_dim(name)
}

/// Expand list-valued selector entries into `band name -> fixings` via
/// Cartesian product. Scalar entries are merged into every band. The result
/// is empty iff no entry is list-valued.
pub fn band_information(selector: &Selector) -> BTreeMap<String, BandFixing> {
    let mut bands: Vec<(String, BandFixing)> = Vec::new();

    for (dim, value) in selector {
        let values = match value {
            SelectorValue::List(vs) => vs,
            SelectorValue::Scalar(_) => continue,
        };
        let tokens: Vec<(String, CoordValue)> = values
            .iter()
            .map(|v| (v.token(dim), v.clone()))
            .collect();

        if bands.is_empty() {
            bands = tokens
                .into_iter()
                .map(|(name, v)| {
                    let mut fixing = BandFixing::new();
                    fixing.insert(dim.clone(), v);
                    (name, fixing)
                })
                .collect();
        } else {
            let mut next = Vec::with_capacity(bands.len() * tokens.len());
            for (name, fixing) in &bands {
                for (token, v) in &tokens {
                    let mut fixing = fixing.clone();
                    fixing.insert(dim.clone(), v.clone());
                    next.push((format!("{name}_{token}"), fixing));
                }
            }
            bands = next;
        }
    }

    if bands.is_empty() {
        return BTreeMap::new();
    }

    // Scalar entries apply to every band.
    for (dim, value) in selector {
        if let SelectorValue::Scalar(v) = value {
            for (_, fixing) in bands.iter_mut() {
                fixing.insert(dim.clone(), v.clone());
            }
        }
    }

    bands.into_iter().collect()
}

/// Band names for a variable under a selector; a selector with no list
/// entries yields the single band named by the variable.
pub fn bands_for(variable: &str, selector: &Selector) -> Vec<String> {
    let info = band_information(selector);
    if info.is_empty() {
        vec![variable.to_string()]
    } else {
        info.into_keys().collect()
    }
}

/// Scalar fixings for a band: its expanded fixings, or the selector's
/// scalar entries when no expansion happened.
pub fn fixing_for_band(band: &str, selector: &Selector) -> BandFixing {
    let info = band_information(selector);
    if let Some(fixing) = info.get(band) {
        return fixing.clone();
    }
    selector
        .iter()
        .filter_map(|(dim, v)| match v {
            SelectorValue::Scalar(c) => Some((dim.clone(), c.clone())),
            SelectorValue::List(_) => None,
        })
        .collect()
}

/// Chunk indices needed along every dimension for one tile under a set of
/// scalar fixings, returned as the Cartesian product of per-dimension sets.
///
/// Spatial dimensions take the tile coordinate directly; fixed dimensions
/// take the chunk containing the coordinate; unconstrained dimensions take
/// every chunk covering the axis.
pub fn chunks_for(
    fixings: &BandFixing,
    dimensions: &[String],
    coordinates: &BTreeMap<String, Vec<CoordValue>>,
    shape: &[u64],
    chunks: &[u64],
    tile_x: u64,
    tile_y: u64,
) -> EngineResult<Vec<Vec<u64>>> {
    let mut per_dim: Vec<Vec<u64>> = Vec::with_capacity(dimensions.len());

    for (i, dim) in dimensions.iter().enumerate() {
        let chunk_size = chunks[i].max(1);
        if is_x_dim(dim) {
            per_dim.push(vec![tile_x]);
        } else if is_y_dim(dim) {
            per_dim.push(vec![tile_y]);
        } else if let Some(value) = fixings.get(dim) {
            let idx = coordinate_index(coordinates, dim, value)?;
            per_dim.push(vec![idx as u64 / chunk_size]);
        } else {
            let count = shape[i].div_ceil(chunk_size);
            per_dim.push((0..count).collect());
        }
    }

    Ok(cartesian_product(&per_dim))
}

/// As `chunks_for`, but list selector entries contribute one chunk per
/// listed value (deduplicated, in listed order).
pub fn chunks_for_selector(
    selector: &Selector,
    dimensions: &[String],
    coordinates: &BTreeMap<String, Vec<CoordValue>>,
    shape: &[u64],
    chunks: &[u64],
    tile_x: u64,
    tile_y: u64,
) -> EngineResult<Vec<Vec<u64>>> {
    let mut per_dim: Vec<Vec<u64>> = Vec::with_capacity(dimensions.len());

    for (i, dim) in dimensions.iter().enumerate() {
        let chunk_size = chunks[i].max(1);
        if is_x_dim(dim) {
            per_dim.push(vec![tile_x]);
        } else if is_y_dim(dim) {
            per_dim.push(vec![tile_y]);
        } else {
            match selector.get(dim) {
                Some(SelectorValue::Scalar(v)) => {
                    let idx = coordinate_index(coordinates, dim, v)?;
                    per_dim.push(vec![idx as u64 / chunk_size]);
                }
                Some(SelectorValue::List(vs)) => {
                    let mut set = Vec::new();
                    for v in vs {
                        let idx = coordinate_index(coordinates, dim, v)?;
                        let chunk = idx as u64 / chunk_size;
                        if !set.contains(&chunk) {
                            set.push(chunk);
                        }
                    }
                    per_dim.push(set);
                }
                None => {
                    let count = shape[i].div_ceil(chunk_size);
                    per_dim.push((0..count).collect());
                }
            }
        }
    }

    Ok(cartesian_product(&per_dim))
}

/// Position of a coordinate value along its axis.
pub fn coordinate_index(
    coordinates: &BTreeMap<String, Vec<CoordValue>>,
    dim: &str,
    value: &CoordValue,
) -> EngineResult<usize> {
    let coords = coordinates
        .get(dim)
        .ok_or_else(|| EngineError::selector(format!("unknown dimension: {dim}")))?;
    coords
        .iter()
        .position(|c| c == value)
        .ok_or_else(|| EngineError::selector(format!("value {value:?} not found on {dim}")))
}

fn cartesian_product(per_dim: &[Vec<u64>]) -> Vec<Vec<u64>> {
    let mut out: Vec<Vec<u64>> = vec![Vec::new()];
    for options in per_dim {
        let mut next = Vec::with_capacity(out.len() * options.len());
        for prefix in &out {
            for &opt in options {
                let mut row = prefix.clone();
                row.push(opt);
                next.push(row);
            }
        }
        out = next;
    }
    out
}

/// Canonical string form of a chunk index tuple.
pub fn chunk_key(index: &[u64]) -> String {
    index
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Stable hash of a selector, used to tag which selector's data a tile's
/// GPU buffers currently hold.
pub fn selector_hash(selector: &Selector) -> u64 {
    let mut h = DefaultHasher::new();
    for (dim, value) in selector {
        dim.hash(&mut h);
        match value {
            SelectorValue::Scalar(v) => {
                0u8.hash(&mut h);
                v.hash_into(&mut h);
            }
            SelectorValue::List(vs) => {
                1u8.hash(&mut h);
                for v in vs {
                    v.hash_into(&mut h);
                }
            }
        }
    }
    h.finish()
}
