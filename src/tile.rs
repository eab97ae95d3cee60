//! Tiles: one per pyramid cell, owning chunk staging, in-flight load
//! deduplication, and the GPU band planes the cell renders from.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::future::Shared;
use futures::FutureExt;
use ndarray::{ArrayD, Axis};

use crate::error::{EngineError, EngineResult};
use crate::gpu::{RenderContext, TexturePlane};
use crate::pyramid::metadata::ArrayMeta;
use crate::pyramid::ChunkLoader;
use crate::selector::{
    bands_for, chunk_key, chunks_for, chunks_for_selector, coordinate_index, fixing_for_band,
    is_spatial_dim, is_x_dim, is_y_dim, selector_hash, CoordValue, Selector, SelectorValue,
};
use crate::view::TileKey;

type ChunkResult = Result<(), String>;
type SharedLoad = Shared<Pin<Box<dyn Future<Output = ChunkResult> + Send>>>;

/// Everything tiles of one pyramid level share: array layout, axis values,
/// the level's loader, and the texture allocator.
pub struct LevelContext {
    pub meta: ArrayMeta,
    pub dimensions: Vec<String>,
    pub coordinates: BTreeMap<String, Vec<CoordValue>>,
    pub variable: String,
    pub tile_size: u32,
    pub loader: Arc<dyn ChunkLoader>,
    pub render: Arc<dyn RenderContext>,
}

/// One sampled value with the coordinate labels of its varying dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct PointValue {
    pub keys: Vec<String>,
    pub value: f32,
}

/// A tile's chunk staging and GPU buffers. Loads are deduplicated through
/// shared futures: concurrent callers of the same chunk await one fetch.
pub struct Tile {
    key: TileKey,
    ctx: Arc<LevelContext>,
    chunked_data: Arc<Mutex<HashMap<String, ArrayD<f32>>>>,
    loading: Arc<Mutex<HashMap<String, bool>>>,
    ready: Mutex<HashMap<String, SharedLoad>>,
    bands: Mutex<BTreeMap<String, Arc<dyn TexturePlane>>>,
    buffer_cache: Mutex<Option<u64>>,
}

impl Tile {
    pub fn new(key: TileKey, ctx: Arc<LevelContext>) -> Self {
        Self {
            key,
            ctx,
            chunked_data: Arc::new(Mutex::new(HashMap::new())),
            loading: Arc::new(Mutex::new(HashMap::new())),
            ready: Mutex::new(HashMap::new()),
            bands: Mutex::new(BTreeMap::new()),
            buffer_cache: Mutex::new(None),
        }
    }

    pub fn key(&self) -> TileKey {
        self.key
    }

    /// Chunk index tuples the current selector needs for this tile.
    pub fn chunks_for_selector(&self, selector: &Selector) -> EngineResult<Vec<Vec<u64>>> {
        chunks_for_selector(
            selector,
            &self.ctx.dimensions,
            &self.ctx.coordinates,
            &self.ctx.meta.shape,
            &self.ctx.meta.chunks,
            self.key.x as u64,
            self.key.y as u64,
        )
    }

    /// Fetch every chunk in the list that is not already staged. Returns
    /// true when anything had to be fetched (by this call or one it joined).
    pub async fn load_chunks(&self, chunk_list: &[Vec<u64>]) -> EngineResult<bool> {
        let mut pending: Vec<(String, SharedLoad)> = Vec::new();
        let mut any_new = false;

        for index in chunk_list {
            let key = chunk_key(index);
            if self.chunked_data.lock().unwrap().contains_key(&key) {
                continue;
            }
            any_new = true;
            let mut ready = self.ready.lock().unwrap();
            if let Some(existing) = ready.get(&key) {
                pending.push((key, existing.clone()));
                continue;
            }
            let load = self.start_load(index.clone(), key.clone());
            ready.insert(key.clone(), load.clone());
            self.loading.lock().unwrap().insert(key.clone(), true);
            pending.push((key, load));
        }

        let keys: Vec<String> = pending.iter().map(|(k, _)| k.clone()).collect();
        let results =
            futures::future::join_all(pending.into_iter().map(|(_, f)| f)).await;

        let mut first_error = None;
        for (key, result) in keys.iter().zip(results) {
            if let Err(e) = result {
                // Drop the registration so a later camera update retries.
                self.ready.lock().unwrap().remove(key);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(EngineError::transport(e)),
            None => Ok(any_new),
        }
    }

    fn start_load(&self, index: Vec<u64>, key: String) -> SharedLoad {
        let loader = Arc::clone(&self.ctx.loader);
        let data = Arc::clone(&self.chunked_data);
        let loading = Arc::clone(&self.loading);
        let tile_key = self.key;

        let fut = async move {
            let result = loader.load(&index).await;
            loading.lock().unwrap().insert(key.clone(), false);
            match result {
                Ok(chunk) => {
                    data.lock().unwrap().insert(key, chunk);
                    Ok(())
                }
                Err(e) => {
                    log::warn!("chunk {key} of tile {tile_key} failed to load: {e}");
                    Err(e.to_string())
                }
            }
        };
        (Box::pin(fut) as Pin<Box<dyn Future<Output = ChunkResult> + Send>>).shared()
    }

    /// Wait on loads registered by an earlier `load_chunks` call. Failures
    /// are reported by the call that registered them.
    pub async fn chunks_loaded(&self, chunk_list: &[Vec<u64>]) {
        let waits: Vec<SharedLoad> = {
            let ready = self.ready.lock().unwrap();
            chunk_list
                .iter()
                .filter_map(|index| ready.get(&chunk_key(index)).cloned())
                .collect()
        };
        futures::future::join_all(waits).await;
    }

    /// Every chunk in the list is staged.
    pub fn has_loaded_chunks(&self, chunk_list: &[Vec<u64>]) -> bool {
        let data = self.chunked_data.lock().unwrap();
        chunk_list.iter().all(|c| data.contains_key(&chunk_key(c)))
    }

    /// Every chunk in the list has a load in flight right now.
    pub fn is_loading_chunks(&self, chunk_list: &[Vec<u64>]) -> bool {
        let loading = self.loading.lock().unwrap();
        chunk_list
            .iter()
            .all(|c| loading.get(&chunk_key(c)).copied().unwrap_or(false))
    }

    /// Load then populate. Returns whether any chunk had to be fetched.
    pub async fn populate_buffers(
        &self,
        chunk_list: &[Vec<u64>],
        selector: &Selector,
    ) -> EngineResult<bool> {
        let fetched = self.load_chunks(chunk_list).await?;
        self.populate_buffers_sync(selector)?;
        Ok(fetched)
    }

    /// Write every band's 2-D slice into its GPU plane from staged chunks.
    ///
    /// Each band must resolve to exactly one chunk under its fixings, and
    /// folding the selector dimensions must leave a 2-D (y, x) plane.
    pub fn populate_buffers_sync(&self, selector: &Selector) -> EngineResult<()> {
        let band_names = bands_for(&self.ctx.variable, selector);
        let dims = &self.ctx.dimensions;
        let meta = &self.ctx.meta;

        let data = self.chunked_data.lock().unwrap();
        let mut slice_cache: HashMap<(String, Vec<Option<usize>>), Arc<Vec<f32>>> = HashMap::new();

        for band in &band_names {
            let fixing = fixing_for_band(band, selector);
            let needed = chunks_for(
                &fixing,
                dims,
                &self.ctx.coordinates,
                &meta.shape,
                &meta.chunks,
                self.key.x as u64,
                self.key.y as u64,
            )?;
            if needed.len() != 1 {
                return Err(EngineError::selector(format!(
                    "band {band} requires {} chunks, expected exactly 1",
                    needed.len()
                )));
            }
            let index = &needed[0];
            let key = chunk_key(index);
            let chunk = data.get(&key).ok_or_else(|| {
                EngineError::selector(format!("missing staged chunk {key} for band {band}"))
            })?;

            let mut fold: Vec<Option<usize>> = Vec::with_capacity(dims.len());
            for (i, dim) in dims.iter().enumerate() {
                if is_spatial_dim(dim) {
                    fold.push(None);
                    continue;
                }
                match fixing.get(dim) {
                    Some(v) => {
                        let global = coordinate_index(&self.ctx.coordinates, dim, v)?;
                        let offset = index[i] as usize * meta.chunks[i] as usize;
                        fold.push(Some(global - offset));
                    }
                    None => fold.push(None),
                }
            }

            let cache_key = (key.clone(), fold.clone());
            let texels = match slice_cache.get(&cache_key) {
                Some(t) => Arc::clone(t),
                None => {
                    let t = Arc::new(fold_to_plane(chunk, &fold, dims)?);
                    slice_cache.insert(cache_key, Arc::clone(&t));
                    t
                }
            };

            let plane = self.ensure_band(band);
            plane.write(&texels);
        }
        drop(data);

        *self.buffer_cache.lock().unwrap() = Some(selector_hash(selector));
        Ok(())
    }

    fn ensure_band(&self, band: &str) -> Arc<dyn TexturePlane> {
        let mut bands = self.bands.lock().unwrap();
        if let Some(plane) = bands.get(band) {
            return Arc::clone(plane);
        }
        let label = format!("band-{}-{}", band, self.key);
        let plane = self.ctx.render.create_band_plane(&label, self.ctx.tile_size);
        bands.insert(band.to_string(), Arc::clone(&plane));
        plane
    }

    /// Drop a staged chunk (cache eviction). GPU planes already written
    /// from it are untouched.
    pub fn discard_chunk(&self, chunk: &str) {
        self.chunked_data.lock().unwrap().remove(chunk);
        self.ready.lock().unwrap().remove(chunk);
        self.loading.lock().unwrap().remove(chunk);
    }

    /// Whether the buffers currently hold this exact selector's data.
    pub fn has_populated_buffer(&self, selector: &Selector) -> bool {
        *self.buffer_cache.lock().unwrap() == Some(selector_hash(selector))
    }

    /// Whether the buffers hold any selector's data.
    pub fn is_buffer_populated(&self) -> bool {
        self.buffer_cache.lock().unwrap().is_some()
    }

    /// Band planes for the named bands, in band order; bands never
    /// populated are skipped.
    pub fn band_planes(&self, names: &[String]) -> Vec<(String, Arc<dyn TexturePlane>)> {
        let bands = self.bands.lock().unwrap();
        names
            .iter()
            .filter_map(|n| bands.get(n).map(|p| (n.clone(), Arc::clone(p))))
            .collect()
    }

    /// Sample one pixel of this tile under a selector, enumerating every
    /// combination of list-valued and unconstrained dimensions. `keys`
    /// labels only the dimensions that vary.
    pub fn get_point_values(
        &self,
        selector: &Selector,
        px: u32,
        py: u32,
    ) -> EngineResult<Vec<PointValue>> {
        let dims = &self.ctx.dimensions;
        let meta = &self.ctx.meta;
        let chunks = self.chunks_for_selector(selector)?;
        let data = self.chunked_data.lock().unwrap();
        let mut out = Vec::new();

        for index in &chunks {
            let key = chunk_key(index);
            let chunk = data.get(&key).ok_or_else(|| {
                EngineError::selector(format!("chunk {key} not loaded for point query"))
            })?;

            // Per-dimension choices: fixed index, or (label, index) options
            // for dimensions that vary.
            let mut choices: Vec<Vec<(Option<String>, usize)>> = Vec::with_capacity(dims.len());
            for (i, dim) in dims.iter().enumerate() {
                let chunk_size = meta.chunks[i] as usize;
                let chunk_offset = index[i] as usize * chunk_size;
                if is_x_dim(dim) {
                    choices.push(vec![(None, px as usize)]);
                } else if is_y_dim(dim) {
                    choices.push(vec![(None, py as usize)]);
                } else {
                    match selector.get(dim) {
                        Some(SelectorValue::Scalar(v)) => {
                            let global = coordinate_index(&self.ctx.coordinates, dim, v)?;
                            choices.push(vec![(None, global - chunk_offset)]);
                        }
                        Some(SelectorValue::List(vs)) => {
                            let mut opts = Vec::new();
                            for v in vs {
                                let global = coordinate_index(&self.ctx.coordinates, dim, v)?;
                                if global / chunk_size == index[i] as usize {
                                    opts.push((Some(v.label()), global - chunk_offset));
                                }
                            }
                            choices.push(opts);
                        }
                        None => {
                            let axis_len = meta.shape[i] as usize;
                            let coords = self.ctx.coordinates.get(dim);
                            let mut opts = Vec::new();
                            for local in 0..chunk_size {
                                let global = chunk_offset + local;
                                if global >= axis_len {
                                    break;
                                }
                                let label = coords
                                    .and_then(|c| c.get(global))
                                    .map(|v| v.label())
                                    .unwrap_or_else(|| global.to_string());
                                opts.push((Some(label), local));
                            }
                            choices.push(opts);
                        }
                    }
                }
            }

            enumerate_choices(&choices, &mut |labels, indices| {
                let value = chunk[ndarray::IxDyn(indices)];
                out.push(PointValue {
                    keys: labels.to_vec(),
                    value,
                });
            });
        }

        Ok(out)
    }
}

/// Fold fixed dimensions out of a chunk, leaving the (y, x) plane in
/// row-major order.
fn fold_to_plane(
    chunk: &ArrayD<f32>,
    fold: &[Option<usize>],
    dims: &[String],
) -> EngineResult<Vec<f32>> {
    let mut view = chunk.view();
    let mut remaining: Vec<&String> = Vec::new();

    // Fold from the highest axis down so indices stay valid.
    for (i, dim) in dims.iter().enumerate().rev() {
        match fold[i] {
            Some(idx) => {
                if idx >= view.shape()[i] {
                    return Err(EngineError::selector(format!(
                        "index {idx} out of range on {dim}"
                    )));
                }
                view = view.index_axis_move(Axis(i), idx);
            }
            None => remaining.insert(0, dim),
        }
    }

    if view.ndim() != 2 {
        return Err(EngineError::selector(format!(
            "band data has rank {} after slicing, expected 2",
            view.ndim()
        )));
    }

    // Store as (y, x); transpose when x is the leading surviving axis.
    if is_x_dim(remaining[0]) {
        view = view.reversed_axes();
    }
    Ok(view.iter().copied().collect())
}

fn enumerate_choices(
    choices: &[Vec<(Option<String>, usize)>],
    emit: &mut impl FnMut(&[String], &[usize]),
) {
    fn recurse(
        choices: &[Vec<(Option<String>, usize)>],
        depth: usize,
        labels: &mut Vec<String>,
        indices: &mut Vec<usize>,
        emit: &mut impl FnMut(&[String], &[usize]),
    ) {
        if depth == choices.len() {
            emit(labels, indices);
            return;
        }
        for (label, idx) in &choices[depth] {
            let pushed = if let Some(l) = label {
                labels.push(l.clone());
                true
            } else {
                false
            };
            indices.push(*idx);
            recurse(choices, depth + 1, labels, indices, emit);
            indices.pop();
            if pushed {
                labels.pop();
            }
        }
    }
    recurse(choices, 0, &mut Vec::new(), &mut Vec::new(), emit);
}
