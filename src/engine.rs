//! The engine: owns every tile, reacts to camera updates, schedules chunk
//! loads, decides what to draw, and answers region queries.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use glam::DVec2;
use serde::Serialize;
use tokio::sync::watch;

use crate::cache::{CacheStats, ChunkLedger, ChunkRef};
use crate::error::{EngineError, EngineResult};
use crate::gpu::{ColormapTexture, DrawMode, DrawPass, FrameUniforms, RenderContext, TileProps};
use crate::loading::{LoadKind, LoadingStatus, LoadingTracker};
use crate::pyramid::{ChunkLoader, LoaderRegistry, PyramidMeta, PyramidStore, StoreChunkLoader};
use crate::region::Region;
use crate::selector::{bands_for, selector_hash, Selector, SelectorValue};
use crate::tile::{LevelContext, Tile};
use crate::view::lod::{adjusted_offset, keys_to_render, overlapping_ancestor};
use crate::view::projection::{mercator_y_from_lat, Order, Projection};
use crate::view::resolver::{resolve_active, ActiveTiles, ResolveParams, Viewport};
use crate::view::TileKey;

/// Construction options for a raster layer engine.
pub struct EngineOptions {
    pub variable: String,
    pub selector: Selector,
    pub clim: [f32; 2],
    pub colormap: Vec<[u8; 4]>,
    pub opacity: f32,
    pub display: bool,
    /// One of `texture`, `grid`, `dotgrid`.
    pub mode: String,
    /// Overrides the store's fill value when set.
    pub fill_value: Option<f32>,
    pub order: Option<Order>,
    /// Overrides the CRS-derived projection when set.
    pub projection: Option<String>,
    /// Extra scalar uniforms forwarded to the draw pass.
    pub uniforms: BTreeMap<String, f32>,
    /// Optional fragment expression spliced into the shader template.
    pub frag: Option<String>,
    pub viewport: Viewport,
    pub pixel_ratio: f64,
    /// Byte budget for staged chunks; `None` disables eviction.
    pub chunk_budget_bytes: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            variable: String::new(),
            selector: Selector::new(),
            clim: [0.0, 1.0],
            colormap: vec![[0, 0, 0, 255], [255, 255, 255, 255]],
            opacity: 1.0,
            display: true,
            mode: "texture".to_string(),
            fill_value: None,
            order: None,
            projection: None,
            uniforms: BTreeMap::new(),
            frag: None,
            viewport: Viewport {
                width: 512.0,
                height: 512.0,
            },
            pixel_ratio: 1.0,
            chunk_budget_bytes: None,
        }
    }
}

type Callback = Box<dyn Fn() + Send + Sync>;

/// Host hooks fired on engine state changes.
#[derive(Default)]
pub struct EngineCallbacks {
    /// Redraw is needed.
    pub invalidate: Option<Callback>,
    /// New chunk data arrived; region-query consumers should re-run.
    pub invalidate_region: Option<Callback>,
    /// Metadata resolved.
    pub set_metadata: Option<Box<dyn Fn(&PyramidMeta) + Send + Sync>>,
}

struct ViewState {
    camera: DVec2,
    zoom: f64,
    level: u32,
    center_y: f64,
    active: ActiveTiles,
    viewport: Viewport,
}

struct UniformState {
    clim: [f32; 2],
    opacity: f32,
    display: bool,
    custom: BTreeMap<String, f32>,
}

/// Result of a region query, `None` when superseded by a newer query.
/// Serializes to the JSON shape region-picker UIs consume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionResult {
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    /// Names of the dimensions that vary across `values`.
    pub dimensions: Vec<String>,
    pub values: ValueTree,
}

/// Region values: flat when the selector fixes every non-spatial
/// dimension, nested by varying coordinate labels otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ValueTree {
    Values(Vec<f32>),
    Branches(BTreeMap<String, ValueTree>),
}

impl ValueTree {
    fn push(&mut self, path: &[String], value: f32) {
        match (path.split_first(), self) {
            (None, ValueTree::Values(values)) => values.push(value),
            (Some((head, rest)), ValueTree::Branches(branches)) => {
                branches
                    .entry(head.clone())
                    .or_insert_with(|| {
                        if rest.is_empty() {
                            ValueTree::Values(Vec::new())
                        } else {
                            ValueTree::Branches(BTreeMap::new())
                        }
                    })
                    .push(rest, value);
            }
            _ => log::warn!("point value key depth does not match query dimensions"),
        }
    }
}

/// The raster layer engine.
pub struct Engine {
    meta: PyramidMeta,
    mode: DrawMode,
    projection: Projection,
    order: Order,
    fill_value: f32,
    variable: String,
    frag: Option<String>,
    pixel_ratio: f64,

    loaders: LoaderRegistry,
    tiles: HashMap<TileKey, Tile>,
    state: Mutex<ViewState>,
    selector: Mutex<Selector>,
    uniforms: Mutex<UniformState>,

    colormap: Arc<dyn ColormapTexture>,
    loading: Arc<LoadingTracker>,
    ledger: ChunkLedger,
    callbacks: EngineCallbacks,

    camera_tx: watch::Sender<bool>,
    camera_rx: watch::Receiver<bool>,
    query_stamp: AtomicU64,
}

impl Engine {
    /// Open a pyramid and allocate the full tile arena. The returned future
    /// is the `initialized` gate: metadata problems reject it.
    pub async fn new(
        options: EngineOptions,
        store: Arc<PyramidStore>,
        render: Arc<dyn RenderContext>,
        callbacks: EngineCallbacks,
    ) -> EngineResult<Self> {
        let mode = DrawMode::parse(&options.mode)
            .ok_or_else(|| EngineError::ModeInvalid(options.mode.clone()))?;

        let loading = Arc::new(LoadingTracker::new());
        let metadata_id = loading.set_loading(LoadKind::Metadata);
        let meta = match store.read_pyramid(&options.variable).await {
            Ok(meta) => {
                loading.clear_loading(metadata_id, false);
                meta
            }
            Err(e) => {
                loading.clear_loading(metadata_id, false);
                return Err(e);
            }
        };
        if let Some(cb) = &callbacks.set_metadata {
            cb(&meta);
        }

        let projection = match &options.projection {
            Some(name) => Projection::from_name(name)?,
            None => Projection::from_crs(&meta.crs)?,
        };
        let order = options.order.unwrap_or_default();
        let fill_value = options.fill_value.unwrap_or(meta.fill_value);
        let colormap = render.create_colormap(&options.colormap);

        let mut loaders = LoaderRegistry::new();
        for &level in &meta.levels {
            let array = meta.array(level)?.clone();
            loaders.insert(
                level,
                Arc::new(StoreChunkLoader::new(
                    Arc::clone(&store),
                    &options.variable,
                    level,
                    array,
                )),
            );
        }

        let mut tiles = HashMap::new();
        for &level in &meta.levels {
            let array = meta.array(level)?.clone();
            let ctx = Arc::new(LevelContext {
                meta: array,
                dimensions: meta.dimensions.clone(),
                coordinates: meta.coordinates.clone(),
                variable: options.variable.clone(),
                tile_size: meta.tile_size,
                loader: loaders.get(level)?,
                render: Arc::clone(&render),
            });
            let n = 1u32 << level;
            for x in 0..n {
                for y in 0..n {
                    let key = TileKey::new(x, y, level);
                    tiles.insert(key, Tile::new(key, Arc::clone(&ctx)));
                }
            }
        }

        let (camera_tx, camera_rx) = watch::channel(false);

        Ok(Self {
            mode,
            projection,
            order,
            fill_value,
            variable: options.variable,
            frag: options.frag,
            pixel_ratio: options.pixel_ratio,
            loaders,
            tiles,
            state: Mutex::new(ViewState {
                camera: DVec2::ZERO,
                zoom: 0.0,
                level: 0,
                center_y: 0.5,
                active: ActiveTiles::new(),
                viewport: options.viewport,
            }),
            selector: Mutex::new(options.selector),
            uniforms: Mutex::new(UniformState {
                clim: options.clim,
                opacity: options.opacity,
                display: options.display,
                custom: options.uniforms,
            }),
            colormap,
            loading,
            ledger: ChunkLedger::new(options.chunk_budget_bytes),
            callbacks,
            camera_tx,
            camera_rx,
            query_stamp: AtomicU64::new(0),
            meta,
        })
    }

    /// As [`Engine::new`], opening the HTTP/file store for `source` under
    /// the given layout version.
    pub async fn connect(
        source: &str,
        version: crate::pyramid::StoreVersion,
        options: EngineOptions,
        render: Arc<dyn RenderContext>,
        callbacks: EngineCallbacks,
    ) -> EngineResult<Self> {
        let store = Arc::new(PyramidStore::http(source, version)?);
        Self::new(options, store, render, callbacks).await
    }

    pub fn metadata(&self) -> &PyramidMeta {
        &self.meta
    }

    /// The registered chunk loader for a pyramid level.
    pub fn chunk_loader(&self, level: u32) -> EngineResult<Arc<dyn ChunkLoader>> {
        self.loaders.get(level)
    }

    pub fn loading_status(&self) -> LoadingStatus {
        self.loading.status()
    }

    pub fn on_loading_change(&self, observer: impl Fn(LoadingStatus) + Send + Sync + 'static) {
        self.loading.observe(observer);
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.ledger.stats()
    }

    /// The tiles currently resolved for rendering.
    pub fn active(&self) -> ActiveTiles {
        self.state.lock().unwrap().active.clone()
    }

    fn invalidate(&self) {
        if let Some(cb) = &self.callbacks.invalidate {
            cb();
        }
    }

    fn invalidate_region(&self) {
        if let Some(cb) = &self.callbacks.invalidate_region {
            cb();
        }
    }

    /// Move the camera: recompute the active tile set and bring the tiles'
    /// buffers up to date with the current selector, fetching chunks where
    /// needed. Transport faults leave their tiles empty for a later retry;
    /// selector faults are fatal.
    pub async fn update_camera(&self, lng: f64, lat: f64, zoom: f64) -> EngineResult<()> {
        let level = (zoom.floor().max(0.0) as u32).min(self.meta.max_zoom);
        let tile = self.projection.point_to_tile(lng, lat, level);
        let camera = self.projection.point_to_camera(lng, lat, level);
        let center_y = mercator_y_from_lat(lat);

        let active = {
            let mut state = self.state.lock().unwrap();
            state.zoom = zoom;
            state.level = level;
            state.camera = camera;
            state.center_y = center_y;
            state.active = resolve_active(&ResolveParams {
                tile,
                camera,
                viewport: state.viewport,
                zoom,
                order: self.order,
                projection: self.projection,
                pixel_ratio: self.pixel_ratio,
            });
            state.active.clone()
        };
        let _ = self.camera_tx.send(true);
        self.invalidate();

        let jobs = active.keys().map(|&key| self.sync_tile(key));
        let results = futures::future::join_all(jobs).await;

        let mut saw_new_data = false;
        let mut populated_any = false;
        for result in results {
            let (fetched, populated) = result?;
            saw_new_data |= fetched;
            populated_any |= populated;
        }
        if saw_new_data || populated_any {
            self.invalidate();
        }
        if saw_new_data {
            self.invalidate_region();
        }
        Ok(())
    }

    /// Bring one tile's buffers in line with the current selector. Returns
    /// (new chunk data arrived, buffers were repopulated).
    async fn sync_tile(&self, key: TileKey) -> EngineResult<(bool, bool)> {
        let tile = match self.tiles.get(&key) {
            Some(tile) => tile,
            None => return Ok((false, false)),
        };
        let (selector, version) = {
            let guard = self.selector.lock().unwrap();
            (guard.clone(), selector_hash(&guard))
        };
        if tile.has_populated_buffer(&selector) {
            return Ok((false, false));
        }

        let chunks = tile.chunks_for_selector(&selector)?;
        self.touch_chunks(key, &chunks);

        if tile.has_loaded_chunks(&chunks) {
            tile.populate_buffers_sync(&selector)?;
            return Ok((false, true));
        }

        if tile.is_loading_chunks(&chunks) {
            // Attach to the in-flight load instead of issuing another.
            tile.chunks_loaded(&chunks).await;
            if !tile.has_loaded_chunks(&chunks) {
                return Ok((false, false)); // the shared load failed; its owner reported it
            }
            if self.selector_version() != version {
                return Ok((false, false)); // superseded mid-flight, drop silently
            }
            tile.populate_buffers_sync(&selector)?;
            return Ok((true, true));
        }

        let load_id = self.loading.set_loading(LoadKind::Chunk);
        let fetched = tile.load_chunks(&chunks).await;
        self.loading.clear_loading(load_id, false);

        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(EngineError::Transport(e)) => {
                // The tile stays empty; the next camera update retries.
                log::warn!("tile {key} load failed: {e}");
                return Ok((false, false));
            }
            Err(e) => return Err(e),
        };
        self.account_chunks(key, &chunks);

        if self.selector_version() != version {
            return Ok((fetched, false));
        }
        tile.populate_buffers_sync(&selector)?;
        Ok((fetched, true))
    }

    fn selector_version(&self) -> u64 {
        selector_hash(&self.selector.lock().unwrap())
    }

    /// Record one ledger lookup per chunk: a hit when the chunk is already
    /// accounted, a miss otherwise.
    fn touch_chunks(&self, key: TileKey, chunks: &[Vec<u64>]) {
        for chunk in chunks {
            self.ledger.touch(&(key, crate::selector::chunk_key(chunk)));
        }
    }

    fn account_chunks(&self, key: TileKey, chunks: &[Vec<u64>]) {
        let Ok(array) = self.meta.array(key.z) else {
            return;
        };
        let bytes: u64 = array.chunks.iter().product::<u64>() * 4;
        let pinned: Vec<ChunkRef> = chunks
            .iter()
            .map(|c| (key, crate::selector::chunk_key(c)))
            .collect();
        for chunk in chunks {
            let evicted =
                self.ledger
                    .record((key, crate::selector::chunk_key(chunk)), bytes, &pinned);
            for (tile_key, chunk_key) in evicted {
                if let Some(tile) = self.tiles.get(&tile_key) {
                    tile.discard_chunk(&chunk_key);
                }
            }
        }
    }

    /// Replace the selector. Buffers repopulate lazily on camera ticks;
    /// populations in flight for the old selector are discarded on landing.
    pub fn update_selector(&self, selector: Selector) {
        *self.selector.lock().unwrap() = selector;
        self.invalidate();
    }

    /// Update scalar uniforms. Opacity is forced to zero while the layer is
    /// hidden.
    pub fn update_uniforms(
        &self,
        display: bool,
        opacity: f32,
        clim: [f32; 2],
        custom: BTreeMap<String, f32>,
    ) {
        {
            let mut uniforms = self.uniforms.lock().unwrap();
            uniforms.display = display;
            uniforms.opacity = opacity;
            uniforms.clim = clim;
            uniforms.custom.extend(custom);
        }
        self.invalidate();
    }

    /// Rewrite the colormap texture.
    pub fn update_colormap(&self, rgba: &[[u8; 4]]) {
        self.colormap.write(rgba);
        self.invalidate();
    }

    /// Resize the viewport. Takes effect on the next camera update.
    pub fn update_viewport(&self, viewport: Viewport) {
        self.state.lock().unwrap().viewport = viewport;
    }

    /// Assemble the draw list: substitute unready tiles via the LOD
    /// fallback, adjust offsets, and suppress duplicates and children
    /// already covered by a coarser stand-in.
    pub fn get_props(&self) -> Vec<TileProps> {
        let active = self.active();
        let selector = self.selector.lock().unwrap().clone();
        let band_names = bands_for(&self.variable, &selector);

        let mut props: Vec<TileProps> = Vec::new();
        for (key, offsets) in &active {
            let substitutes = keys_to_render(*key, self.meta.max_zoom, |k| {
                self.tiles
                    .get(&k)
                    .map(|t| t.is_buffer_populated())
                    .unwrap_or(false)
            });
            for render_key in substitutes {
                let Some(tile) = self.tiles.get(&render_key) else {
                    continue;
                };
                for offset in offsets {
                    let adjusted = adjusted_offset(*offset, render_key);
                    let duplicate = props
                        .iter()
                        .any(|p| p.key == render_key && p.offset == adjusted);
                    if duplicate {
                        continue;
                    }
                    let rendered: Vec<TileKey> = props.iter().map(|p| p.key).collect();
                    if overlapping_ancestor(render_key, &rendered).is_some() {
                        continue;
                    }
                    props.push(TileProps {
                        key: render_key,
                        level: render_key.z,
                        offset: adjusted,
                        bands: tile.band_planes(&band_names),
                    });
                }
            }
        }
        props
    }

    /// Submit one draw call per prop.
    pub fn draw(&self, pass: &dyn DrawPass) -> EngineResult<()> {
        let props = self.get_props();
        let uniforms = self.frame_uniforms();
        pass.draw(&props, &self.colormap, &uniforms)
    }

    /// The shader contract's frame-level uniform values.
    pub fn frame_uniforms(&self) -> FrameUniforms {
        let state = self.state.lock().unwrap();
        let uniforms = self.uniforms.lock().unwrap();
        FrameUniforms {
            camera: [state.camera.x, state.camera.y],
            viewport_width: state.viewport.width,
            viewport_height: state.viewport.height,
            pixel_ratio: self.pixel_ratio,
            zoom: state.zoom,
            size: self.meta.tile_size,
            global_level: state.level,
            order: [self.order.x, self.order.y],
            projection_code: self.projection.code(),
            clim: uniforms.clim,
            opacity: if uniforms.display { uniforms.opacity } else { 0.0 },
            fill_value: self.fill_value,
            center_y: state.center_y,
            mode: self.mode,
            custom: uniforms.custom.clone(),
        }
    }

    /// Custom fragment expression registered at construction.
    pub fn frag(&self) -> Option<&str> {
        self.frag.as_deref()
    }

    /// Sample every pixel of the region's circle at the current level.
    /// Returns `None` when a newer query superseded this one while its
    /// chunks were loading.
    pub async fn query_region(
        &self,
        region: &Region,
        selector: &Selector,
    ) -> EngineResult<Option<RegionResult>> {
        let stamp = self.query_stamp.fetch_add(1, Ordering::SeqCst) + 1;

        // Wait for the first camera update; the query level depends on it.
        let mut camera_rx = self.camera_rx.clone();
        while !*camera_rx.borrow() {
            if camera_rx.changed().await.is_err() {
                return Err(EngineError::transport("engine dropped before camera init"));
            }
        }

        let level = self.state.lock().unwrap().level;
        let keys = crate::region::tiles_of_region(region, level, self.projection, self.order);

        for key in &keys {
            let Some(tile) = self.tiles.get(key) else {
                continue;
            };
            let chunks = tile.chunks_for_selector(selector)?;
            self.touch_chunks(*key, &chunks);
            if !tile.has_loaded_chunks(&chunks) {
                let load_id = self.loading.set_loading(LoadKind::Chunk);
                let result = tile.load_chunks(&chunks).await;
                self.loading.clear_loading(load_id, false);
                result?;
                self.account_chunks(*key, &chunks);
            }
        }

        if self.query_stamp.load(Ordering::SeqCst) != stamp {
            return Ok(None);
        }

        let varying = self.varying_dimensions(selector);
        let mut result = RegionResult {
            lat: Vec::new(),
            lon: Vec::new(),
            dimensions: varying.clone(),
            values: if varying.is_empty() {
                ValueTree::Values(Vec::new())
            } else {
                ValueTree::Branches(BTreeMap::new())
            },
        };

        let size = self.meta.tile_size;
        for key in &keys {
            let Some(tile) = self.tiles.get(key) else {
                continue;
            };
            for j in 0..size {
                for i in 0..size {
                    let (lng, lat) =
                        self.projection
                            .pixel_to_lng_lat(*key, i, j, size, self.order);
                    if !region.contains(lng, lat) {
                        continue;
                    }
                    let points = tile.get_point_values(selector, i, j)?;
                    if points.is_empty() {
                        continue;
                    }
                    result.lat.push(lat);
                    result.lon.push(lng);
                    for point in points {
                        result.values.push(&point.keys, point.value);
                    }
                }
            }
        }
        Ok(Some(result))
    }

    /// Non-spatial dimensions the selector leaves varying: list entries and
    /// unconstrained dimensions, in storage order.
    fn varying_dimensions(&self, selector: &Selector) -> Vec<String> {
        self.meta
            .selector_dimensions()
            .into_iter()
            .filter(|dim| {
                !matches!(selector.get(dim), Some(SelectorValue::Scalar(_)))
            })
            .collect()
    }
}
