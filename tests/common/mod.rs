//! Shared test support: an in-memory object store and a CPU render backend.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use zarrmap::error::{EngineError, EngineResult};
use zarrmap::gpu::{ColormapTexture, DrawPass, FrameUniforms, RenderContext, TexturePlane, TileProps};
use zarrmap::pyramid::{ObjectFetch, PyramidStore, StoreVersion};
use zarrmap::view::TileKey;
use zarrmap::{Engine, EngineCallbacks, EngineOptions};

pub const TILE_SIZE: u32 = 8;
pub const MAX_ZOOM: u32 = 2;

/// In-memory object store with per-path fetch counting, injectable
/// failures, and an optional per-fetch delay.
pub struct MemoryFetch {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    counts: Mutex<HashMap<String, usize>>,
    failing_prefixes: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
}

impl MemoryFetch {
    pub fn new(objects: HashMap<String, Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(objects),
            counts: Mutex::new(HashMap::new()),
            failing_prefixes: Mutex::new(HashSet::new()),
            delay: Mutex::new(None),
        })
    }

    pub fn fetch_count(&self, path: &str) -> usize {
        self.counts.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.counts.lock().unwrap().values().sum()
    }

    pub fn fail_prefix(&self, prefix: &str) {
        self.failing_prefixes.lock().unwrap().insert(prefix.to_string());
    }

    pub fn heal_prefix(&self, prefix: &str) {
        self.failing_prefixes.lock().unwrap().remove(prefix);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }
}

/// `ObjectFetch` handle over a shared `MemoryFetch`.
pub struct FetchHandle(pub Arc<MemoryFetch>);

#[async_trait]
impl ObjectFetch for FetchHandle {
    async fn fetch(&self, path: &str) -> EngineResult<Vec<u8>> {
        *self
            .0
            .counts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_insert(0) += 1;

        let failing = {
            let prefixes = self.0.failing_prefixes.lock().unwrap();
            prefixes.iter().any(|p| path.starts_with(p.as_str()))
        };
        if failing {
            return Err(EngineError::transport(format!("injected failure for {path}")));
        }

        let delay = *self.0.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.0
            .objects
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| EngineError::transport(format!("404 for {path}")))
    }
}

/// A CPU texture plane that records what was written to it.
#[derive(Debug)]
pub struct CpuPlane {
    pub label: String,
    pub size: u32,
    pub data: Mutex<Vec<f32>>,
    pub writes: AtomicUsize,
}

impl TexturePlane for CpuPlane {
    fn write(&self, data: &[f32]) {
        *self.data.lock().unwrap() = data.to_vec();
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct CpuColormap {
    pub data: Mutex<Vec<[u8; 4]>>,
    pub writes: AtomicUsize,
}

impl ColormapTexture for CpuColormap {
    fn write(&self, rgba: &[[u8; 4]]) {
        *self.data.lock().unwrap() = rgba.to_vec();
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// CPU render backend that keeps every allocated plane inspectable.
#[derive(Default)]
pub struct CpuRenderContext {
    pub planes: Mutex<Vec<Arc<CpuPlane>>>,
    pub colormaps: Mutex<Vec<Arc<CpuColormap>>>,
}

impl CpuRenderContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn plane_labels(&self) -> Vec<String> {
        self.planes.lock().unwrap().iter().map(|p| p.label.clone()).collect()
    }
}

impl RenderContext for CpuRenderContext {
    fn create_band_plane(&self, label: &str, size: u32) -> Arc<dyn TexturePlane> {
        let plane = Arc::new(CpuPlane {
            label: label.to_string(),
            size,
            data: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
        });
        self.planes.lock().unwrap().push(Arc::clone(&plane));
        plane
    }

    fn create_colormap(&self, rgba: &[[u8; 4]]) -> Arc<dyn ColormapTexture> {
        let lut = Arc::new(CpuColormap::default());
        lut.write(rgba);
        self.colormaps.lock().unwrap().push(Arc::clone(&lut));
        lut
    }
}

/// One recorded draw call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawCall {
    pub key: TileKey,
    pub level: u32,
    pub offset: [i64; 2],
    pub bands: Vec<String>,
}

/// Draw pass that records one entry per submitted call, including the
/// bands the call consumes.
#[derive(Default)]
pub struct CapturePass {
    pub calls: Mutex<Vec<DrawCall>>,
}

impl DrawPass for CapturePass {
    fn draw(
        &self,
        props: &[TileProps],
        _colormap: &Arc<dyn ColormapTexture>,
        _uniforms: &FrameUniforms,
    ) -> EngineResult<()> {
        let mut calls = self.calls.lock().unwrap();
        for p in props {
            calls.push(DrawCall {
                key: p.key,
                level: p.level,
                offset: p.offset,
                bands: p.bands.iter().map(|(name, _)| name.clone()).collect(),
            });
        }
        Ok(())
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Deterministic value of a pixel: unique per (level, global x, global y).
pub fn flat_value(level: u32, gx: u32, gy: u32) -> f32 {
    (level * 1_000_000 + gy * 1_000 + gx) as f32
}

/// As `flat_value` with a time plane component.
pub fn timed_value(t: u32, level: u32, gx: u32, gy: u32) -> f32 {
    (t * 4_000_000 + level * 1_000_000 + gy * 1_000 + gx) as f32
}

fn flat_chunk(level: u32, tx: u32, ty: u32) -> Vec<u8> {
    let mut values = Vec::new();
    for j in 0..TILE_SIZE {
        for i in 0..TILE_SIZE {
            values.push(flat_value(level, tx * TILE_SIZE + i, ty * TILE_SIZE + j));
        }
    }
    f32_bytes(&values)
}

fn timed_chunk(t: u32, level: u32, tx: u32, ty: u32) -> Vec<u8> {
    let mut values = Vec::new();
    for j in 0..TILE_SIZE {
        for i in 0..TILE_SIZE {
            values.push(timed_value(t, level, tx * TILE_SIZE + i, ty * TILE_SIZE + j));
        }
    }
    f32_bytes(&values)
}

fn multiscales_attrs() -> Value {
    json!({
        "multiscales": [{
            "datasets": [
                { "path": "0", "pixels_per_tile": TILE_SIZE, "crs": "EPSG:3857" },
                { "path": "1", "pixels_per_tile": TILE_SIZE },
                { "path": "2", "pixels_per_tile": TILE_SIZE }
            ]
        }]
    })
}

/// v2 pyramid of variable `tavg` with dimensions (y, x).
pub fn flat_fixture() -> Arc<MemoryFetch> {
    let mut objects = HashMap::new();
    let mut entries = serde_json::Map::new();
    entries.insert(".zattrs".to_string(), multiscales_attrs());

    for level in 0..=MAX_ZOOM {
        let n = 1u32 << level;
        let side = TILE_SIZE * n;
        entries.insert(
            format!("{level}/tavg/.zarray"),
            json!({
                "shape": [side, side],
                "chunks": [TILE_SIZE, TILE_SIZE],
                "dtype": "<f4",
                "fill_value": -9999.0,
                "compressor": null
            }),
        );
        entries.insert(
            format!("{level}/tavg/.zattrs"),
            json!({ "_ARRAY_DIMENSIONS": ["y", "x"] }),
        );
        for ty in 0..n {
            for tx in 0..n {
                objects.insert(
                    format!("{level}/tavg/{ty}.{tx}"),
                    flat_chunk(level, tx, ty),
                );
            }
        }
    }

    objects.insert(
        ".zmetadata".to_string(),
        serde_json::to_vec(&json!({ "metadata": Value::Object(entries) })).unwrap(),
    );
    MemoryFetch::new(objects)
}

/// v2 pyramid of variable `temp` with dimensions (time, y, x) and time
/// coordinates [2020, 2021], one time step per chunk.
pub fn timed_fixture() -> Arc<MemoryFetch> {
    let mut objects = HashMap::new();
    let mut entries = serde_json::Map::new();
    entries.insert(".zattrs".to_string(), multiscales_attrs());

    let time_zarray = json!({
        "shape": [2],
        "chunks": [2],
        "dtype": "<f4",
        "fill_value": null,
        "compressor": null
    });
    let time_zattrs = json!({ "_ARRAY_DIMENSIONS": ["time"] });
    entries.insert("0/time/.zarray".to_string(), time_zarray.clone());
    entries.insert("0/time/.zattrs".to_string(), time_zattrs.clone());
    objects.insert("0/time/.zarray".to_string(), serde_json::to_vec(&time_zarray).unwrap());
    objects.insert("0/time/.zattrs".to_string(), serde_json::to_vec(&time_zattrs).unwrap());
    objects.insert("0/time/0".to_string(), f32_bytes(&[2020.0, 2021.0]));

    for level in 0..=MAX_ZOOM {
        let n = 1u32 << level;
        let side = TILE_SIZE * n;
        entries.insert(
            format!("{level}/temp/.zarray"),
            json!({
                "shape": [2, side, side],
                "chunks": [1, TILE_SIZE, TILE_SIZE],
                "dtype": "<f4",
                "fill_value": -9999.0,
                "compressor": null
            }),
        );
        entries.insert(
            format!("{level}/temp/.zattrs"),
            json!({ "_ARRAY_DIMENSIONS": ["time", "y", "x"] }),
        );
        for t in 0..2u32 {
            for ty in 0..n {
                for tx in 0..n {
                    objects.insert(
                        format!("{level}/temp/{t}.{ty}.{tx}"),
                        timed_chunk(t, level, tx, ty),
                    );
                }
            }
        }
    }

    objects.insert(
        ".zmetadata".to_string(),
        serde_json::to_vec(&json!({ "metadata": Value::Object(entries) })).unwrap(),
    );
    MemoryFetch::new(objects)
}

pub fn store_for(fetch: &Arc<MemoryFetch>, version: StoreVersion) -> Arc<PyramidStore> {
    Arc::new(PyramidStore::new(
        Box::new(FetchHandle(Arc::clone(fetch))),
        version,
    ))
}

/// Engine over a fixture with the CPU backend and default options.
pub async fn engine_over(
    fetch: &Arc<MemoryFetch>,
    variable: &str,
    configure: impl FnOnce(&mut EngineOptions),
) -> (Engine, Arc<CpuRenderContext>) {
    let render = CpuRenderContext::new();
    let mut options = EngineOptions {
        variable: variable.to_string(),
        ..Default::default()
    };
    configure(&mut options);
    let engine = Engine::new(
        options,
        store_for(fetch, StoreVersion::V2),
        render.clone() as Arc<dyn RenderContext>,
        EngineCallbacks::default(),
    )
    .await
    .expect("engine construction");
    (engine, render)
}
