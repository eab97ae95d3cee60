//! Per-level chunk loaders: the seam between tiles and the object store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ndarray::{ArrayD, IxDyn};

use crate::error::{EngineError, EngineResult};
use crate::pyramid::dtype::decode_values;
use crate::pyramid::metadata::ArrayMeta;
use crate::pyramid::store::PyramidStore;

/// Loads one chunk of one array by its integer index tuple.
///
/// Callers may request the same index multiple times; deduplication of
/// in-flight loads happens on the tile side.
#[async_trait]
pub trait ChunkLoader: Send + Sync {
    async fn load(&self, index: &[u64]) -> EngineResult<ArrayD<f32>>;
}

/// Store-backed loader for the variable's array at one pyramid level.
pub struct StoreChunkLoader {
    store: Arc<PyramidStore>,
    variable: String,
    level: u32,
    meta: ArrayMeta,
}

impl StoreChunkLoader {
    pub fn new(store: Arc<PyramidStore>, variable: &str, level: u32, meta: ArrayMeta) -> Self {
        Self {
            store,
            variable: variable.to_string(),
            level,
            meta,
        }
    }
}

#[async_trait]
impl ChunkLoader for StoreChunkLoader {
    async fn load(&self, index: &[u64]) -> EngineResult<ArrayD<f32>> {
        if index.len() != self.meta.chunks.len() {
            return Err(EngineError::selector(format!(
                "chunk index rank {} does not match array rank {}",
                index.len(),
                self.meta.chunks.len()
            )));
        }

        let bytes = self
            .store
            .chunk_bytes(self.level, &self.variable, index, self.meta.codec)
            .await?;

        let shape: Vec<usize> = self.meta.chunks.iter().map(|&c| c as usize).collect();
        let count = shape.iter().product();
        let values = decode_values(&bytes, self.meta.dtype, count)?;

        ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| EngineError::transport(format!("chunk shape mismatch: {e}")))
    }
}

/// One loader per pyramid level.
pub struct LoaderRegistry {
    loaders: BTreeMap<u32, Arc<dyn ChunkLoader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self {
            loaders: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, level: u32, loader: Arc<dyn ChunkLoader>) {
        self.loaders.insert(level, loader);
    }

    pub fn get(&self, level: u32) -> EngineResult<Arc<dyn ChunkLoader>> {
        self.loaders
            .get(&level)
            .cloned()
            .ok_or_else(|| EngineError::metadata(format!("no loader registered for level {level}")))
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
