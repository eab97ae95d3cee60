//! Object-store access for pyramid data: metadata documents, coordinate
//! arrays and chunk bytes, for both store layout versions.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::pyramid::dtype::{decode_labels, decode_values, Dtype};
use crate::pyramid::metadata::{
    parse_multiscales, parse_v2_array, parse_v3_array, ArrayMeta, Codec, PyramidMeta, StoreVersion,
};
use crate::selector::{is_spatial_dim, CoordValue};

/// Fetch of one object by store-relative path. Implementations hide the
/// transport (HTTP, local disk, in-memory fixtures in tests).
#[async_trait]
pub trait ObjectFetch: Send + Sync {
    async fn fetch(&self, path: &str) -> EngineResult<Vec<u8>>;
}

/// HTTP/file object fetch with explicit status checks.
pub struct HttpFetch {
    client: reqwest::Client,
    base: String,
}

impl HttpFetch {
    pub fn new(source: &str) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base: source.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ObjectFetch for HttpFetch {
    async fn fetch(&self, path: &str) -> EngineResult<Vec<u8>> {
        let url = format!("{}/{}", self.base, path);

        if let Some(local) = url.strip_prefix("file://") {
            let mut buf = PathBuf::from(local);
            if !buf.is_absolute() {
                buf = std::env::current_dir()?.join(buf);
            }
            return Ok(std::fs::read(buf)?);
        }

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::transport(format!(
                "GET {} failed with status {}",
                url,
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

fn decompress(data: Vec<u8>, codec: Codec) -> EngineResult<Vec<u8>> {
    match codec {
        Codec::Raw => Ok(data),
        Codec::Zlib => {
            let mut decoder = flate2::read::ZlibDecoder::new(data.as_slice());
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| EngineError::transport(format!("zlib decode failed: {e}")))?;
            Ok(out)
        }
        Codec::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(data.as_slice());
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| EngineError::transport(format!("gzip decode failed: {e}")))?;
            Ok(out)
        }
    }
}

/// A versioned pyramid store: one fetch transport plus the path and
/// document conventions of the selected layout version.
pub struct PyramidStore {
    fetch: Box<dyn ObjectFetch>,
    version: StoreVersion,
}

impl PyramidStore {
    pub fn new(fetch: Box<dyn ObjectFetch>, version: StoreVersion) -> Self {
        Self { fetch, version }
    }

    pub fn http(source: &str, version: StoreVersion) -> EngineResult<Self> {
        Ok(Self::new(Box::new(HttpFetch::new(source)?), version))
    }

    pub fn version(&self) -> StoreVersion {
        self.version
    }

    async fn fetch_json(&self, path: &str) -> EngineResult<Value> {
        let bytes = self.fetch.fetch(path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::metadata(format!("malformed {path}: {e}")))
    }

    async fn array_meta(&self, path: &str) -> EngineResult<ArrayMeta> {
        match self.version {
            StoreVersion::V2 => {
                // Standalone fetch path; the consolidated document is
                // preferred when reading the whole pyramid.
                let zarray = self.fetch_json(&format!("{path}/.zarray")).await?;
                let zattrs = self.fetch_json(&format!("{path}/.zattrs")).await.ok();
                parse_v2_array(&zarray, zattrs.as_ref())
            }
            StoreVersion::V3 => {
                let doc = self.fetch_json(&format!("{path}/zarr.json")).await?;
                parse_v3_array(&doc)
            }
        }
    }

    /// Read the full pyramid description for one variable, including the
    /// axis values of every non-spatial coordinate.
    pub async fn read_pyramid(&self, variable: &str) -> EngineResult<PyramidMeta> {
        let (levels, max_zoom, tile_size, crs, mut arrays) = match self.version {
            StoreVersion::V2 => {
                let doc = self.fetch_json(".zmetadata").await?;
                let entries = doc
                    .get("metadata")
                    .ok_or_else(|| EngineError::metadata("missing metadata in .zmetadata"))?;

                let root_attrs = entries.get(".zattrs").cloned().unwrap_or(Value::Null);
                let (levels, max_zoom, tile_size, crs) =
                    parse_multiscales(root_attrs.get("multiscales"))?;

                let mut arrays = BTreeMap::new();
                for &level in &levels {
                    let zarray = entries
                        .get(format!("{level}/{variable}/.zarray"))
                        .ok_or_else(|| {
                            EngineError::metadata(format!(
                                "missing .zarray for {variable} at level {level}"
                            ))
                        })?;
                    let zattrs = entries.get(format!("{level}/{variable}/.zattrs"));
                    arrays.insert(level, parse_v2_array(zarray, zattrs)?);
                }
                (levels, max_zoom, tile_size, crs, arrays)
            }
            StoreVersion::V3 => {
                let root = self.fetch_json("zarr.json").await?;
                let attrs = root.get("attributes").unwrap_or(&Value::Null);
                let (levels, max_zoom, tile_size, crs) =
                    parse_multiscales(attrs.get("multiscales"))?;

                let mut arrays = BTreeMap::new();
                for &level in &levels {
                    let meta = self.array_meta(&format!("{level}/{variable}")).await?;
                    arrays.insert(level, meta);
                }
                (levels, max_zoom, tile_size, crs, arrays)
            }
        };

        let base = arrays
            .get(&0)
            .ok_or_else(|| EngineError::metadata("pyramid has no level 0 array"))?;
        let dimensions = base.dimensions.clone();
        if dimensions.len() != base.shape.len() {
            return Err(EngineError::metadata(
                "array dimension names do not match its shape",
            ));
        }
        let fill_value = base.fill_value;

        let mut coordinates = BTreeMap::new();
        for dim in dimensions.iter().filter(|d| !is_spatial_dim(d)) {
            coordinates.insert(dim.clone(), self.coordinate_values(dim).await?);
        }

        // Drop per-level dimension copies the engine reads from the top.
        for meta in arrays.values_mut() {
            if meta.dimensions.is_empty() {
                meta.dimensions = dimensions.clone();
            }
        }

        Ok(PyramidMeta {
            levels,
            max_zoom,
            tile_size,
            crs,
            arrays,
            dimensions,
            coordinates,
            fill_value,
        })
    }

    /// Axis values of one coordinate, read from its level-0 array. The
    /// axes of interest are small; one chunk covers them.
    pub async fn coordinate_values(&self, dim: &str) -> EngineResult<Vec<CoordValue>> {
        let meta = self.array_meta(&format!("0/{dim}")).await?;
        if meta.shape.len() != 1 {
            return Err(EngineError::metadata(format!(
                "coordinate {dim} is not one-dimensional"
            )));
        }
        let count = meta.shape[0] as usize;
        let raw = self.chunk_bytes(0, dim, &[0], meta.codec).await?;

        match meta.dtype {
            Dtype::S(_) => Ok(decode_labels(&raw, meta.dtype, count)?
                .into_iter()
                .map(CoordValue::Str)
                .collect()),
            _ => Ok(decode_values(&raw, meta.dtype, count)?
                .into_iter()
                .map(|v| CoordValue::Num(v as f64))
                .collect()),
        }
    }

    /// Raw decompressed bytes of one chunk of one array.
    pub async fn chunk_bytes(
        &self,
        level: u32,
        variable: &str,
        index: &[u64],
        codec: Codec,
    ) -> EngineResult<Vec<u8>> {
        let path = match self.version {
            StoreVersion::V2 => {
                let suffix = index
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(".");
                format!("{level}/{variable}/{suffix}")
            }
            StoreVersion::V3 => {
                let suffix = index
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("/");
                format!("{level}/{variable}/c/{suffix}")
            }
        };
        let raw = self.fetch.fetch(&path).await?;
        decompress(raw, codec)
    }
}
