//! zarrmap: a client-side raster map tile engine.
//!
//! Streams multidimensional Zarr pyramids from an object store and renders
//! them as a continuously-zoomable GPU texture layer aligned to a slippy
//! map, with geodesic region queries over the same in-memory cache.
//!
//! The engine consumes three seams from its host: a camera (center + zoom
//! updates), a render backend ([`gpu::RenderContext`] / [`gpu::DrawPass`]),
//! and an object store ([`pyramid::ObjectFetch`]). A wgpu backend and an
//! HTTP/file store ship in-crate.

pub mod cache;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod loading;
pub mod pyramid;
pub mod region;
pub mod selector;
pub mod tile;
pub mod view;

pub use engine::{Engine, EngineCallbacks, EngineOptions, RegionResult, ValueTree};
pub use error::{EngineError, EngineResult};
pub use gpu::{DrawMode, DrawPass, FrameUniforms, RenderContext, TileProps};
pub use loading::{LoadKind, LoadingStatus, LoadingTracker};
pub use pyramid::{ChunkLoader, PyramidMeta, PyramidStore, StoreVersion};
pub use region::{RadiusUnits, Region};
pub use selector::{CoordValue, Selector, SelectorValue};
pub use tile::{PointValue, Tile};
pub use view::{Order, Projection, TileKey, Viewport};
