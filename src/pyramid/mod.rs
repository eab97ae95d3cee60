//! Pyramid access: store metadata, dtypes, and chunk loading.

pub mod dtype;
pub mod loader;
pub mod metadata;
pub mod store;

pub use loader::{ChunkLoader, LoaderRegistry, StoreChunkLoader};
pub use metadata::{ArrayMeta, Codec, PyramidMeta, StoreVersion};
pub use store::{HttpFetch, ObjectFetch, PyramidStore};
