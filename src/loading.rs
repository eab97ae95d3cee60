//! Loading tracker: aggregates outstanding metadata and chunk load ids
//! into three observable booleans.

use std::collections::BTreeSet;
use std::sync::Mutex;

/// What a load id was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    Metadata,
    Chunk,
}

/// Snapshot pushed to observers on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct LoadingStatus {
    pub metadata: bool,
    pub chunk: bool,
    pub loading: bool,
}

/// Opaque id handed back by `set_loading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LoadId(u64);

#[derive(Default)]
struct TrackerState {
    next_id: u64,
    metadata: BTreeSet<u64>,
    chunk: BTreeSet<u64>,
}

type Observer = Box<dyn Fn(LoadingStatus) + Send + Sync>;

/// Tracks outstanding loads. The synthetic `loading` boolean is true iff
/// either set is non-empty; the invariant is maintained on every set/clear.
#[derive(Default)]
pub struct LoadingTracker {
    state: Mutex<TrackerState>,
    observer: Mutex<Option<Observer>>,
}

impl LoadingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, observer: impl Fn(LoadingStatus) + Send + Sync + 'static) {
        *self.observer.lock().unwrap() = Some(Box::new(observer));
        self.notify();
    }

    pub fn set_loading(&self, kind: LoadKind) -> LoadId {
        let id = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            match kind {
                LoadKind::Metadata => state.metadata.insert(id),
                LoadKind::Chunk => state.chunk.insert(id),
            };
            id
        };
        self.notify();
        LoadId(id)
    }

    /// Release an id. With `force`, clear everything of the id's kind;
    /// hosts use this when tearing a layer down mid-load.
    pub fn clear_loading(&self, id: LoadId, force: bool) {
        {
            let mut state = self.state.lock().unwrap();
            let in_metadata = state.metadata.contains(&id.0);
            if force {
                if in_metadata {
                    state.metadata.clear();
                } else {
                    state.chunk.clear();
                }
            } else {
                state.metadata.remove(&id.0);
                state.chunk.remove(&id.0);
            }
        }
        self.notify();
    }

    pub fn status(&self) -> LoadingStatus {
        let state = self.state.lock().unwrap();
        let metadata = !state.metadata.is_empty();
        let chunk = !state.chunk.is_empty();
        LoadingStatus {
            metadata,
            chunk,
            loading: metadata || chunk,
        }
    }

    fn notify(&self) {
        let status = self.status();
        if let Some(observer) = self.observer.lock().unwrap().as_ref() {
            observer(status);
        }
    }
}
