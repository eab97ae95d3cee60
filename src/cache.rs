//! Byte-budgeted LRU accounting over staged chunks.
//!
//! The core's staging cache grows monotonically; long-lived hosts can set a
//! byte budget and apply the evictions this ledger hands back. Without a
//! budget the ledger only keeps statistics.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::view::TileKey;

/// Identity of one staged chunk.
pub type ChunkRef = (TileKey, String);

/// Counters mirrored from the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub memory_used_bytes: u64,
    pub memory_budget_bytes: Option<u64>,
}

struct Entry {
    bytes: u64,
    last_access: u64,
}

#[derive(Default)]
struct LedgerState {
    entries: HashMap<ChunkRef, Entry>,
    clock: u64,
    used: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// LRU ledger over `(tile key, chunk index)` entries.
pub struct ChunkLedger {
    state: Mutex<LedgerState>,
    budget: Option<u64>,
}

impl ChunkLedger {
    pub fn new(budget_bytes: Option<u64>) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            budget: budget_bytes,
        }
    }

    /// Note an access to a staged chunk.
    pub fn touch(&self, chunk: &ChunkRef) {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let clock = state.clock;
        match state.entries.get_mut(chunk) {
            Some(entry) => {
                entry.last_access = clock;
                state.hits += 1;
            }
            None => state.misses += 1,
        }
    }

    /// Record a newly staged chunk and return the entries to evict to get
    /// back under budget, least recently used first. Entries named in
    /// `pinned` are never offered for eviction.
    pub fn record(&self, chunk: ChunkRef, bytes: u64, pinned: &[ChunkRef]) -> Vec<ChunkRef> {
        let mut state = self.state.lock().unwrap();
        state.clock += 1;
        let clock = state.clock;
        if let Some(old) = state.entries.insert(
            chunk,
            Entry {
                bytes,
                last_access: clock,
            },
        ) {
            state.used -= old.bytes;
        }
        state.used += bytes;

        let Some(budget) = self.budget else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        while state.used > budget {
            let victim = state
                .entries
                .iter()
                .filter(|(k, _)| !pinned.contains(k) && !evicted.contains(*k))
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    if let Some(entry) = state.entries.remove(&key) {
                        state.used -= entry.bytes;
                        state.evictions += 1;
                    }
                    evicted.push(key);
                }
                None => break,
            }
        }
        evicted
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().unwrap();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            memory_used_bytes: state.used,
            memory_budget_bytes: self.budget,
        }
    }
}
