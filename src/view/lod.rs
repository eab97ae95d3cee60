//! Level-of-detail fallback: when an active tile's buffers are not ready,
//! pick the best resident ancestor or descendants to stand in, and adjust
//! render offsets so substitutes land at the right screen position.

use crate::view::resolver::RenderOffset;
use crate::view::TileKey;

/// Substitute keys to render in place of `target`.
///
/// Ancestors win outright; otherwise the descendant level with strictly
/// greatest buffer coverage wins; otherwise the target itself is rendered
/// (an empty buffer draws nothing once fill values are discarded).
pub fn keys_to_render<F>(target: TileKey, max_zoom: u32, is_populated: F) -> Vec<TileKey>
where
    F: Fn(TileKey) -> bool,
{
    if is_populated(target) {
        return vec![target];
    }

    let mut ancestor = target.parent();
    while let Some(key) = ancestor {
        if is_populated(key) {
            return vec![key];
        }
        ancestor = key.parent();
    }

    let mut best_coverage = 0.0f64;
    let mut best_keys: Option<Vec<TileKey>> = None;
    for level in target.z + 1..=max_zoom {
        let delta = level - target.z;
        let base_x = target.x << delta;
        let base_y = target.y << delta;
        let mut keys = Vec::new();
        let mut populated = 0usize;
        for dx in 0..=delta {
            for dy in 0..=delta {
                let key = TileKey::new(base_x + dx, base_y + dy, level);
                if is_populated(key) {
                    populated += 1;
                }
                keys.push(key);
            }
        }
        let coverage = populated as f64 / keys.len() as f64;
        if coverage > best_coverage {
            best_coverage = coverage;
            best_keys = Some(keys);
        }
    }

    best_keys.unwrap_or_else(|| vec![target])
}

/// Any rendered key at a strictly coarser level covering `key`'s pixels.
/// A child is suppressed when a coarser stand-in already spans it.
pub fn overlapping_ancestor(key: TileKey, rendered: &[TileKey]) -> Option<TileKey> {
    rendered.iter().copied().find(|r| key.descends_from(*r))
}

/// Re-express a render offset for a substitute at a different level.
///
/// Coarser substitutes floor-divide the offset; finer substitutes scale it
/// up and add back their residual position under the target.
pub fn adjusted_offset(offset: RenderOffset, rendered: TileKey) -> [i64; 2] {
    if offset.level >= rendered.z {
        let factor = 1i64 << (offset.level - rendered.z);
        [offset.x.div_euclid(factor), offset.y.div_euclid(factor)]
    } else {
        let delta = rendered.z - offset.level;
        let factor = 1i64 << delta;
        let mask = (1u32 << delta) - 1;
        [
            offset.x * factor + (rendered.x & mask) as i64,
            offset.y * factor + (rendered.y & mask) as i64,
        ]
    }
}
