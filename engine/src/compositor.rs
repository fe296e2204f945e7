use crate::cache::TileCache;
use crate::device::GraphicsDevice;
use crate::tiles::{ScheduledTile, VisibleSet};
use crate::viewport::Rect;

/// What one compositing pass drew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompositeStats {
    /// Exact-tier tiles drawn.
    pub rendered: usize,
    /// Other-tier tiles drawn underneath.
    pub fallback: usize,
}

/// Wanted tiles that are not cached yet; these go to the fetch scheduler.
pub fn missing_tiles(cache: &TileCache, wanted: &VisibleSet) -> Vec<ScheduledTile> {
    wanted
        .tiles
        .iter()
        .filter(|tile| !cache.contains(tile.key))
        .cloned()
        .collect()
}

/// Draw every cached tile that covers `view`.
///
/// Pass one paints all intersecting entries of other tiers in ascending tier
/// order, so coarse imagery lands first and finer imagery over it. Pass two
/// paints the cached tiles of the current tier on top. Everything drawn is
/// marked used in `frame`.
pub fn composite(
    cache: &mut TileCache,
    view: &Rect,
    wanted: &VisibleSet,
    frame: u64,
    device: &mut dyn GraphicsDevice,
) -> CompositeStats {
    let mut stats = CompositeStats::default();

    for key in cache.intersecting(view) {
        if key.tier() == wanted.tier {
            continue;
        }
        cache.touch(key, frame);
        if let Some(entry) = cache.get(key) {
            device.draw_tile(&entry.texture, entry.bounds);
            stats.fallback += 1;
        }
    }

    for tile in &wanted.tiles {
        cache.touch(tile.key, frame);
        if let Some(entry) = cache.get(tile.key) {
            device.draw_tile(&entry.texture, entry.bounds);
            stats.rendered += 1;
        }
    }

    stats
}
