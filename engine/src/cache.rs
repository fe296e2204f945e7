use std::collections::HashMap;

use tracing::debug;

use crate::device::{GraphicsDevice, TextureHandle, TileImage};
use crate::error::DeviceError;
use crate::tiles::TileKey;
use crate::viewport::Rect;

/// A decoded tile resident on the GPU.
#[derive(Debug)]
pub struct CacheEntry {
    pub texture: TextureHandle,
    pub bounds: Rect,
    pub tier: u8,
    pub last_used_frame: u64,
}

/// Capacity-bounded tile texture store, evicted by least recent use.
///
/// Textures are released in the same call that removes their entry, so a
/// handle can never be drawn after it has been destroyed.
#[derive(Debug)]
pub struct TileCache {
    entries: HashMap<TileKey, CacheEntry>,
    capacity: usize,
}

impl TileCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity + 1),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: TileKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn get(&self, key: TileKey) -> Option<&CacheEntry> {
        self.entries.get(&key)
    }

    pub fn touch(&mut self, key: TileKey, frame: u64) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.last_used_frame = entry.last_used_frame.max(frame);
        }
    }

    /// Upload `image` and store it under `key`, then evict least recently
    /// used entries until the cache is back within capacity. Returns the
    /// evicted keys, oldest first.
    pub fn insert(
        &mut self,
        key: TileKey,
        image: &TileImage,
        bounds: Rect,
        frame: u64,
        device: &mut dyn GraphicsDevice,
    ) -> Result<Vec<TileKey>, DeviceError> {
        let texture = device.create_texture(image)?;
        let entry = CacheEntry {
            texture,
            bounds,
            tier: key.tier(),
            last_used_frame: frame,
        };
        if let Some(previous) = self.entries.insert(key, entry) {
            device.destroy_texture(previous.texture);
        }

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let Some(victim) = self.least_recently_used(key) else {
                break;
            };
            if let Some(entry) = self.entries.remove(&victim) {
                device.destroy_texture(entry.texture);
            }
            evicted.push(victim);
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), size = self.entries.len(), "evicted tiles");
        }
        Ok(evicted)
    }

    /// Oldest entry by `last_used_frame` (ties broken by key), never `keep`.
    fn least_recently_used(&self, keep: TileKey) -> Option<TileKey> {
        self.entries
            .iter()
            .filter(|(key, _)| **key != keep)
            .min_by_key(|(key, entry)| (entry.last_used_frame, **key))
            .map(|(key, _)| *key)
    }

    /// Every entry whose bounds intersect `view`, ascending by tier then key.
    pub fn intersecting(&self, view: &Rect) -> Vec<TileKey> {
        let mut keys: Vec<TileKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.bounds.intersects(view))
            .map(|(key, _)| *key)
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Release every texture and empty the cache.
    pub fn clear(&mut self, device: &mut dyn GraphicsDevice) {
        for (_, entry) in self.entries.drain() {
            device.destroy_texture(entry.texture);
        }
    }

    /// Forget every entry without touching the device, for when the device
    /// itself is gone and the handles are already dead.
    pub fn invalidate(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
