use std::fmt;
use std::rc::Rc;

use serde::Deserialize;

use crate::error::SourceError;
use crate::viewport::{Rect, Viewport, tier_for_zoom};

/// Highest tier a packed key can carry.
pub const MAX_TIER: u8 = 48;

const COORD_BITS: u32 = 28;
const COORD_MASK: u64 = (1 << COORD_BITS) - 1;

/// (tier, x, y) packed into one integer: 8 bits tier, 28 bits x, 28 bits y.
/// Ordering of the packed value is (tier, x, y).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey(u64);

impl TileKey {
    pub fn new(tier: u8, x: u32, y: u32) -> Self {
        debug_assert!(u64::from(x) <= COORD_MASK && u64::from(y) <= COORD_MASK);
        Self(
            (u64::from(tier) << (2 * COORD_BITS))
                | ((u64::from(x) & COORD_MASK) << COORD_BITS)
                | (u64::from(y) & COORD_MASK),
        )
    }

    pub fn tier(self) -> u8 {
        (self.0 >> (2 * COORD_BITS)) as u8
    }

    pub fn x(self) -> u32 {
        ((self.0 >> COORD_BITS) & COORD_MASK) as u32
    }

    pub fn y(self) -> u32 {
        (self.0 & COORD_MASK) as u32
    }

    pub fn packed(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tier(), self.x(), self.y())
    }
}

impl fmt::Debug for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TileKey({self})")
    }
}

pub type TileUrlFn = Rc<dyn Fn(TileKey) -> String>;

/// `{base_url}{image_path}/{tier}/{y}_{x}.{extension}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileUrlTemplate {
    pub base_url: String,
    pub image_path: String,
    #[serde(default = "default_extension")]
    pub extension: String,
}

fn default_extension() -> String {
    "jpg".to_string()
}

impl TileUrlTemplate {
    pub fn url(&self, key: TileKey) -> String {
        format!(
            "{}{}/{}/{}_{}.{}",
            self.base_url,
            self.image_path,
            key.tier(),
            key.y(),
            key.x(),
            self.extension
        )
    }
}

/// Host-supplied JSON form of an [`ImageSource`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSourceDescriptor {
    pub width: u64,
    pub height: u64,
    pub tile_size: u32,
    pub max_tier_zoom: u8,
    #[serde(flatten)]
    pub tiles: TileUrlTemplate,
}

impl ImageSourceDescriptor {
    pub fn from_json(json: &str) -> Result<Self, SourceError> {
        serde_json::from_str(json).map_err(|e| SourceError::Json(e.to_string()))
    }
}

/// Immutable description of one tiled image pyramid.
#[derive(Clone)]
pub struct ImageSource {
    width: u64,
    height: u64,
    tile_size: u32,
    max_tier: u8,
    tile_url: TileUrlFn,
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageSource")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("tile_size", &self.tile_size)
            .field("max_tier", &self.max_tier)
            .finish_non_exhaustive()
    }
}

impl ImageSource {
    pub fn new(
        width: u64,
        height: u64,
        tile_size: u32,
        max_tier: u8,
        tile_url: TileUrlFn,
    ) -> Result<Self, SourceError> {
        if width == 0 || height == 0 {
            return Err(SourceError::EmptyImage { width, height });
        }
        if tile_size == 0 {
            return Err(SourceError::ZeroTileSize);
        }
        if max_tier > MAX_TIER {
            return Err(SourceError::TierOutOfRange(max_tier));
        }
        let source = Self {
            width,
            height,
            tile_size,
            max_tier,
            tile_url,
        };
        let (cols, rows) = source.grid(max_tier);
        if cols > COORD_MASK + 1 || rows > COORD_MASK + 1 {
            return Err(SourceError::GridTooLarge {
                tier: max_tier,
                cols,
                rows,
            });
        }
        Ok(source)
    }

    pub fn from_descriptor(descriptor: ImageSourceDescriptor) -> Result<Self, SourceError> {
        let template = descriptor.tiles;
        Self::new(
            descriptor.width,
            descriptor.height,
            descriptor.tile_size,
            descriptor.max_tier_zoom,
            Rc::new(move |key| template.url(key)),
        )
    }

    pub fn width(&self) -> u64 {
        self.width
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn max_tier(&self) -> u8 {
        self.max_tier
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0.0, 0.0, self.width as f64, self.height as f64)
    }

    pub fn tile_url(&self, key: TileKey) -> String {
        (self.tile_url)(key)
    }

    /// Edge length of one tile of `tier`, in world (full-resolution) pixels.
    pub fn tile_world_size(&self, tier: u8) -> f64 {
        let shift = self.max_tier.saturating_sub(tier) as i32;
        self.tile_size as f64 * 2f64.powi(shift)
    }

    /// Number of tile columns and rows at `tier`.
    pub fn grid(&self, tier: u8) -> (u64, u64) {
        let size = self.tile_world_size(tier);
        (
            (self.width as f64 / size).ceil() as u64,
            (self.height as f64 / size).ceil() as u64,
        )
    }

    /// World bounds of a tile, clipped to the image edge.
    pub fn tile_bounds(&self, key: TileKey) -> Rect {
        let size = self.tile_world_size(key.tier());
        let x = key.x() as f64 * size;
        let y = key.y() as f64 * size;
        Rect::new(
            x,
            y,
            size.min(self.width as f64 - x),
            size.min(self.height as f64 - y),
        )
    }
}

/// One wanted tile, produced fresh every time visibility is recomputed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTile {
    pub key: TileKey,
    pub bounds: Rect,
    pub distance_sq: f64,
    pub url: String,
}

impl ScheduledTile {
    pub fn tier(&self) -> u8 {
        self.key.tier()
    }

    pub fn x(&self) -> u32 {
        self.key.x()
    }

    pub fn y(&self) -> u32 {
        self.key.y()
    }
}

/// The active tier and its tiles intersecting the viewport, nearest first.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VisibleSet {
    pub tier: u8,
    pub tiles: Vec<ScheduledTile>,
}

impl VisibleSet {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

/// Compute the tier for the current zoom and every tile of that tier that
/// intersects the visible world rectangle, sorted by squared distance from
/// the tile center to the viewport center (ties broken by key).
pub fn visible_tiles(viewport: &Viewport, source: &ImageSource) -> VisibleSet {
    let tier = tier_for_zoom(viewport.zoom, source.max_tier());
    let view = viewport.visible_world_rect();
    let Some(area) = view.intersection(&source.bounds()) else {
        return VisibleSet {
            tier,
            tiles: Vec::new(),
        };
    };

    let size = source.tile_world_size(tier);
    let (cols, rows) = source.grid(tier);
    let col_start = (area.x / size).floor().max(0.0) as u64;
    let col_end = ((area.right() / size).ceil() as u64).min(cols);
    let row_start = (area.y / size).floor().max(0.0) as u64;
    let row_end = ((area.bottom() / size).ceil() as u64).min(rows);

    let (cx, cy) = view.center();
    let mut tiles = Vec::with_capacity(
        (col_end.saturating_sub(col_start) * row_end.saturating_sub(row_start)) as usize,
    );
    for row in row_start..row_end {
        for col in col_start..col_end {
            let key = TileKey::new(tier, col as u32, row as u32);
            let bounds = source.tile_bounds(key);
            if !bounds.intersects(&view) {
                continue;
            }
            let (tx, ty) = bounds.center();
            let dx = tx - cx;
            let dy = ty - cy;
            tiles.push(ScheduledTile {
                key,
                bounds,
                distance_sq: dx * dx + dy * dy,
                url: source.tile_url(key),
            });
        }
    }

    tiles.sort_by(|a, b| {
        a.distance_sq
            .total_cmp(&b.distance_sq)
            .then_with(|| a.key.cmp(&b.key))
    });

    VisibleSet { tier, tiles }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> ImageSource {
        let template = TileUrlTemplate {
            base_url: "https://tiles.example/".to_string(),
            image_path: "slide-7".to_string(),
            extension: "jpg".to_string(),
        };
        ImageSource::new(10_000, 6_000, 256, 10, Rc::new(move |key| template.url(key)))
            .expect("valid source")
    }

    #[test]
    fn key_packs_and_unpacks() {
        let key = TileKey::new(12, 123_456, 7_890);
        assert_eq!(key.tier(), 12);
        assert_eq!(key.x(), 123_456);
        assert_eq!(key.y(), 7_890);
        assert_eq!(key.to_string(), "12/123456/7890");
    }

    #[test]
    fn key_orders_by_tier_then_x_then_y() {
        assert!(TileKey::new(1, 900, 900) < TileKey::new(2, 0, 0));
        assert!(TileKey::new(3, 1, 900) < TileKey::new(3, 2, 0));
        assert!(TileKey::new(3, 2, 0) < TileKey::new(3, 2, 1));
    }

    #[test]
    fn default_url_template() {
        let src = source();
        assert_eq!(
            src.tile_url(TileKey::new(9, 3, 5)),
            "https://tiles.example/slide-7/9/5_3.jpg"
        );
    }

    #[test]
    fn descriptor_parses_from_json() {
        let json = r#"{
            "width": 2048, "height": 1024, "tileSize": 512, "maxTierZoom": 11,
            "baseUrl": "/tiles/", "imagePath": "abc", "extension": "webp"
        }"#;
        let src = ImageSource::from_descriptor(
            ImageSourceDescriptor::from_json(json).expect("descriptor parses"),
        )
        .expect("descriptor is valid");
        assert_eq!(src.max_tier(), 11);
        assert_eq!(src.tile_url(TileKey::new(11, 1, 0)), "/tiles/abc/11/0_1.webp");
    }

    #[test]
    fn rejects_empty_image() {
        assert!(matches!(
            ImageSource::new(0, 10, 256, 4, Rc::new(|_| String::new())),
            Err(SourceError::EmptyImage { .. })
        ));
    }

    #[test]
    fn tile_world_size_doubles_per_coarser_tier() {
        let src = source();
        assert_eq!(src.tile_world_size(10), 256.0);
        assert_eq!(src.tile_world_size(9), 512.0);
        assert_eq!(src.tile_world_size(0), 256.0 * 1024.0);
        assert_eq!(src.grid(10), (40, 24));
        assert_eq!(src.grid(0), (1, 1));
    }

    #[test]
    fn edge_tiles_are_clipped_to_image() {
        let src = source();
        let bounds = src.tile_bounds(TileKey::new(10, 39, 23));
        assert_eq!(bounds, Rect::new(9_984.0, 5_888.0, 16.0, 112.0));
    }

    #[test]
    fn visible_set_covers_viewport_and_sorts_by_distance() {
        let src = source();
        let vp = Viewport {
            zoom: 1.0,
            offset_x: 1_000.0,
            offset_y: 1_000.0,
            ..Viewport::new(512.0, 512.0)
        };
        let set = visible_tiles(&vp, &src);
        assert_eq!(set.tier, 10);
        // 1000..1512 spans columns 3..=5 and rows 3..=5.
        assert_eq!(set.len(), 9);
        let view = vp.visible_world_rect();
        assert!(set.tiles.iter().all(|t| t.bounds.intersects(&view)));
        assert!(
            set.tiles
                .windows(2)
                .all(|w| w[0].distance_sq <= w[1].distance_sq)
        );
        assert_eq!(set.tiles[0].key, TileKey::new(10, 4, 4));
    }

    #[test]
    fn visible_set_uses_coarser_tier_when_zoomed_out() {
        let src = source();
        let vp = Viewport {
            zoom: 0.1,
            ..Viewport::new(1_000.0, 600.0)
        };
        let set = visible_tiles(&vp, &src);
        // floor(10 + log2(0.1)) = 6, tiles are 4096 world px.
        assert_eq!(set.tier, 6);
        assert_eq!(set.len(), 6);
    }

    #[test]
    fn viewport_outside_image_has_no_tiles() {
        let src = source();
        let vp = Viewport {
            zoom: 1.0,
            offset_x: -5_000.0,
            offset_y: -5_000.0,
            ..Viewport::new(500.0, 500.0)
        };
        assert!(visible_tiles(&vp, &src).is_empty());
    }
}
