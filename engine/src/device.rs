use crate::error::DeviceError;
use crate::points::{Palette, PointBuffer, PointStyle};
use crate::viewport::{Projection, Rect};

/// A decoded RGBA8 tile image.
#[derive(Clone, PartialEq, Eq)]
pub struct TileImage {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

impl std::fmt::Debug for TileImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl TileImage {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, DeviceError> {
        if width == 0 || height == 0 {
            return Err(DeviceError::InvalidImage(format!(
                "empty image {width}x{height}"
            )));
        }
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(DeviceError::InvalidImage(format!(
                "expected {expected} bytes for {width}x{height}, got {}",
                rgba.len()
            )));
        }
        Ok(Self {
            width,
            height,
            rgba,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn rgba(&self) -> &[u8] {
        &self.rgba
    }
}

/// Device-side texture id. Deliberately not `Clone`: the cache entry that
/// holds it is the only owner, and releasing it consumes the handle.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle(u64);

impl TextureHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// The minimal GPU surface the engine draws through.
///
/// Draw calls between `begin_frame` and `end_frame` must be presented in the
/// order they were issued.
pub trait GraphicsDevice {
    fn create_texture(&mut self, image: &TileImage) -> Result<TextureHandle, DeviceError>;
    fn destroy_texture(&mut self, texture: TextureHandle);

    fn upload_points(&mut self, points: &PointBuffer) -> Result<(), DeviceError>;
    fn upload_palette(&mut self, palette: &Palette) -> Result<(), DeviceError>;

    fn begin_frame(&mut self, projection: &Projection, clear: [f32; 4]) -> Result<(), DeviceError>;
    fn draw_tile(&mut self, texture: &TextureHandle, bounds: Rect);
    fn draw_points(&mut self, count: u32, style: PointStyle);
    fn end_frame(&mut self) -> Result<(), DeviceError>;
}
