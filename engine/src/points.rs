use tracing::debug;

use crate::config::PointConfig;
use crate::device::GraphicsDevice;
use crate::error::{DeviceError, PointDataError};

const RING_WIDTH_SCALE: f32 = 3.0;
const RING_WIDTH_MIN: f32 = 0.12;
const RING_WIDTH_MAX: f32 = 0.62;
const AA_BAND_SCALE: f32 = 1.5;

/// Flat, pre-parsed point data. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq)]
pub struct PointBuffer {
    positions: Vec<f32>,
    palette_indices: Vec<u16>,
}

impl PointBuffer {
    pub fn new(positions: Vec<f32>, palette_indices: Vec<u16>) -> Result<Self, PointDataError> {
        let count = palette_indices.len();
        if positions.len() != count * 2 {
            return Err(PointDataError::PositionLength {
                count,
                expected: count * 2,
                actual: positions.len(),
            });
        }
        Ok(Self {
            positions,
            palette_indices,
        })
    }

    /// Build from an explicit count, as delivered by the point data contract.
    pub fn with_count(
        count: usize,
        positions: Vec<f32>,
        palette_indices: Vec<u16>,
    ) -> Result<Self, PointDataError> {
        if palette_indices.len() != count {
            return Err(PointDataError::IndexLength {
                count,
                actual: palette_indices.len(),
            });
        }
        Self::new(positions, palette_indices)
    }

    pub fn count(&self) -> usize {
        self.palette_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.palette_indices.is_empty()
    }

    /// Interleaved (x, y) world coordinates.
    pub fn positions(&self) -> &[f32] {
        &self.positions
    }

    pub fn palette_indices(&self) -> &[u16] {
        &self.palette_indices
    }
}

/// One RGBA entry per category, uploaded as an Nx1 lookup texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    rgba: Vec<u8>,
}

impl Palette {
    pub fn new(rgba: Vec<u8>) -> Result<Self, PointDataError> {
        if rgba.is_empty() {
            return Err(PointDataError::EmptyPalette);
        }
        if rgba.len() % 4 != 0 {
            return Err(PointDataError::RaggedPalette(rgba.len()));
        }
        Ok(Self { rgba })
    }

    pub fn len(&self) -> usize {
        self.rgba.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.rgba.is_empty()
    }

    pub fn rgba(&self) -> &[u8] {
        &self.rgba
    }

    pub fn color(&self, index: u16) -> Option<[u8; 4]> {
        let start = index as usize * 4;
        self.rgba
            .get(start..start + 4)
            .map(|c| [c[0], c[1], c[2], c[3]])
    }

    /// Zero-alpha categories, and indices past the end of the palette, are
    /// discarded by the point shader.
    pub fn is_hidden(&self, index: u16) -> bool {
        self.color(index).is_none_or(|c| c[3] == 0)
    }
}

/// Per-frame point parameters shared by every point in the batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointStyle {
    /// Diameter in CSS pixels.
    pub size: f32,
    /// Ring thickness as a fraction of the radius.
    pub ring_width: f32,
    /// Antialiasing band as a fraction of the radius.
    pub aa_band: f32,
}

impl PointStyle {
    pub fn for_size(size: f32) -> Self {
        Self {
            size,
            ring_width: ring_width(size),
            aa_band: aa_band(size),
        }
    }
}

pub fn ring_width(point_size: f32) -> f32 {
    (RING_WIDTH_SCALE / point_size).clamp(RING_WIDTH_MIN, RING_WIDTH_MAX)
}

pub fn aa_band(point_size: f32) -> f32 {
    AA_BAND_SCALE / point_size
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    if edge0 >= edge1 {
        return if x >= edge1 { 1.0 } else { 0.0 };
    }
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Coverage of a ring fragment at normalized distance `r` from the point
/// center (1.0 is the rim). Mirrors `fs_main` in the point shader.
pub fn ring_coverage(r: f32, style: PointStyle) -> f32 {
    if r > 1.0 {
        return 0.0;
    }
    let outer = 1.0 - smoothstep(1.0 - style.aa_band, 1.0, r);
    let inner_edge = 1.0 - style.ring_width;
    let inner = smoothstep(inner_edge - style.aa_band, inner_edge, r);
    outer * inner
}

/// Piecewise-linear (zoom, size) curve, clamped to a min/max size.
#[derive(Debug, Clone, PartialEq)]
pub struct SizeCurve {
    stops: Vec<[f64; 2]>,
    min: f32,
    max: f32,
}

impl SizeCurve {
    pub fn from_config(config: &PointConfig) -> Self {
        Self {
            stops: config.size_stops.clone(),
            min: config.min_size,
            max: config.max_size,
        }
    }

    pub fn size_at(&self, zoom: f64) -> f32 {
        let size = match self.stops.as_slice() {
            [] => self.min as f64,
            [only] => only[1],
            stops => {
                let first = stops[0];
                let last = stops[stops.len() - 1];
                if zoom <= first[0] {
                    first[1]
                } else if zoom >= last[0] {
                    last[1]
                } else {
                    stops
                        .windows(2)
                        .find(|pair| zoom >= pair[0][0] && zoom <= pair[1][0])
                        .map(|pair| {
                            let [z0, s0] = pair[0];
                            let [z1, s1] = pair[1];
                            let t = (zoom - z0) / (z1 - z0).max(f64::EPSILON);
                            s0 + (s1 - s0) * t
                        })
                        .unwrap_or(last[1])
                }
            }
        };
        (size as f32).clamp(self.min, self.max)
    }
}

/// The point cloud layer: owns the current buffer and palette and issues one
/// batched draw per frame.
#[derive(Debug)]
pub struct PointOverlay {
    buffer: Option<PointBuffer>,
    palette: Option<Palette>,
    curve: SizeCurve,
    visible: bool,
    buffer_uploaded: bool,
    palette_uploaded: bool,
}

impl PointOverlay {
    pub fn new(config: &PointConfig) -> Self {
        Self {
            buffer: None,
            palette: None,
            curve: SizeCurve::from_config(config),
            visible: true,
            buffer_uploaded: false,
            palette_uploaded: false,
        }
    }

    pub fn count(&self) -> usize {
        self.buffer.as_ref().map_or(0, PointBuffer::count)
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn style_at(&self, zoom: f64) -> PointStyle {
        PointStyle::for_size(self.curve.size_at(zoom))
    }

    pub fn set_buffer(&mut self, buffer: PointBuffer, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        debug!(count = buffer.count(), "replacing point buffer");
        self.buffer = Some(buffer);
        self.buffer_uploaded = false;
        self.sync(device)
    }

    pub fn set_palette(&mut self, palette: Palette, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        debug!(categories = palette.len(), "replacing point palette");
        self.palette = Some(palette);
        self.palette_uploaded = false;
        self.sync(device)
    }

    /// Forget device-side state; the next `sync` re-uploads everything.
    pub fn invalidate(&mut self) {
        self.buffer_uploaded = false;
        self.palette_uploaded = false;
    }

    pub fn sync(&mut self, device: &mut dyn GraphicsDevice) -> Result<(), DeviceError> {
        if !self.buffer_uploaded
            && let Some(buffer) = &self.buffer
        {
            device.upload_points(buffer)?;
            self.buffer_uploaded = true;
        }
        if !self.palette_uploaded
            && let Some(palette) = &self.palette
        {
            device.upload_palette(palette)?;
            self.palette_uploaded = true;
        }
        Ok(())
    }

    /// Issue the single batched draw. Returns the number of points submitted.
    pub fn draw(&self, zoom: f64, device: &mut dyn GraphicsDevice) -> usize {
        if !self.visible || !self.buffer_uploaded || !self.palette_uploaded {
            return 0;
        }
        let count = self.count();
        if count == 0 {
            return 0;
        }
        device.draw_points(count as u32, self.style_at(zoom));
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DrawCall, RecordingDevice};

    fn assert_close(actual: f32, expected: f32) {
        let diff = (actual - expected).abs();
        assert!(
            diff < 1e-5,
            "expected {expected}, got {actual} (diff: {diff})"
        );
    }

    #[test]
    fn buffer_rejects_mismatched_lengths() {
        assert!(matches!(
            PointBuffer::new(vec![0.0; 5], vec![0, 1, 2]),
            Err(PointDataError::PositionLength { count: 3, .. })
        ));
        assert!(matches!(
            PointBuffer::with_count(4, vec![0.0; 6], vec![0, 1, 2]),
            Err(PointDataError::IndexLength { count: 4, actual: 3 })
        ));
        let buffer = PointBuffer::with_count(2, vec![1.0, 2.0, 3.0, 4.0], vec![0, 1])
            .expect("valid buffer");
        assert_eq!(buffer.count(), 2);
    }

    #[test]
    fn palette_validation_and_hidden_categories() {
        assert_eq!(Palette::new(Vec::new()), Err(PointDataError::EmptyPalette));
        assert_eq!(
            Palette::new(vec![0; 6]),
            Err(PointDataError::RaggedPalette(6))
        );
        let palette = Palette::new(vec![255, 0, 0, 255, 0, 255, 0, 0]).expect("valid palette");
        assert_eq!(palette.len(), 2);
        assert!(!palette.is_hidden(0));
        assert!(palette.is_hidden(1));
        assert!(palette.is_hidden(7));
    }

    #[test]
    fn ring_width_is_clamped() {
        assert_close(ring_width(1.0), 0.62);
        assert_close(ring_width(10.0), 0.3);
        assert_close(ring_width(100.0), 0.12);
        assert_close(aa_band(6.0), 0.25);
    }

    #[test]
    fn ring_coverage_profile() {
        let style = PointStyle::for_size(20.0);
        // ring 0.15, aa 0.075: opaque band sits just inside the rim.
        assert_eq!(ring_coverage(1.2, style), 0.0);
        assert_eq!(ring_coverage(0.0, style), 0.0);
        assert_eq!(ring_coverage(0.5, style), 0.0);
        assert_close(ring_coverage(0.88, style), 1.0);
        let rim = ring_coverage(0.99, style);
        assert!(rim > 0.0 && rim < 1.0);
    }

    #[test]
    fn size_curve_interpolates_and_clamps() {
        let curve = SizeCurve::from_config(&PointConfig {
            size_stops: vec![[0.1, 2.0], [1.0, 8.0], [4.0, 40.0]],
            min_size: 3.0,
            max_size: 30.0,
        });
        assert_close(curve.size_at(0.01), 3.0);
        assert_close(curve.size_at(0.55), 5.0);
        assert_close(curve.size_at(1.0), 8.0);
        assert_close(curve.size_at(2.5), 24.0);
        assert_close(curve.size_at(100.0), 30.0);
    }

    #[test]
    fn overlay_draws_once_after_upload() {
        let mut device = RecordingDevice::default();
        let mut overlay = PointOverlay::new(&PointConfig::default());
        assert_eq!(overlay.draw(1.0, &mut device), 0);

        let buffer = PointBuffer::new(vec![0.0; 200], vec![0; 100]).expect("valid buffer");
        overlay.set_buffer(buffer, &mut device).expect("upload");
        assert_eq!(overlay.draw(1.0, &mut device), 0, "palette still missing");

        let palette = Palette::new(vec![10, 20, 30, 255]).expect("valid palette");
        overlay.set_palette(palette, &mut device).expect("upload");
        assert_eq!(overlay.draw(1.0, &mut device), 100);
        let point_draws: Vec<_> = device
            .calls
            .iter()
            .filter(|call| matches!(call, DrawCall::Points { .. }))
            .collect();
        assert_eq!(point_draws.len(), 1);

        overlay.set_visible(false);
        assert_eq!(overlay.draw(1.0, &mut device), 0);
    }

    #[test]
    fn overlay_reuploads_after_invalidate() {
        let mut device = RecordingDevice::default();
        let mut overlay = PointOverlay::new(&PointConfig::default());
        overlay
            .set_buffer(
                PointBuffer::new(vec![0.0; 2], vec![0]).expect("valid buffer"),
                &mut device,
            )
            .expect("upload");
        overlay
            .set_palette(Palette::new(vec![0, 0, 0, 255]).expect("valid"), &mut device)
            .expect("upload");
        assert_eq!(device.point_uploads, 1);
        overlay.invalidate();
        overlay.sync(&mut device).expect("sync");
        assert_eq!(device.point_uploads, 2);
        assert_eq!(device.palette_uploads, 2);
    }
}
