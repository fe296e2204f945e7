use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in world space (full-resolution image pixels).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    pub fn right(&self) -> f64 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.h
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w * 0.5, self.y + self.h * 0.5)
    }

    pub fn is_empty(&self) -> bool {
        !(self.w > 0.0 && self.h > 0.0)
    }

    /// Strict overlap: rectangles that only share an edge do not intersect.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        (x2 > x1 && y2 > y1).then(|| Rect::new(x1, y1, x2 - x1, y2 - y1))
    }
}

/// Resolved camera state reported back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewState {
    pub zoom: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

/// Partial view update from the host; absent fields keep their value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ViewUpdate {
    pub zoom: Option<f64>,
    pub offset_x: Option<f64>,
    pub offset_y: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomLimits {
    pub min: f64,
    pub max: f64,
}

impl ZoomLimits {
    /// `min = fit * min_fit_factor`, `max = max(max_native_zoom, min)`.
    pub fn derive(fit_zoom: f64, min_fit_factor: f64, max_native_zoom: f64) -> Self {
        let min = (fit_zoom * min_fit_factor).max(f64::MIN_POSITIVE);
        Self {
            min,
            max: max_native_zoom.max(min),
        }
    }

    pub fn clamp(&self, zoom: f64) -> f64 {
        if zoom.is_nan() {
            return self.min;
        }
        zoom.clamp(self.min, self.max)
    }
}

/// Column-major 3x3 matrix mapping world coordinates to clip space.
pub type Projection = [[f32; 3]; 3];

/// Camera over the image plane.
///
/// `offset_x`/`offset_y` are the world coordinates of the top-left corner of
/// the visible rectangle; `zoom` is screen (CSS) pixels per world pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct Viewport {
    pub zoom: f64,
    pub offset_x: f64,
    pub offset_y: f64,
    pub width: f64,
    pub height: f64,
    pub dpr: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
            width: 1.0,
            height: 1.0,
            dpr: 1.0,
        }
    }
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width: width.max(1.0),
            height: height.max(1.0),
            ..Self::default()
        }
    }

    pub fn state(&self) -> ViewState {
        ViewState {
            zoom: self.zoom,
            offset_x: self.offset_x,
            offset_y: self.offset_y,
        }
    }

    /// Convert world coordinates to screen coordinates.
    pub fn world_to_screen(&self, wx: f64, wy: f64) -> (f64, f64) {
        (
            (wx - self.offset_x) * self.zoom,
            (wy - self.offset_y) * self.zoom,
        )
    }

    /// Convert screen coordinates to world coordinates.
    pub fn screen_to_world(&self, sx: f64, sy: f64) -> (f64, f64) {
        (
            sx / self.zoom + self.offset_x,
            sy / self.zoom + self.offset_y,
        )
    }

    pub fn visible_world_rect(&self) -> Rect {
        Rect::new(
            self.offset_x,
            self.offset_y,
            self.width / self.zoom,
            self.height / self.zoom,
        )
    }

    pub fn projection(&self) -> Projection {
        let sx = 2.0 * self.zoom / self.width;
        let sy = 2.0 * self.zoom / self.height;
        let tx = -self.offset_x * sx - 1.0;
        let ty = self.offset_y * sy + 1.0;
        [
            [sx as f32, 0.0, 0.0],
            [0.0, -sy as f32, 0.0],
            [tx as f32, ty as f32, 1.0],
        ]
    }

    /// Smallest zoom at which the whole image fits the screen.
    pub fn fit_zoom(&self, image_w: f64, image_h: f64) -> f64 {
        if image_w <= 0.0 || image_h <= 0.0 {
            return 1.0;
        }
        (self.width / image_w).min(self.height / image_h)
    }

    pub fn resize(&mut self, width: f64, height: f64, dpr: f64) {
        if !(width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0) {
            return;
        }
        // Keep the world point at the screen center fixed.
        let (cx, cy) = self.screen_to_world(self.width * 0.5, self.height * 0.5);
        self.width = width;
        self.height = height;
        self.dpr = if dpr.is_finite() && dpr > 0.0 { dpr } else { 1.0 };
        self.offset_x = cx - width * 0.5 / self.zoom;
        self.offset_y = cy - height * 0.5 / self.zoom;
    }

    /// Zoom by `factor` toward a focus point (screen coordinates).
    pub fn zoom_at(&mut self, factor: f64, screen_x: f64, screen_y: f64, limits: ZoomLimits) {
        if !(factor.is_finite() && factor > 0.0 && screen_x.is_finite() && screen_y.is_finite()) {
            return;
        }
        let (wx, wy) = self.screen_to_world(screen_x, screen_y);
        self.zoom = limits.clamp(self.zoom * factor);
        // Adjust offset so the point under the cursor stays fixed
        self.offset_x = wx - screen_x / self.zoom;
        self.offset_y = wy - screen_y / self.zoom;
    }

    /// Pan by screen-space delta (dragging right moves the image right).
    pub fn pan_by(&mut self, dx: f64, dy: f64) {
        if !(dx.is_finite() && dy.is_finite()) {
            return;
        }
        self.offset_x -= dx / self.zoom;
        self.offset_y -= dy / self.zoom;
    }

    /// Fit the whole image to the screen and center it.
    pub fn fit(&mut self, image_w: f64, image_h: f64, limits: ZoomLimits) {
        self.zoom = limits.clamp(self.fit_zoom(image_w, image_h));
        let visible = self.visible_world_rect();
        self.offset_x = (image_w - visible.w) * 0.5;
        self.offset_y = (image_h - visible.h) * 0.5;
    }

    pub fn apply(&mut self, update: ViewUpdate, limits: ZoomLimits) {
        if let Some(zoom) = update.zoom.filter(|z| z.is_finite() && *z > 0.0) {
            self.zoom = zoom;
        }
        if let Some(x) = update.offset_x.filter(|x| x.is_finite()) {
            self.offset_x = x;
        }
        if let Some(y) = update.offset_y.filter(|y| y.is_finite()) {
            self.offset_y = y;
        }
        self.zoom = limits.clamp(self.zoom);
    }

    /// Keep the visible rectangle inside the image plus `margin` (a fraction
    /// of the viewport extent) on each axis.
    pub fn clamp_to_image(&mut self, image_w: f64, image_h: f64, margin: f64) {
        let visible = self.visible_world_rect();
        self.offset_x = clamp_axis(self.offset_x, visible.w, image_w, visible.w * margin);
        self.offset_y = clamp_axis(self.offset_y, visible.h, image_h, visible.h * margin);
    }
}

fn clamp_axis(offset: f64, visible: f64, extent: f64, margin: f64) -> f64 {
    let min = -margin;
    let max = extent + margin - visible;
    if max < min || !offset.is_finite() {
        (extent - visible) * 0.5
    } else {
        offset.clamp(min, max)
    }
}

/// `clamp(floor(max_tier + log2(zoom)), 0, max_tier)`.
pub fn tier_for_zoom(zoom: f64, max_tier: u8) -> u8 {
    if !(zoom > 0.0) {
        return 0;
    }
    let tier = (max_tier as f64 + zoom.log2()).floor();
    tier.clamp(0.0, max_tier as f64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ZoomLimits {
        ZoomLimits {
            min: 0.01,
            max: 8.0,
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        let diff = (actual - expected).abs();
        assert!(
            diff < 1e-9,
            "expected {expected}, got {actual} (diff: {diff})"
        );
    }

    #[test]
    fn tier_formula_examples() {
        assert_eq!(tier_for_zoom(1.0, 10), 10);
        assert_eq!(tier_for_zoom(0.5, 10), 9);
        assert_eq!(tier_for_zoom(32.0, 10), 10);
        assert_eq!(tier_for_zoom(0.75, 10), 9);
        assert_eq!(tier_for_zoom(1.0 / 4096.0, 10), 0);
        assert_eq!(tier_for_zoom(0.0, 10), 0);
    }

    #[test]
    fn screen_world_roundtrip() {
        let vp = Viewport {
            zoom: 0.25,
            offset_x: 1000.0,
            offset_y: -200.0,
            ..Viewport::new(800.0, 600.0)
        };
        let (wx, wy) = vp.screen_to_world(123.0, 456.0);
        let (sx, sy) = vp.world_to_screen(wx, wy);
        assert_close(sx, 123.0);
        assert_close(sy, 456.0);
    }

    #[test]
    fn projection_maps_visible_corners_to_clip_corners() {
        let vp = Viewport {
            zoom: 0.5,
            offset_x: 100.0,
            offset_y: 50.0,
            ..Viewport::new(400.0, 200.0)
        };
        let m = vp.projection();
        let project = |x: f64, y: f64| {
            let cx = m[0][0] as f64 * x + m[1][0] as f64 * y + m[2][0] as f64;
            let cy = m[0][1] as f64 * x + m[1][1] as f64 * y + m[2][1] as f64;
            (cx, cy)
        };
        let visible = vp.visible_world_rect();
        let (l, t) = project(visible.x, visible.y);
        let (r, b) = project(visible.right(), visible.bottom());
        assert!((l + 1.0).abs() < 1e-5 && (t - 1.0).abs() < 1e-5);
        assert!((r - 1.0).abs() < 1e-5 && (b + 1.0).abs() < 1e-5);
    }

    #[test]
    fn zoom_at_keeps_focus_point_fixed() {
        let mut vp = Viewport::new(800.0, 600.0);
        vp.zoom = 0.5;
        let before = vp.screen_to_world(200.0, 150.0);
        vp.zoom_at(2.0, 200.0, 150.0, limits());
        let after = vp.screen_to_world(200.0, 150.0);
        assert_close(vp.zoom, 1.0);
        assert_close(before.0, after.0);
        assert_close(before.1, after.1);
    }

    #[test]
    fn zoom_is_clamped_to_limits() {
        let mut vp = Viewport::new(800.0, 600.0);
        vp.zoom_at(1e6, 0.0, 0.0, limits());
        assert_close(vp.zoom, 8.0);
        vp.apply(
            ViewUpdate {
                zoom: Some(1e-9),
                ..ViewUpdate::default()
            },
            limits(),
        );
        assert_close(vp.zoom, 0.01);
    }

    #[test]
    fn pan_is_clamped_with_margin() {
        let mut vp = Viewport::new(100.0, 100.0);
        vp.zoom = 1.0;
        vp.offset_x = -500.0;
        vp.offset_y = 5_000.0;
        vp.clamp_to_image(1_000.0, 1_000.0, 0.2);
        assert_close(vp.offset_x, -20.0);
        assert_close(vp.offset_y, 920.0);
    }

    #[test]
    fn oversized_viewport_centers_image() {
        let mut vp = Viewport::new(1_000.0, 1_000.0);
        vp.zoom = 1.0;
        vp.offset_x = 300.0;
        vp.clamp_to_image(200.0, 2_000.0, 0.2);
        assert_close(vp.offset_x, -400.0);
    }

    #[test]
    fn non_finite_inputs_are_ignored() {
        let mut vp = Viewport::new(800.0, 600.0);
        vp.zoom = 0.5;
        vp.offset_x = 100.0;
        vp.offset_y = 200.0;
        let before = vp.clone();

        vp.zoom_at(1.5, f64::NAN, 10.0, limits());
        vp.zoom_at(f64::INFINITY, 10.0, 10.0, limits());
        vp.pan_by(f64::NAN, 5.0);
        vp.resize(f64::NAN, 600.0, 1.0);
        vp.resize(800.0, f64::INFINITY, 1.0);
        vp.apply(
            ViewUpdate {
                zoom: Some(f64::NAN),
                offset_x: Some(f64::NAN),
                offset_y: None,
            },
            limits(),
        );
        assert_eq!(vp, before);
    }

    #[test]
    fn non_finite_offset_is_recentered() {
        let mut vp = Viewport::new(1_000.0, 1_000.0);
        vp.zoom = 1.0;
        vp.offset_x = f64::NAN;
        vp.offset_y = 10.0;
        vp.clamp_to_image(4_000.0, 4_000.0, 0.2);
        assert_close(vp.offset_x, 1_500.0);
        assert_close(vp.offset_y, 10.0);
    }

    #[test]
    fn fit_centers_image() {
        let mut vp = Viewport::new(800.0, 400.0);
        vp.fit(4_000.0, 4_000.0, limits());
        assert_close(vp.zoom, 0.1);
        let visible = vp.visible_world_rect();
        assert_close(visible.center().0, 2_000.0);
        assert_close(visible.center().1, 2_000.0);
    }

    #[test]
    fn zoom_limits_follow_fit_policy() {
        let limits = ZoomLimits::derive(0.01, 0.5, 4.0);
        assert_close(limits.min, 0.005);
        assert_close(limits.max, 4.0);
        let tiny_image = ZoomLimits::derive(20.0, 0.5, 4.0);
        assert_close(tiny_image.max, 10.0);
    }

    #[test]
    fn resize_keeps_center() {
        let mut vp = Viewport::new(800.0, 600.0);
        vp.zoom = 2.0;
        let center = vp.visible_world_rect().center();
        vp.resize(400.0, 300.0, 2.0);
        let after = vp.visible_world_rect().center();
        assert_close(center.0, after.0);
        assert_close(center.1, after.1);
        assert_close(vp.dpr, 2.0);
    }

    #[test]
    fn rect_intersection_excludes_shared_edges() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(10.0, 0.0, 10.0, 10.0);
        assert!(!a.intersects(&b));
        assert!(a.intersection(&b).is_none());
        let c = Rect::new(5.0, 5.0, 10.0, 10.0);
        assert_eq!(a.intersection(&c), Some(Rect::new(5.0, 5.0, 5.0, 5.0)));
    }
}
