use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::TileCache;
use crate::compositor::{CompositeStats, composite, missing_tiles};
use crate::config::RendererConfig;
use crate::device::{GraphicsDevice, TileImage};
use crate::error::{DeviceError, FetchError, RendererError};
use crate::points::{Palette, PointBuffer, PointOverlay};
use crate::scheduler::{
    FetchRequest, FetchScheduler, FetchTicket, SchedulerEffect, SchedulerSnapshot, TileFailure,
};
use crate::tiles::{ImageSource, VisibleSet, visible_tiles};
use crate::viewport::{ViewState, ViewUpdate, Viewport, ZoomLimits};

/// Everything the renderer needs from its embedding.
///
/// Calls are made synchronously from inside renderer operations; an
/// implementation must not call back into the renderer from them.
pub trait FrameHost {
    fn start_fetch(&mut self, request: FetchRequest);
    fn cancel_fetch(&mut self, ticket: FetchTicket);
    /// Call `Renderer::poll` at `deadline_ms`, replacing any earlier timer.
    fn wake_at(&mut self, deadline_ms: f64);
    /// Call `Renderer::tick` on the next animation frame.
    fn request_frame(&mut self);

    fn on_stats(&mut self, _stats: &FrameStats) {}
    fn on_scheduler(&mut self, _snapshot: &SchedulerSnapshot) {}
    fn on_tile_error(&mut self, _failure: &TileFailure) {}
    fn on_view_change(&mut self, _view: &ViewState) {}
    fn on_context_lost(&mut self) {}
}

/// Coalesces frame requests: at most one is outstanding at a time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FramePacer {
    scheduled: bool,
}

impl FramePacer {
    /// Returns `true` if the host must be asked for a frame, `false` if one
    /// is already pending.
    pub fn request(&mut self) -> bool {
        !std::mem::replace(&mut self.scheduled, true)
    }

    /// The pending frame is being rendered now.
    pub fn begin(&mut self) {
        self.scheduled = false;
    }
}

/// Per-frame statistics reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub frame: u64,
    pub tier: u8,
    pub visible: usize,
    pub rendered: usize,
    pub fallback: usize,
    pub cache: usize,
    pub inflight: usize,
    pub queued: usize,
    pub retries: u64,
    pub failed: u64,
    pub aborted: u64,
    pub points: usize,
}

#[derive(Debug, Default)]
struct FpsCounter {
    frames: u32,
    window_start: Option<f64>,
}

impl FpsCounter {
    fn frame(&mut self, now: f64, interval_ms: f64) -> Option<f64> {
        self.frames += 1;
        let start = *self.window_start.get_or_insert(now);
        let elapsed = now - start;
        if elapsed < interval_ms || elapsed <= 0.0 {
            return None;
        }
        let fps = self.frames as f64 * 1000.0 / elapsed;
        self.frames = 0;
        self.window_start = Some(now);
        Some(fps)
    }
}

/// The per-frame pipeline: visible set, fetch scheduling, fallback
/// compositing, point overlay and statistics.
pub struct Renderer {
    config: RendererConfig,
    source: ImageSource,
    viewport: Viewport,
    limits: ZoomLimits,
    scheduler: FetchScheduler,
    cache: TileCache,
    points: PointOverlay,
    pacer: FramePacer,
    wanted: VisibleSet,
    /// The view moved since `wanted` was last derived.
    view_moved: bool,
    frame: u64,
    auth_token: Option<String>,
    context_lost: bool,
    destroyed: bool,
    fps: FpsCounter,
}

impl Renderer {
    pub fn new(
        source: ImageSource,
        config: RendererConfig,
        width: f64,
        height: f64,
    ) -> Result<Self, RendererError> {
        Self::with_rng(source, config, width, height, SmallRng::from_entropy())
    }

    /// Like [`Renderer::new`] with a caller-supplied jitter source.
    pub fn with_rng(
        source: ImageSource,
        config: RendererConfig,
        width: f64,
        height: f64,
        rng: SmallRng,
    ) -> Result<Self, RendererError> {
        config.validate()?;
        let mut renderer = Self {
            scheduler: FetchScheduler::with_rng(config.scheduler.clone(), rng),
            cache: TileCache::new(config.max_cache_tiles),
            points: PointOverlay::new(&config.points),
            viewport: Viewport::new(width, height),
            limits: ZoomLimits { min: 1.0, max: 1.0 },
            pacer: FramePacer::default(),
            wanted: VisibleSet::default(),
            view_moved: false,
            frame: 0,
            auth_token: None,
            context_lost: false,
            destroyed: false,
            fps: FpsCounter::default(),
            source,
            config,
        };
        renderer.update_limits();
        renderer.fit_to_image();
        Ok(renderer)
    }

    pub fn view(&self) -> ViewState {
        self.viewport.state()
    }

    pub fn zoom_limits(&self) -> ZoomLimits {
        self.limits
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    pub fn scheduler(&self) -> &FetchScheduler {
        &self.scheduler
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    pub fn is_context_lost(&self) -> bool {
        self.context_lost
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn set_auth_token(&mut self, token: Option<String>) {
        self.auth_token = token.filter(|t| !t.is_empty());
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn request_frame(&mut self, host: &mut dyn FrameHost) {
        if self.destroyed {
            return;
        }
        if self.pacer.request() {
            host.request_frame();
        }
    }

    /// Render one frame. Returns `None` when nothing could be drawn.
    pub fn tick(
        &mut self,
        now: f64,
        device: &mut dyn GraphicsDevice,
        host: &mut dyn FrameHost,
    ) -> Option<FrameStats> {
        self.pacer.begin();
        if self.destroyed || self.context_lost {
            return None;
        }
        self.frame += 1;
        self.reschedule(now, host);

        let (composited, points) = match self.draw(device) {
            Ok(drawn) => drawn,
            Err(err) => {
                self.device_error(err, host);
                return None;
            }
        };
        let scheduler = self.scheduler.snapshot();
        let stats = FrameStats {
            frame: self.frame,
            tier: self.wanted.tier,
            visible: self.wanted.len(),
            rendered: composited.rendered,
            fallback: composited.fallback,
            cache: self.cache.len(),
            inflight: scheduler.inflight,
            queued: scheduler.queued,
            retries: scheduler.retries,
            failed: scheduler.failed,
            aborted: scheduler.aborted,
            points,
        };
        host.on_stats(&stats);

        if let Some(fps) = self.fps.frame(now, self.config.fps_log_interval_ms) {
            debug!(
                fps = format_args!("{fps:.1}"),
                tier = stats.tier,
                rendered = stats.rendered,
                fallback = stats.fallback,
                cache = stats.cache,
                points = stats.points,
                "frame rate"
            );
        }
        Some(stats)
    }

    /// Tiles are fully composited before the point overlay.
    fn draw(&mut self, device: &mut dyn GraphicsDevice) -> Result<(CompositeStats, usize), DeviceError> {
        self.points.sync(device)?;
        device.begin_frame(&self.viewport.projection(), self.config.clear_color)?;
        let view = self.viewport.visible_world_rect();
        let composited = composite(&mut self.cache, &view, &self.wanted, self.frame, device);
        let points = self.points.draw(self.viewport.zoom, device);
        device.end_frame()?;
        Ok((composited, points))
    }

    /// Timer wake-up for delayed retries.
    pub fn poll(&mut self, now: f64, host: &mut dyn FrameHost) {
        if self.destroyed {
            return;
        }
        self.scheduler.poll(now);
        self.dispatch(host);
    }

    /// A fetch delivered a decoded image. Stale results are dropped before
    /// any texture is created. A rejected upload goes through the same
    /// retry path as a failed fetch; only a lost device skips it.
    pub fn fetch_succeeded(
        &mut self,
        ticket: FetchTicket,
        image: TileImage,
        now: f64,
        device: &mut dyn GraphicsDevice,
        host: &mut dyn FrameHost,
    ) {
        if self.destroyed {
            return;
        }
        if self.view_moved && !self.context_lost {
            self.reschedule(now, host);
        }
        let live = self.scheduler.live_tile(ticket).map(|tile| tile.bounds);
        let Some(bounds) = live.filter(|_| !self.context_lost) else {
            self.scheduler.complete(ticket, now);
            self.dispatch(host);
            return;
        };
        match self
            .cache
            .insert(ticket.key, &image, bounds, self.frame, device)
        {
            Ok(_) => {
                self.scheduler.complete(ticket, now);
                self.dispatch(host);
                self.request_frame(host);
            }
            Err(DeviceError::Lost) => self.context_lost(host),
            Err(err) => {
                self.scheduler
                    .fail(ticket, FetchError::Upload(err.to_string()), now);
                self.dispatch(host);
            }
        }
    }

    pub fn fetch_failed(
        &mut self,
        ticket: FetchTicket,
        error: FetchError,
        now: f64,
        host: &mut dyn FrameHost,
    ) {
        if self.destroyed {
            return;
        }
        self.scheduler.fail(ticket, error, now);
        self.dispatch(host);
    }

    pub fn set_view(&mut self, update: ViewUpdate, host: &mut dyn FrameHost) -> ViewState {
        self.viewport.apply(update, self.limits);
        self.view_changed(host)
    }

    pub fn zoom_at(
        &mut self,
        factor: f64,
        screen_x: f64,
        screen_y: f64,
        host: &mut dyn FrameHost,
    ) -> ViewState {
        self.viewport.zoom_at(factor, screen_x, screen_y, self.limits);
        self.view_changed(host)
    }

    pub fn pan_by(&mut self, dx: f64, dy: f64, host: &mut dyn FrameHost) -> ViewState {
        self.viewport.pan_by(dx, dy);
        self.view_changed(host)
    }

    /// New canvas size in CSS pixels. Zoom limits follow the new fit zoom.
    pub fn resize(
        &mut self,
        width: f64,
        height: f64,
        dpr: f64,
        host: &mut dyn FrameHost,
    ) -> ViewState {
        self.viewport.resize(width, height, dpr);
        self.update_limits();
        self.viewport.zoom = self.limits.clamp(self.viewport.zoom);
        self.view_changed(host)
    }

    /// Switch to another image. Starts a new fetch generation, releases
    /// every cached texture and fits the new image to the screen.
    pub fn set_image_source(
        &mut self,
        source: ImageSource,
        device: &mut dyn GraphicsDevice,
        host: &mut dyn FrameHost,
    ) -> Result<ViewState, RendererError> {
        self.ensure_alive()?;
        info!(
            width = source.width(),
            height = source.height(),
            max_tier = source.max_tier(),
            "switching image source"
        );
        self.scheduler.reset();
        self.dispatch(host);
        self.cache.clear(device);
        self.wanted = VisibleSet::default();
        self.source = source;
        self.update_limits();
        self.fit_to_image();
        Ok(self.view_changed(host))
    }

    pub fn set_points(
        &mut self,
        buffer: PointBuffer,
        device: &mut dyn GraphicsDevice,
        host: &mut dyn FrameHost,
    ) -> Result<(), RendererError> {
        self.ensure_alive()?;
        let result = self.points.set_buffer(buffer, device);
        self.after_upload(result, host)
    }

    pub fn set_palette(
        &mut self,
        palette: Palette,
        device: &mut dyn GraphicsDevice,
        host: &mut dyn FrameHost,
    ) -> Result<(), RendererError> {
        self.ensure_alive()?;
        let result = self.points.set_palette(palette, device);
        self.after_upload(result, host)
    }

    pub fn set_points_visible(&mut self, visible: bool, host: &mut dyn FrameHost) {
        if self.points.is_visible() != visible {
            self.points.set_visible(visible);
            self.request_frame(host);
        }
    }

    /// The graphics context is gone. Every texture handle is already dead,
    /// so the cache is forgotten rather than released.
    pub fn context_lost(&mut self, host: &mut dyn FrameHost) {
        if self.context_lost || self.destroyed {
            return;
        }
        self.context_lost = true;
        let forgotten = self.cache.invalidate();
        self.points.invalidate();
        self.scheduler.reset();
        self.dispatch(host);
        info!(forgotten, "graphics context lost");
        host.on_context_lost();
    }

    /// A fresh device is ready; tiles are refetched and points re-uploaded
    /// on the next frame.
    pub fn context_restored(&mut self, host: &mut dyn FrameHost) {
        if !self.context_lost || self.destroyed {
            return;
        }
        info!("graphics context restored");
        self.context_lost = false;
        self.request_frame(host);
    }

    /// Cancel all fetches and release every GPU resource. Later updates are
    /// rejected; frames and fetch results are ignored.
    pub fn destroy(&mut self, device: &mut dyn GraphicsDevice, host: &mut dyn FrameHost) {
        if self.destroyed {
            return;
        }
        self.scheduler.reset();
        self.dispatch(host);
        if !self.context_lost {
            self.cache.clear(device);
        } else {
            self.cache.invalidate();
        }
        self.destroyed = true;
        info!("renderer destroyed");
    }

    fn ensure_alive(&self) -> Result<(), RendererError> {
        if self.destroyed {
            Err(RendererError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn after_upload(
        &mut self,
        result: Result<(), DeviceError>,
        host: &mut dyn FrameHost,
    ) -> Result<(), RendererError> {
        match result {
            Ok(()) => {
                self.request_frame(host);
                Ok(())
            }
            Err(err) => {
                self.device_error(err.clone(), host);
                Err(err.into())
            }
        }
    }

    fn device_error(&mut self, err: DeviceError, host: &mut dyn FrameHost) {
        match err {
            DeviceError::Lost => self.context_lost(host),
            other => warn!(error = %other, "graphics device error"),
        }
    }

    fn dispatch(&mut self, host: &mut dyn FrameHost) {
        for effect in self.scheduler.drain_effects() {
            match effect {
                SchedulerEffect::Start(mut request) => {
                    request.auth_token.clone_from(&self.auth_token);
                    host.start_fetch(request);
                }
                SchedulerEffect::Cancel(ticket) => host.cancel_fetch(ticket),
                SchedulerEffect::WakeAt(deadline) => host.wake_at(deadline),
                SchedulerEffect::Failed(failure) => host.on_tile_error(&failure),
                SchedulerEffect::Snapshot(snapshot) => host.on_scheduler(&snapshot),
            }
        }
    }

    /// Derive the wanted set from the current view and hand the tiles still
    /// missing from the cache to the scheduler.
    fn reschedule(&mut self, now: f64, host: &mut dyn FrameHost) {
        self.view_moved = false;
        self.wanted = visible_tiles(&self.viewport, &self.source);
        let missing = missing_tiles(&self.cache, &self.wanted);
        self.scheduler.schedule(&missing, now);
        self.dispatch(host);
    }

    fn view_changed(&mut self, host: &mut dyn FrameHost) -> ViewState {
        self.viewport.clamp_to_image(
            self.source.width() as f64,
            self.source.height() as f64,
            self.config.overscroll_margin,
        );
        let state = self.viewport.state();
        self.view_moved = true;
        if !self.destroyed {
            host.on_view_change(&state);
            self.request_frame(host);
        }
        state
    }

    fn update_limits(&mut self) {
        let fit = self
            .viewport
            .fit_zoom(self.source.width() as f64, self.source.height() as f64);
        self.limits = ZoomLimits::derive(fit, self.config.min_fit_factor, self.config.max_native_zoom);
    }

    fn fit_to_image(&mut self) {
        self.viewport.fit(
            self.source.width() as f64,
            self.source.height() as f64,
            self.limits,
        );
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("source", &self.source)
            .field("view", &self.viewport.state())
            .field("frame", &self.frame)
            .field("cache", &self.cache.len())
            .field("scheduler", &self.scheduler.snapshot())
            .field("context_lost", &self.context_lost)
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}
