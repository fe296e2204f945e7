use std::rc::Rc;

use crate::device::{GraphicsDevice, TextureHandle, TileImage};
use crate::error::DeviceError;
use crate::frame::{FrameHost, FrameStats};
use crate::points::{Palette, PointBuffer, PointStyle};
use crate::scheduler::{FetchRequest, FetchTicket, SchedulerSnapshot, TileFailure};
use crate::tiles::{ImageSource, TileUrlTemplate};
use crate::viewport::{Projection, Rect, ViewState};

#[derive(Debug, Clone, PartialEq)]
pub enum DrawCall {
    Begin { projection: Projection, clear: [f32; 4] },
    Tile { texture: u64, bounds: Rect },
    Points { count: u32, style: PointStyle },
    End,
}

/// Records every call; `lost` makes every fallible call fail as a lost
/// context would, `reject_textures` refuses texture uploads only.
#[derive(Debug, Default)]
pub struct RecordingDevice {
    pub calls: Vec<DrawCall>,
    pub created: Vec<u64>,
    pub destroyed: Vec<u64>,
    pub point_uploads: usize,
    pub palette_uploads: usize,
    pub lost: bool,
    pub reject_textures: bool,
    pub(crate) next_id: u64,
}

impl RecordingDevice {
    pub fn live_textures(&self) -> usize {
        self.created.len() - self.destroyed.len()
    }

    fn check(&self) -> Result<(), DeviceError> {
        if self.lost { Err(DeviceError::Lost) } else { Ok(()) }
    }
}

impl GraphicsDevice for RecordingDevice {
    fn create_texture(&mut self, _image: &TileImage) -> Result<TextureHandle, DeviceError> {
        self.check()?;
        if self.reject_textures {
            return Err(DeviceError::InvalidImage("texture rejected".to_string()));
        }
        self.next_id += 1;
        self.created.push(self.next_id);
        Ok(TextureHandle::new(self.next_id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.destroyed.push(texture.id());
    }

    fn upload_points(&mut self, _points: &PointBuffer) -> Result<(), DeviceError> {
        self.check()?;
        self.point_uploads += 1;
        Ok(())
    }

    fn upload_palette(&mut self, _palette: &Palette) -> Result<(), DeviceError> {
        self.check()?;
        self.palette_uploads += 1;
        Ok(())
    }

    fn begin_frame(&mut self, projection: &Projection, clear: [f32; 4]) -> Result<(), DeviceError> {
        self.check()?;
        self.calls.push(DrawCall::Begin {
            projection: *projection,
            clear,
        });
        Ok(())
    }

    fn draw_tile(&mut self, texture: &TextureHandle, bounds: Rect) {
        self.calls.push(DrawCall::Tile {
            texture: texture.id(),
            bounds,
        });
    }

    fn draw_points(&mut self, count: u32, style: PointStyle) {
        self.calls.push(DrawCall::Points { count, style });
    }

    fn end_frame(&mut self) -> Result<(), DeviceError> {
        self.check()?;
        self.calls.push(DrawCall::End);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingHost {
    pub started: Vec<FetchRequest>,
    pub cancelled: Vec<FetchTicket>,
    pub wakes: Vec<f64>,
    pub frame_requests: usize,
    pub stats: Vec<FrameStats>,
    pub snapshots: Vec<SchedulerSnapshot>,
    pub tile_errors: Vec<TileFailure>,
    pub views: Vec<ViewState>,
    pub context_lost: usize,
}

impl FrameHost for RecordingHost {
    fn start_fetch(&mut self, request: FetchRequest) {
        self.started.push(request);
    }

    fn cancel_fetch(&mut self, ticket: FetchTicket) {
        self.cancelled.push(ticket);
    }

    fn wake_at(&mut self, deadline_ms: f64) {
        self.wakes.push(deadline_ms);
    }

    fn request_frame(&mut self) {
        self.frame_requests += 1;
    }

    fn on_stats(&mut self, stats: &FrameStats) {
        self.stats.push(*stats);
    }

    fn on_scheduler(&mut self, snapshot: &SchedulerSnapshot) {
        self.snapshots.push(*snapshot);
    }

    fn on_tile_error(&mut self, failure: &TileFailure) {
        self.tile_errors.push(failure.clone());
    }

    fn on_view_change(&mut self, view: &ViewState) {
        self.views.push(*view);
    }

    fn on_context_lost(&mut self) {
        self.context_lost += 1;
    }
}

pub fn tile_image() -> TileImage {
    TileImage::new(2, 2, vec![200; 16]).expect("2x2 rgba image")
}

/// 10000x6000 pyramid, 256px tiles, finest tier 10.
pub fn test_source() -> ImageSource {
    let template = TileUrlTemplate {
        base_url: "https://tiles.example/".to_string(),
        image_path: "slide".to_string(),
        extension: "jpg".to_string(),
    };
    ImageSource::new(10_000, 6_000, 256, 10, Rc::new(move |key| template.url(key)))
        .expect("valid test source")
}
