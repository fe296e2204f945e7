//! Render-and-fetch core for gigapixel slide viewing.
//!
//! The engine decides which pyramid tiles the current view needs, schedules
//! their fetches, keeps decoded tiles in a bounded texture cache, composites
//! coarser tiers under missing imagery and draws a point overlay on top. All
//! I/O and GPU work goes through the [`FrameHost`] and [`GraphicsDevice`]
//! seams.

pub mod cache;
pub mod compositor;
pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod points;
pub mod scheduler;
pub mod tiles;
pub mod viewport;

#[cfg(test)]
mod testing;

pub use cache::{CacheEntry, TileCache};
pub use compositor::CompositeStats;
pub use config::{PointConfig, RendererConfig, SchedulerConfig};
pub use device::{GraphicsDevice, TextureHandle, TileImage};
pub use error::{ConfigError, DeviceError, FetchError, PointDataError, RendererError, SourceError};
pub use frame::{FrameHost, FramePacer, FrameStats, Renderer};
pub use points::{Palette, PointBuffer, PointStyle};
pub use scheduler::{FetchRequest, FetchScheduler, FetchTicket, SchedulerSnapshot, TileFailure};
pub use tiles::{ImageSource, ImageSourceDescriptor, ScheduledTile, TileKey, TileUrlTemplate};
pub use viewport::{Projection, Rect, ViewState, ViewUpdate, Viewport, ZoomLimits};
