use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_MAX_CONCURRENCY: usize = 6;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BASE_DELAY_MS: f64 = 120.0;
pub const DEFAULT_RETRY_MAX_DELAY_MS: f64 = 2_000.0;
pub const DEFAULT_JITTER_MIN: f64 = 0.85;
pub const DEFAULT_JITTER_MAX: f64 = 1.15;
pub const DEFAULT_MAX_CACHE_TILES: usize = 320;
pub const DEFAULT_OVERSCROLL_MARGIN: f64 = 0.2;
pub const DEFAULT_MIN_FIT_FACTOR: f64 = 0.5;
pub const DEFAULT_MAX_NATIVE_ZOOM: f64 = 4.0;
pub const DEFAULT_POINT_SIZE_MIN: f32 = 1.5;
pub const DEFAULT_POINT_SIZE_MAX: f32 = 28.0;
pub const DEFAULT_FPS_LOG_INTERVAL_MS: f64 = 2_000.0;
pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.047, 0.055, 0.090, 1.0];

/// (zoom, point size in CSS px) control points, sorted by zoom.
pub const DEFAULT_POINT_SIZE_STOPS: &[[f64; 2]] = &[
    [0.01, 1.5],
    [0.05, 2.5],
    [0.25, 4.0],
    [1.0, 8.0],
    [4.0, 20.0],
];

/// Retry/concurrency knobs for the fetch scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: f64,
    pub retry_max_delay_ms: f64,
    pub jitter_min: f64,
    pub jitter_max: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            jitter_min: DEFAULT_JITTER_MIN,
            jitter_max: DEFAULT_JITTER_MAX,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::NotPositive {
                field: "maxConcurrency",
            });
        }
        if !(self.retry_base_delay_ms > 0.0) {
            return Err(ConfigError::NotPositive {
                field: "retryBaseDelayMs",
            });
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::InvertedRetryDelays {
                base_ms: self.retry_base_delay_ms,
                max_ms: self.retry_max_delay_ms,
            });
        }
        if !(self.jitter_min > 0.0) || self.jitter_max < self.jitter_min {
            return Err(ConfigError::InvalidJitter {
                min: self.jitter_min,
                max: self.jitter_max,
            });
        }
        Ok(())
    }
}

/// Point overlay sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PointConfig {
    pub size_stops: Vec<[f64; 2]>,
    pub min_size: f32,
    pub max_size: f32,
}

impl Default for PointConfig {
    fn default() -> Self {
        Self {
            size_stops: DEFAULT_POINT_SIZE_STOPS.to_vec(),
            min_size: DEFAULT_POINT_SIZE_MIN,
            max_size: DEFAULT_POINT_SIZE_MAX,
        }
    }
}

impl PointConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_stops.is_empty()
            || self
                .size_stops
                .windows(2)
                .any(|pair| !(pair[0][0] < pair[1][0]))
        {
            return Err(ConfigError::InvalidSizeStops);
        }
        if !(self.min_size > 0.0) {
            return Err(ConfigError::NotPositive { field: "minSize" });
        }
        if self.max_size < self.min_size {
            return Err(ConfigError::NotPositive {
                field: "maxSize - minSize",
            });
        }
        Ok(())
    }
}

/// Everything the host can tune about the renderer. Missing JSON fields fall
/// back to the `DEFAULT_*` constants above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RendererConfig {
    pub scheduler: SchedulerConfig,
    pub max_cache_tiles: usize,
    /// Overscroll allowance as a fraction of the viewport extent.
    pub overscroll_margin: f64,
    /// `minZoom = fitZoom * minFitFactor`.
    pub min_fit_factor: f64,
    /// Screen pixels per image pixel at maximum zoom.
    pub max_native_zoom: f64,
    pub points: PointConfig,
    pub clear_color: [f32; 4],
    pub fps_log_interval_ms: f64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            max_cache_tiles: DEFAULT_MAX_CACHE_TILES,
            overscroll_margin: DEFAULT_OVERSCROLL_MARGIN,
            min_fit_factor: DEFAULT_MIN_FIT_FACTOR,
            max_native_zoom: DEFAULT_MAX_NATIVE_ZOOM,
            points: PointConfig::default(),
            clear_color: DEFAULT_CLEAR_COLOR,
            fps_log_interval_ms: DEFAULT_FPS_LOG_INTERVAL_MS,
        }
    }
}

impl RendererConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        self.points.validate()?;
        if self.max_cache_tiles == 0 {
            return Err(ConfigError::NotPositive {
                field: "maxCacheTiles",
            });
        }
        if !(self.min_fit_factor > 0.0) {
            return Err(ConfigError::NotPositive {
                field: "minFitFactor",
            });
        }
        if !(self.max_native_zoom > 0.0) {
            return Err(ConfigError::NotPositive {
                field: "maxNativeZoom",
            });
        }
        if !(self.overscroll_margin >= 0.0) {
            return Err(ConfigError::NotPositive {
                field: "overscrollMargin",
            });
        }
        Ok(())
    }
}
