use thiserror::Error;

/// Why a single tile fetch did not produce an image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status}")]
    Http { status: u16 },
    #[error("decode error: {0}")]
    Decode(String),
    /// The image decoded but the graphics device refused the texture.
    #[error("texture upload failed: {0}")]
    Upload(String),
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Cancellations are not failures: they never retry and never reach the
    /// tile-error callback.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The GPU context is gone; every texture handle is invalid.
    #[error("graphics device lost")]
    Lost,
    #[error("invalid tile image: {0}")]
    InvalidImage(String),
    #[error("graphics backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },
    #[error("retry delays are inverted: base {base_ms}ms exceeds ceiling {max_ms}ms")]
    InvertedRetryDelays { base_ms: f64, max_ms: f64 },
    #[error("jitter range [{min}, {max}] is invalid")]
    InvalidJitter { min: f64, max: f64 },
    #[error("point size stops must be non-empty and sorted by zoom")]
    InvalidSizeStops,
    #[error("invalid config JSON: {0}")]
    Json(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("image dimensions must be non-zero (got {width}x{height})")]
    EmptyImage { width: u64, height: u64 },
    #[error("tile size must be non-zero")]
    ZeroTileSize,
    #[error("max tier zoom {0} exceeds the supported maximum of {max}", max = crate::tiles::MAX_TIER)]
    TierOutOfRange(u8),
    #[error("tier {tier} needs {cols}x{rows} tiles, more than a tile key can address")]
    GridTooLarge { tier: u8, cols: u64, rows: u64 },
    #[error("invalid image source JSON: {0}")]
    Json(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PointDataError {
    #[error("expected {expected} position floats for {count} points, got {actual}")]
    PositionLength {
        count: usize,
        expected: usize,
        actual: usize,
    },
    #[error("expected {count} palette indices, got {actual}")]
    IndexLength { count: usize, actual: usize },
    #[error("palette must hold at least one RGBA entry")]
    EmptyPalette,
    #[error("palette length {0} is not a multiple of 4")]
    RaggedPalette(usize),
}

/// Top-level error for renderer construction and host-driven updates.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RendererError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Points(#[from] PointDataError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("renderer has been destroyed")]
    Destroyed,
}
