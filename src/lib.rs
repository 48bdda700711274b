pub mod capture;
pub mod error;
pub mod pipeline;
pub mod session;

use std::path::{Path, PathBuf};

use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::frame::{FrameDescriptor, FrameSize, Image};
pub use capture::source::{FrameSource, FrameStream};
pub use error::{CaptureError, ConfigError, ErrorStage};
pub use session::{CaptureSession, SessionState};

/// Environment variable prefix, e.g. `VDOCAP__CAPTURE__WIDTH=1280`
pub const ENV_PREFIX: &str = "VDOCAP";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub logging: LoggingConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub channel: u32,
    pub format: PixelFormat,
    /// Buffers the consumer may hold at once
    pub buffer_count: u32,
    pub crop: Option<CropConfig>,
    /// Row alignment hint passed to the producer
    pub simd_align: Option<u32>,
    /// Stale frames one retrieve may discard before failing; unbounded if unset
    pub max_stale_drops: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropConfig {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber` env-filter directive, overridden by `RUST_LOG`
    pub filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub frames: u32,
    /// Where to write the last frame as PNG
    pub snapshot: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            channel: 1,
            format: PixelFormat::Rgb3,
            buffer_count: 3,
            crop: None,
            simd_align: None,
            max_stale_drops: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "vdocap=info".into(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            frames: 30,
            snapshot: None,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `VDOCAP__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

/// Counters collected by a capture session
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    pub delivered_frames: u64,
    pub dropped_frames: u64,
    pub converted_frames: u64,
    pub reclaimed_buffers: u64,
    pub evicted_buffers: u64,
}
