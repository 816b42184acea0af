pub mod analyzer;
pub mod capture;
pub mod error;
pub mod pipeline;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use capture::config::{CameraConfiguration, Facing, FlashMode, FocusMode};
use capture::pool::DEFAULT_BUFFER_COUNT;
use capture::v4l2::V4l2DeviceConfig;
use capture::PixelFormat;
use pipeline::PipelineOptions;

pub use error::{CameraError, Result};

/// Environment variables with this prefix override file settings,
/// e.g. `CAMSOURCE__CAMERA__FPS=15`.
pub const ENV_PREFIX: &str = "CAMSOURCE";

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraSettings,
    pub pipeline: PipelineSettings,
    pub v4l2: V4l2Settings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub fps: f32,
    pub width: u32,
    pub height: u32,
    pub facing: Facing,
    pub focus_mode: Option<FocusMode>,
    pub flash_mode: Option<FlashMode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub buffer_count: usize,
    /// Discard frames that waited longer than this; unset keeps them all.
    pub max_frame_age_ms: Option<u64>,
    pub consumer_core: Option<usize>,
    pub report_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct V4l2Settings {
    pub format: PixelFormat,
    /// Capture nodes to use; empty means auto-detect.
    pub devices: Vec<V4l2DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub filter: String,
}

impl Default for CameraSettings {
    fn default() -> Self {
        let defaults = CameraConfiguration::default();
        Self {
            fps: defaults.requested_fps(),
            width: defaults.preview_width(),
            height: defaults.preview_height(),
            facing: defaults.facing(),
            focus_mode: None,
            flash_mode: None,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            max_frame_age_ms: None,
            consumer_core: None,
            report_interval_ms: 5000,
        }
    }
}

impl Default for V4l2Settings {
    fn default() -> Self {
        Self {
            // Almost every UVC camera offers YUYV.
            format: PixelFormat::Yuyv,
            devices: Vec::new(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "camsource=info".into(),
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if given, then environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validated camera request built from the `camera` section.
    pub fn camera_configuration(&self) -> Result<CameraConfiguration> {
        Ok(CameraConfiguration::builder()
            .requested_fps(self.camera.fps)?
            .requested_preview_size(self.camera.width, self.camera.height)?
            .facing(self.camera.facing)
            .focus_mode(self.camera.focus_mode)
            .flash_mode(self.camera.flash_mode)
            .build())
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            max_frame_age: self.pipeline.max_frame_age_ms.map(Duration::from_millis),
            consumer_core: self.pipeline.consumer_core,
        }
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.pipeline.report_interval_ms)
    }
}
