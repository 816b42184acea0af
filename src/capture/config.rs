use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CameraError, Result};

/// Largest preview dimension accepted from the application.
pub const MAX_PREVIEW_DIMENSION: u32 = 1_000_000;

/// Which way the camera faces relative to the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    #[default]
    Back,
    Front,
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facing::Back => f.write_str("back"),
            Facing::Front => f.write_str("front"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FocusMode {
    Auto,
    ContinuousPicture,
    ContinuousVideo,
    Edof,
    Fixed,
    Infinity,
    Macro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlashMode {
    On,
    Off,
    Auto,
    RedEye,
    Torch,
}

/// What the application asks of the camera. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraConfiguration {
    requested_fps: f32,
    preview_width: u32,
    preview_height: u32,
    facing: Facing,
    focus_mode: Option<FocusMode>,
    flash_mode: Option<FlashMode>,
}

impl Default for CameraConfiguration {
    fn default() -> Self {
        Self {
            requested_fps: 30.0,
            preview_width: 1024,
            preview_height: 768,
            facing: Facing::Back,
            focus_mode: None,
            flash_mode: None,
        }
    }
}

impl CameraConfiguration {
    pub fn builder() -> CameraConfigurationBuilder {
        CameraConfigurationBuilder::default()
    }

    pub fn requested_fps(&self) -> f32 {
        self.requested_fps
    }

    pub fn preview_width(&self) -> u32 {
        self.preview_width
    }

    pub fn preview_height(&self) -> u32 {
        self.preview_height
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    pub fn focus_mode(&self) -> Option<FocusMode> {
        self.focus_mode
    }

    pub fn flash_mode(&self) -> Option<FlashMode> {
        self.flash_mode
    }
}

/// Validating builder; every setter rejects out-of-range values immediately.
#[derive(Debug, Clone, Default)]
pub struct CameraConfigurationBuilder {
    config: CameraConfiguration,
}

impl CameraConfigurationBuilder {
    pub fn requested_fps(mut self, fps: f32) -> Result<Self> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(CameraError::InvalidConfig(format!("invalid fps: {fps}")));
        }
        self.config.requested_fps = fps;
        Ok(self)
    }

    pub fn requested_preview_size(mut self, width: u32, height: u32) -> Result<Self> {
        let valid = |v: u32| (1..=MAX_PREVIEW_DIMENSION).contains(&v);
        if !valid(width) || !valid(height) {
            return Err(CameraError::InvalidConfig(format!(
                "invalid preview size: {width}x{height}"
            )));
        }
        self.config.preview_width = width;
        self.config.preview_height = height;
        Ok(self)
    }

    pub fn facing(mut self, facing: Facing) -> Self {
        self.config.facing = facing;
        self
    }

    pub fn focus_mode(mut self, mode: Option<FocusMode>) -> Self {
        self.config.focus_mode = mode;
        self
    }

    pub fn flash_mode(mut self, mode: Option<FlashMode>) -> Self {
        self.config.flash_mode = mode;
        self
    }

    pub fn build(self) -> CameraConfiguration {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_camera_source() {
        let config = CameraConfiguration::default();
        assert_eq!(config.requested_fps(), 30.0);
        assert_eq!((config.preview_width(), config.preview_height()), (1024, 768));
        assert_eq!(config.facing(), Facing::Back);
        assert!(config.focus_mode().is_none());
    }

    #[test]
    fn rejects_non_positive_fps() {
        assert!(CameraConfiguration::builder().requested_fps(0.0).is_err());
        assert!(CameraConfiguration::builder().requested_fps(-1.0).is_err());
        assert!(CameraConfiguration::builder().requested_fps(f32::NAN).is_err());
    }

    #[test]
    fn rejects_out_of_range_preview_size() {
        let builder = CameraConfiguration::builder();
        assert!(builder.clone().requested_preview_size(0, 480).is_err());
        assert!(builder
            .clone()
            .requested_preview_size(640, MAX_PREVIEW_DIMENSION + 1)
            .is_err());
        let config = builder
            .requested_preview_size(MAX_PREVIEW_DIMENSION, 1)
            .unwrap()
            .build();
        assert_eq!(config.preview_width(), MAX_PREVIEW_DIMENSION);
    }

    #[test]
    fn focus_modes_use_driver_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: FocusMode,
        }
        let parsed: Wrapper = parse_mode("continuous-picture");
        assert_eq!(parsed.mode, FocusMode::ContinuousPicture);

        fn parse_mode(value: &str) -> Wrapper {
            let source = config::Config::builder()
                .set_override("mode", value)
                .unwrap()
                .build()
                .unwrap();
            source.try_deserialize().unwrap()
        }
    }
}
