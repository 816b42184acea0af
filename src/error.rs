use thiserror::Error;

/// Errors surfaced by the camera source.
///
/// Everything except [`CameraError::Device`] and [`CameraError::Io`] is a
/// configuration error: `start()` aborts, the controller stays idle and may be
/// retried once the configuration is corrected.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not find requested camera (facing {0})")]
    NoMatchingCamera(crate::capture::Facing),

    #[error("could not find suitable preview size")]
    NoPreviewSize,

    #[error("could not find suitable preview frames per second range")]
    NoFpsRange,

    #[error("failed to create valid buffer for camera source: {0}")]
    BufferIntegrity(String),

    #[error("camera source has been released")]
    Released,

    #[error("camera device error: {0}")]
    Device(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl CameraError {
    /// True for errors that abort `start()` and should not be retried in a
    /// tight loop without changing the configuration.
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_)
                | Self::NoMatchingCamera(_)
                | Self::NoPreviewSize
                | Self::NoFpsRange
                | Self::BufferIntegrity(_)
                | Self::Released
        )
    }
}

pub type Result<T, E = CameraError> = std::result::Result<T, E>;
