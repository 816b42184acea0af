pub mod config;
pub mod controller;
pub mod driver;
pub mod frame;
pub mod negotiate;
pub mod pool;
pub mod v4l2;

pub use config::{CameraConfiguration, Facing, FlashMode, FocusMode};
pub use controller::{CameraController, CameraControllerBuilder, StreamInfo};
pub use driver::{CameraBackend, CameraDevice, CameraInfo, Capabilities, FrameSink};
pub use frame::{Frame, PixelFormat, Rotation, Size};
pub use negotiate::{FpsRange, SizePair};
pub use pool::{BufferPool, RawBuffer};
pub use v4l2::V4l2Backend;
