//! Seams between the camera source and a platform camera binding.
//!
//! A binding implements [`CameraBackend`] for enumeration and [`CameraDevice`]
//! for one opened camera. Frames flow back through a [`FrameSink`] that the
//! driver invokes on its own thread; empty buffers flow in through the
//! device's [`BufferQueue`].

use std::sync::Arc;

use bytes::Bytes;

use super::config::{Facing, FlashMode, FocusMode};
use super::frame::{PixelFormat, Rotation, Size};
use super::negotiate::FpsRange;
use super::pool::RawBuffer;
use crate::error::Result;

/// Static description of a camera known to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraInfo {
    pub id: String,
    pub facing: Facing,
    /// Clockwise angle the sensor image must be rotated by to be upright in
    /// the device's natural orientation.
    pub orientation: u32,
}

impl CameraInfo {
    pub fn new(id: impl Into<String>, facing: Facing, orientation: u32) -> Self {
        Self {
            id: id.into(),
            facing,
            orientation,
        }
    }
}

/// What an opened camera reports it can do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities {
    pub preview_sizes: Vec<Size>,
    pub picture_sizes: Vec<Size>,
    pub fps_ranges: Vec<FpsRange>,
    pub preview_format: PixelFormat,
    /// Highest zoom step, `None` when zoom is unsupported.
    pub max_zoom: Option<u32>,
    pub focus_modes: Vec<FocusMode>,
    pub flash_modes: Vec<FlashMode>,
}

/// Negotiated stream settings pushed to the device before streaming.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamParameters {
    pub preview_size: Size,
    pub picture_size: Option<Size>,
    pub fps_range: FpsRange,
    pub preview_format: PixelFormat,
    pub display_angle: u32,
    pub picture_angle: u32,
    pub focus_mode: Option<FocusMode>,
    pub flash_mode: Option<FlashMode>,
}

/// Receives filled preview buffers. Called on the driver's thread.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, buffer: RawBuffer);
}

/// Capture queue of empty buffers, safe to feed from any thread.
pub trait BufferQueue: Send + Sync {
    fn enqueue(&self, buffer: RawBuffer);
}

pub type ShutterCallback = Box<dyn FnOnce() + Send>;
pub type PictureCallback = Box<dyn FnOnce(Bytes) + Send>;
pub type AutoFocusCallback = Box<dyn FnOnce(bool) + Send>;
pub type AutoFocusMoveCallback = Box<dyn FnMut(bool) + Send>;

/// Enumerates and opens cameras.
pub trait CameraBackend: Send + Sync {
    fn cameras(&self) -> Result<Vec<CameraInfo>>;

    /// Current display rotation relative to the natural orientation.
    fn display_rotation(&self) -> Rotation {
        Rotation::DEG_0
    }

    fn open(&self, info: &CameraInfo) -> Result<Box<dyn CameraDevice>>;
}

/// One opened camera.
///
/// Callbacks handed to the device (`take_picture`, `auto_focus`, ...) must be
/// invoked from the driver's own thread, never from inside the call that
/// registered them.
pub trait CameraDevice: Send {
    fn capabilities(&self) -> &Capabilities;

    fn apply(&mut self, params: &StreamParameters) -> Result<()>;

    /// Focus mode currently in effect on the device.
    fn focus_mode(&self) -> Option<FocusMode>;

    fn flash_mode(&self) -> Option<FlashMode>;

    fn buffer_queue(&self) -> Arc<dyn BufferQueue>;

    fn set_frame_sink(&mut self, sink: Option<Arc<dyn FrameSink>>);

    fn start_preview(&mut self) -> Result<()>;

    fn stop_preview(&mut self);

    /// Detaches whatever surface the preview was rendering to.
    fn clear_preview_surface(&mut self) -> Result<()> {
        Ok(())
    }

    fn zoom(&self) -> u32;

    fn set_zoom(&mut self, level: u32) -> Result<()>;

    fn set_focus_mode(&mut self, mode: FocusMode) -> Result<()>;

    fn set_flash_mode(&mut self, mode: FlashMode) -> Result<()>;

    /// Captures one still picture. Preview stops until the picture callback
    /// has run.
    fn take_picture(
        &mut self,
        shutter: Option<ShutterCallback>,
        picture: PictureCallback,
    ) -> Result<()>;

    fn auto_focus(&mut self, callback: Option<AutoFocusCallback>);

    fn cancel_auto_focus(&mut self);

    /// Returns false when the device cannot report focus movement.
    fn set_auto_focus_move_callback(&mut self, callback: Option<AutoFocusMoveCallback>) -> bool {
        let _ = callback;
        false
    }

    fn close(self: Box<Self>);
}
