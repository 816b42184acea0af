//! Camera lifecycle: open, negotiate, stream, stop, release.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use arc_swap::ArcSwapOption;
use tracing::{debug, error, info, instrument, warn};

use super::config::{CameraConfiguration, Facing, FlashMode, FocusMode};
use super::driver::{
    AutoFocusCallback, AutoFocusMoveCallback, CameraBackend, CameraDevice, CameraInfo,
    PictureCallback, ShutterCallback, StreamParameters,
};
use super::frame::{Rotation, Size};
use super::negotiate::{
    orientation_for, preview_buffer_len, select_fps_range, select_size_pair,
};
use super::pool::{BufferPool, PoolCensus, DEFAULT_BUFFER_COUNT};
use crate::analyzer::FrameAnalyzer;
use crate::error::{CameraError, Result};
use crate::pipeline::{FramePipeline, PipelineOptions, PipelineState, PipelineStats, StreamSession};

/// What an overlay needs to map analyzer coordinates onto the preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub preview_size: Size,
    pub facing: Facing,
    pub rotation: Rotation,
    pub display_angle: u32,
}

/// State guarded by the camera lock.
struct DeviceState {
    camera: Option<Box<dyn CameraDevice>>,
    pipeline: FramePipeline,
    pool: Option<Arc<BufferPool>>,
    preview_size: Option<Size>,
    rotation: Rotation,
    focus_mode: Option<FocusMode>,
    flash_mode: Option<FlashMode>,
}

fn lock_device(device: &Mutex<DeviceState>) -> MutexGuard<'_, DeviceState> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CameraControllerBuilder {
    backend: Arc<dyn CameraBackend>,
    analyzer: Box<dyn FrameAnalyzer>,
    configuration: CameraConfiguration,
    buffer_count: usize,
    pipeline: PipelineOptions,
}

impl CameraControllerBuilder {
    pub fn configuration(mut self, configuration: CameraConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn buffer_count(mut self, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(CameraError::InvalidConfig("buffer count must be positive".into()));
        }
        self.buffer_count = count;
        Ok(self)
    }

    pub fn pipeline_options(mut self, options: PipelineOptions) -> Self {
        self.pipeline = options;
        self
    }

    pub fn build(self) -> CameraController {
        let state = DeviceState {
            camera: None,
            pipeline: FramePipeline::new(self.analyzer, self.pipeline),
            pool: None,
            preview_size: None,
            rotation: Rotation::DEG_0,
            focus_mode: self.configuration.focus_mode(),
            flash_mode: self.configuration.flash_mode(),
        };
        CameraController {
            config: self.configuration,
            backend: self.backend,
            buffer_count: self.buffer_count,
            device: Arc::new(Mutex::new(state)),
            stream_info: ArcSwapOption::empty(),
        }
    }
}

/// Drives one camera and feeds its preview frames to an analyzer.
///
/// Every operation that touches the device takes the camera lock, so
/// reconfiguration never races with start or stop. Frame delivery and
/// analysis never take it.
pub struct CameraController {
    config: CameraConfiguration,
    backend: Arc<dyn CameraBackend>,
    buffer_count: usize,
    device: Arc<Mutex<DeviceState>>,
    stream_info: ArcSwapOption<StreamInfo>,
}

impl CameraController {
    pub fn builder(
        backend: Arc<dyn CameraBackend>,
        analyzer: Box<dyn FrameAnalyzer>,
    ) -> CameraControllerBuilder {
        CameraControllerBuilder {
            backend,
            analyzer,
            configuration: CameraConfiguration::default(),
            buffer_count: DEFAULT_BUFFER_COUNT,
            pipeline: PipelineOptions::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        lock_device(&self.device)
    }

    pub fn configuration(&self) -> &CameraConfiguration {
        &self.config
    }

    /// Opens the camera and starts streaming frames to the analyzer.
    ///
    /// Does nothing if already started. On error the camera is closed again
    /// and the controller stays idle.
    #[instrument(skip(self), fields(facing = %self.config.facing()))]
    pub fn start(&self) -> Result<&Self> {
        let mut state = self.lock();
        if state.pipeline.state() == PipelineState::Released {
            return Err(CameraError::Released);
        }
        if state.camera.is_some() {
            return Ok(self);
        }

        let info = self.find_camera()?;
        let mut camera = self.backend.open(&info)?;
        match self.bring_up(&mut state, camera.as_mut(), &info) {
            Ok(()) => {
                state.camera = Some(camera);
                Ok(self)
            }
            Err(e) => {
                state.pipeline.stop();
                camera.stop_preview();
                camera.set_frame_sink(None);
                if let Some(pool) = state.pool.take() {
                    pool.release_all();
                }
                camera.close();
                state.preview_size = None;
                warn!(error = %e, "Camera start failed");
                Err(e)
            }
        }
    }

    fn find_camera(&self) -> Result<CameraInfo> {
        let facing = self.config.facing();
        self.backend
            .cameras()?
            .into_iter()
            .find(|info| info.facing == facing)
            .ok_or(CameraError::NoMatchingCamera(facing))
    }

    fn bring_up(
        &self,
        state: &mut DeviceState,
        camera: &mut dyn CameraDevice,
        info: &CameraInfo,
    ) -> Result<()> {
        let caps = camera.capabilities().clone();

        let pair = select_size_pair(
            &caps.preview_sizes,
            &caps.picture_sizes,
            self.config.preview_width(),
            self.config.preview_height(),
        )
        .ok_or(CameraError::NoPreviewSize)?;
        let fps_range = select_fps_range(&caps.fps_ranges, self.config.requested_fps())
            .ok_or(CameraError::NoFpsRange)?;
        let orientation = orientation_for(info, self.backend.display_rotation());

        let focus_mode = state.focus_mode.filter(|mode| {
            let supported = caps.focus_modes.contains(mode);
            if !supported {
                info!(?mode, "Camera focus mode is not supported on this device");
            }
            supported
        });
        let flash_mode = state.flash_mode.filter(|mode| {
            let supported = caps.flash_modes.contains(mode);
            if !supported {
                info!(?mode, "Camera flash mode is not supported on this device");
            }
            supported
        });

        camera.apply(&StreamParameters {
            preview_size: pair.preview,
            picture_size: pair.picture,
            fps_range,
            preview_format: caps.preview_format,
            display_angle: orientation.display_angle,
            picture_angle: orientation.picture_angle,
            focus_mode,
            flash_mode,
        })?;
        state.focus_mode = camera.focus_mode();
        state.flash_mode = camera.flash_mode();
        state.preview_size = Some(pair.preview);
        state.rotation = orientation.rotation;

        let buffer_len = preview_buffer_len(pair.preview, caps.preview_format);
        let pool = Arc::new(BufferPool::allocate(
            self.buffer_count,
            buffer_len,
            camera.buffer_queue(),
        )?);
        state.pool = Some(pool.clone());

        // The session must be live before the first frame can arrive.
        state.pipeline.start(StreamSession {
            pool,
            preview_size: pair.preview,
            format: caps.preview_format,
            rotation: orientation.rotation,
        })?;
        camera.set_frame_sink(Some(Arc::new(state.pipeline.producer())));
        camera.start_preview()?;

        self.stream_info.store(Some(Arc::new(StreamInfo {
            preview_size: pair.preview,
            facing: info.facing,
            rotation: orientation.rotation,
            display_angle: orientation.display_angle,
        })));
        info!(
            camera = %info.id,
            preview = %pair.preview,
            picture = ?pair.picture,
            fps_min = fps_range.min,
            fps_max = fps_range.max,
            rotation = orientation.rotation.degrees(),
            "Camera started"
        );
        Ok(())
    }

    /// Stops streaming and closes the camera. Blocks until the frame
    /// processing thread has exited. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        let mut state = self.lock();
        self.stop_locked(&mut state);
    }

    fn stop_locked(&self, state: &mut DeviceState) {
        state.pipeline.stop();
        if let Some(pool) = state.pool.take() {
            pool.release_all();
        }
        if let Some(mut camera) = state.camera.take() {
            camera.stop_preview();
            camera.set_frame_sink(None);
            if let Err(e) = camera.clear_preview_surface() {
                error!(error = %e, "Failed to clear camera preview");
            }
            camera.close();
            info!("Camera stopped");
        }
        state.preview_size = None;
        self.stream_info.store(None);
    }

    /// Stops the camera and releases the analyzer. The controller cannot be
    /// started again afterwards.
    pub fn release(&self) {
        let mut state = self.lock();
        self.stop_locked(&mut state);
        state.pipeline.release();
    }

    pub fn is_running(&self) -> bool {
        self.lock().camera.is_some()
    }

    pub fn state(&self) -> PipelineState {
        self.lock().pipeline.state()
    }

    pub fn stats(&self) -> PipelineStats {
        self.lock().pipeline.stats()
    }

    /// Where the preview buffers are right now; `None` while stopped.
    pub fn buffer_census(&self) -> Option<PoolCensus> {
        self.lock().pool.as_ref().map(|pool| pool.census())
    }

    /// Negotiated preview size, once started.
    pub fn preview_size(&self) -> Option<Size> {
        self.lock().preview_size
    }

    pub fn facing(&self) -> Facing {
        self.config.facing()
    }

    pub fn rotation(&self) -> Rotation {
        self.lock().rotation
    }

    /// Lock-free snapshot for overlays; `None` while stopped.
    pub fn stream_info(&self) -> Option<Arc<StreamInfo>> {
        self.stream_info.load_full()
    }

    /// Zooms relative to the current level and returns the new level.
    ///
    /// Returns 0 when the camera is not open or cannot zoom.
    pub fn set_zoom(&self, scale: f32) -> u32 {
        let mut state = self.lock();
        let Some(camera) = state.camera.as_mut() else {
            return 0;
        };
        let Some(max_zoom) = camera.capabilities().max_zoom else {
            warn!("Zoom is not supported on this device");
            return 0;
        };
        let level = zoom_level(camera.zoom(), max_zoom, scale);
        if let Err(e) = camera.set_zoom(level) {
            warn!(error = %e, level, "Failed to set zoom");
            return camera.zoom();
        }
        level
    }

    /// Captures a still picture. Preview restarts once the picture callback
    /// has run, whether or not callbacks were supplied.
    pub fn take_picture(
        &self,
        shutter: Option<ShutterCallback>,
        picture: Option<PictureCallback>,
    ) -> Result<()> {
        let mut state = self.lock();
        let Some(camera) = state.camera.as_mut() else {
            debug!("Picture requested while camera is stopped");
            return Ok(());
        };

        let device: Weak<Mutex<DeviceState>> = Arc::downgrade(&self.device);
        let done: PictureCallback = Box::new(move |data| {
            if let Some(picture) = picture {
                picture(data);
            }
            let Some(device) = device.upgrade() else {
                return;
            };
            let mut state = lock_device(&device);
            if let Some(camera) = state.camera.as_mut() {
                if let Err(e) = camera.start_preview() {
                    error!(error = %e, "Failed to resume preview after picture");
                }
            }
        });
        camera.take_picture(shutter, done)
    }

    pub fn focus_mode(&self) -> Option<FocusMode> {
        self.lock().focus_mode
    }

    /// Applies `mode` if the open camera supports it.
    pub fn set_focus_mode(&self, mode: FocusMode) -> bool {
        let mut state = self.lock();
        let Some(camera) = state.camera.as_mut() else {
            return false;
        };
        if !camera.capabilities().focus_modes.contains(&mode) {
            return false;
        }
        match camera.set_focus_mode(mode) {
            Ok(()) => {
                state.focus_mode = Some(mode);
                true
            }
            Err(e) => {
                warn!(error = %e, ?mode, "Failed to set focus mode");
                false
            }
        }
    }

    pub fn flash_mode(&self) -> Option<FlashMode> {
        self.lock().flash_mode
    }

    /// Applies `mode` if the open camera supports it.
    pub fn set_flash_mode(&self, mode: FlashMode) -> bool {
        let mut state = self.lock();
        let Some(camera) = state.camera.as_mut() else {
            return false;
        };
        if !camera.capabilities().flash_modes.contains(&mode) {
            return false;
        }
        match camera.set_flash_mode(mode) {
            Ok(()) => {
                state.flash_mode = Some(mode);
                true
            }
            Err(e) => {
                warn!(error = %e, ?mode, "Failed to set flash mode");
                false
            }
        }
    }

    pub fn auto_focus(&self, callback: Option<AutoFocusCallback>) {
        if let Some(camera) = self.lock().camera.as_mut() {
            camera.auto_focus(callback);
        }
    }

    pub fn cancel_auto_focus(&self) {
        if let Some(camera) = self.lock().camera.as_mut() {
            camera.cancel_auto_focus();
        }
    }

    pub fn set_auto_focus_move_callback(&self, callback: Option<AutoFocusMoveCallback>) -> bool {
        match self.lock().camera.as_mut() {
            Some(camera) => camera.set_auto_focus_move_callback(callback),
            None => false,
        }
    }
}

impl Drop for CameraController {
    fn drop(&mut self) {
        let mut state = lock_device(&self.device);
        self.stop_locked(&mut state);
    }
}

/// Zoom step for a pinch `scale` relative to the `current` step.
///
/// Scales above 1 zoom in by a tenth of the range per unit of scale; scales
/// below 1 zoom out proportionally.
pub fn zoom_level(current: u32, max_zoom: u32, scale: f32) -> u32 {
    let current = current as f32 + 1.0;
    let target = if scale > 1.0 {
        current + scale * (max_zoom / 10) as f32
    } else {
        current * scale
    };
    let level = target.round() - 1.0;
    if level.is_nan() || level <= 0.0 {
        0
    } else {
        level.min(max_zoom as f32) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoom_in_steps_by_tenth_of_range() {
        // (0 + 1) + 2 * (30 / 10) = 7, minus one.
        assert_eq!(zoom_level(0, 30, 2.0), 6);
        assert_eq!(zoom_level(10, 30, 1.5), 15);
    }

    #[test]
    fn zoom_out_scales_current_level() {
        assert_eq!(zoom_level(9, 30, 0.5), 4);
        assert_eq!(zoom_level(9, 30, 1.0), 9);
    }

    #[test]
    fn zoom_is_clamped() {
        assert_eq!(zoom_level(28, 30, 5.0), 30);
        assert_eq!(zoom_level(0, 30, 0.1), 0);
        assert_eq!(zoom_level(5, 30, f32::NAN), 0);
        assert_eq!(zoom_level(5, 30, -3.0), 0);
    }
}
