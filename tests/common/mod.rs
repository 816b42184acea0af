//! Scripted in-memory camera driver for controller tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use camsource::analyzer::{AnalyzerError, FrameAnalyzer};
use camsource::capture::driver::{
    AutoFocusCallback, AutoFocusMoveCallback, BufferQueue, PictureCallback, ShutterCallback,
    StreamParameters,
};
use camsource::capture::{
    CameraBackend, CameraDevice, CameraInfo, Capabilities, Facing, FlashMode, FocusMode, Frame,
    FrameSink, FpsRange, PixelFormat, RawBuffer, Rotation, Size,
};
use camsource::{CameraError, Result};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn default_capabilities() -> Capabilities {
    let sizes = vec![Size::new(640, 480), Size::new(1280, 960), Size::new(1024, 768)];
    Capabilities {
        preview_sizes: sizes.clone(),
        picture_sizes: sizes,
        fps_ranges: vec![FpsRange::new(10000, 20000), FpsRange::new(25000, 30000)],
        preview_format: PixelFormat::Nv21,
        max_zoom: Some(30),
        focus_modes: vec![FocusMode::Auto, FocusMode::ContinuousPicture],
        flash_modes: vec![FlashMode::Off, FlashMode::Torch],
    }
}

type PendingPicture = (Option<ShutterCallback>, PictureCallback);

#[derive(Default)]
pub struct HardwareState {
    pub queue: VecDeque<RawBuffer>,
    pub sink: Option<Arc<dyn FrameSink>>,
    pub streaming: bool,
    pub opened: usize,
    pub closed: usize,
    pub preview_starts: usize,
    pub applied: Option<StreamParameters>,
    pub zoom: u32,
    pub focus_mode: Option<FocusMode>,
    pub flash_mode: Option<FlashMode>,
    pub fail_clear_surface: bool,
    /// Deliver a frame from a driver thread before `start_preview` returns.
    pub deliver_on_start: bool,
    picture: Option<PendingPicture>,
}

/// The "hardware" behind every device the backend opens.
#[derive(Default)]
pub struct Hardware {
    state: Mutex<HardwareState>,
}

impl Hardware {
    pub fn state(&self) -> MutexGuard<'_, HardwareState> {
        self.state.lock().unwrap()
    }

    pub fn queued(&self) -> usize {
        self.state().queue.len()
    }

    /// Fills the next queued buffer and delivers it, like a driver callback.
    /// Returns the buffer's first byte, or `None` if nothing was queued.
    pub fn emit_frame(&self, fill: u8) -> Option<u8> {
        let (mut buffer, sink) = {
            let mut state = self.state();
            if !state.streaming {
                return None;
            }
            let sink = state.sink.clone()?;
            (state.queue.pop_front()?, sink)
        };
        buffer.as_mut_slice().fill(fill);
        sink.on_frame(buffer);
        Some(fill)
    }

    /// Takes a buffer out of the driver queue without delivering it.
    pub fn steal_buffer(&self) -> Option<RawBuffer> {
        self.state().queue.pop_front()
    }

    /// Delivers an arbitrary buffer through the registered sink.
    pub fn inject(&self, buffer: RawBuffer) {
        let sink = self.state().sink.clone();
        if let Some(sink) = sink {
            sink.on_frame(buffer);
        }
    }

    /// Finishes an outstanding still capture on the calling thread.
    pub fn complete_picture(&self, payload: &'static [u8]) -> bool {
        let picture = self.state().picture.take();
        match picture {
            Some((shutter, done)) => {
                if let Some(shutter) = shutter {
                    shutter();
                }
                done(bytes::Bytes::from_static(payload));
                true
            }
            None => false,
        }
    }
}

pub struct ScriptedBackend {
    pub cameras: Vec<CameraInfo>,
    pub capabilities: Capabilities,
    pub display_rotation: Rotation,
    pub hardware: Arc<Hardware>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            cameras: vec![CameraInfo::new("0", Facing::Back, 90)],
            capabilities: default_capabilities(),
            display_rotation: Rotation::DEG_0,
            hardware: Arc::new(Hardware::default()),
        }
    }
}

impl CameraBackend for ScriptedBackend {
    fn cameras(&self) -> Result<Vec<CameraInfo>> {
        Ok(self.cameras.clone())
    }

    fn display_rotation(&self) -> Rotation {
        self.display_rotation
    }

    fn open(&self, _info: &CameraInfo) -> Result<Box<dyn CameraDevice>> {
        self.hardware.state().opened += 1;
        Ok(Box::new(ScriptedDevice {
            capabilities: self.capabilities.clone(),
            hardware: self.hardware.clone(),
        }))
    }
}

struct ScriptedQueue(Arc<Hardware>);

impl BufferQueue for ScriptedQueue {
    fn enqueue(&self, buffer: RawBuffer) {
        self.0.state().queue.push_back(buffer);
    }
}

pub struct ScriptedDevice {
    capabilities: Capabilities,
    hardware: Arc<Hardware>,
}

impl CameraDevice for ScriptedDevice {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn apply(&mut self, params: &StreamParameters) -> Result<()> {
        let mut state = self.hardware.state();
        state.focus_mode = params.focus_mode.or(Some(FocusMode::Auto));
        state.flash_mode = params.flash_mode;
        state.applied = Some(params.clone());
        Ok(())
    }

    fn focus_mode(&self) -> Option<FocusMode> {
        self.hardware.state().focus_mode
    }

    fn flash_mode(&self) -> Option<FlashMode> {
        self.hardware.state().flash_mode
    }

    fn buffer_queue(&self) -> Arc<dyn BufferQueue> {
        Arc::new(ScriptedQueue(self.hardware.clone()))
    }

    fn set_frame_sink(&mut self, sink: Option<Arc<dyn FrameSink>>) {
        self.hardware.state().sink = sink;
    }

    fn start_preview(&mut self) -> Result<()> {
        let deliver = {
            let mut state = self.hardware.state();
            state.streaming = true;
            state.preview_starts += 1;
            state.deliver_on_start
        };
        if deliver {
            let hardware = self.hardware.clone();
            std::thread::spawn(move || hardware.emit_frame(0x5a))
                .join()
                .map_err(|_| CameraError::Device("driver thread panicked".into()))?;
        }
        Ok(())
    }

    fn stop_preview(&mut self) {
        self.hardware.state().streaming = false;
    }

    fn clear_preview_surface(&mut self) -> Result<()> {
        if self.hardware.state().fail_clear_surface {
            return Err(CameraError::Device("surface already destroyed".into()));
        }
        Ok(())
    }

    fn zoom(&self) -> u32 {
        self.hardware.state().zoom
    }

    fn set_zoom(&mut self, level: u32) -> Result<()> {
        self.hardware.state().zoom = level;
        Ok(())
    }

    fn set_focus_mode(&mut self, mode: FocusMode) -> Result<()> {
        self.hardware.state().focus_mode = Some(mode);
        Ok(())
    }

    fn set_flash_mode(&mut self, mode: FlashMode) -> Result<()> {
        self.hardware.state().flash_mode = Some(mode);
        Ok(())
    }

    fn take_picture(
        &mut self,
        shutter: Option<ShutterCallback>,
        picture: PictureCallback,
    ) -> Result<()> {
        let mut state = self.hardware.state();
        state.streaming = false;
        state.picture = Some((shutter, picture));
        Ok(())
    }

    fn auto_focus(&mut self, callback: Option<AutoFocusCallback>) {
        if let Some(callback) = callback {
            std::thread::spawn(move || callback(true));
        }
    }

    fn cancel_auto_focus(&mut self) {}

    fn set_auto_focus_move_callback(&mut self, callback: Option<AutoFocusMoveCallback>) -> bool {
        callback.is_some()
    }

    fn close(self: Box<Self>) {
        let mut state = self.hardware.state();
        state.queue.clear();
        state.sink = None;
        state.closed += 1;
    }
}

/// Observation of one analyzer call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub id: u64,
    pub first_byte: u8,
    pub size: Size,
    pub rotation: Rotation,
}

/// Analyzer that reports every frame and optionally waits on a gate before
/// returning, so tests can hold the consumer mid-analysis.
pub struct RecordingAnalyzer {
    seen: flume::Sender<Seen>,
    gate: Option<flume::Receiver<()>>,
    released: Arc<Mutex<u32>>,
}

pub struct AnalyzerTap {
    pub seen: flume::Receiver<Seen>,
    pub gate: Option<flume::Sender<()>>,
    pub released: Arc<Mutex<u32>>,
}

impl AnalyzerTap {
    pub fn next(&self) -> Seen {
        self.seen.recv_timeout(TIMEOUT).expect("analyzer saw no frame")
    }

    pub fn nothing_within(&self, wait: Duration) -> bool {
        self.seen.recv_timeout(wait).is_err()
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.send(()).unwrap();
        }
    }

    pub fn release_count(&self) -> u32 {
        *self.released.lock().unwrap()
    }
}

pub fn recording_analyzer(gated: bool) -> (Box<dyn FrameAnalyzer>, AnalyzerTap) {
    let (seen_tx, seen_rx) = flume::unbounded();
    let (gate_tx, gate_rx) = if gated {
        let (tx, rx) = flume::unbounded();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let released = Arc::new(Mutex::new(0));
    let analyzer = RecordingAnalyzer {
        seen: seen_tx,
        gate: gate_rx,
        released: released.clone(),
    };
    (
        Box::new(analyzer),
        AnalyzerTap {
            seen: seen_rx,
            gate: gate_tx,
            released,
        },
    )
}

impl FrameAnalyzer for RecordingAnalyzer {
    fn analyze(&mut self, frame: &Frame<'_>) -> std::result::Result<(), AnalyzerError> {
        self.seen
            .send(Seen {
                id: frame.id,
                first_byte: frame.data[0],
                size: frame.size(),
                rotation: frame.rotation,
            })
            .ok();
        if let Some(gate) = &self.gate {
            gate.recv_timeout(TIMEOUT).ok();
        }
        Ok(())
    }

    fn release(&mut self) {
        *self.released.lock().unwrap() += 1;
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}
