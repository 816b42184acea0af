//! V4L2 camera binding
//!
//! V4L2 owns its own mmap'd capture buffers, so the streaming thread copies
//! each dequeued frame into the next pool buffer waiting in the capture
//! queue. When the queue is empty (every pool buffer is with the pipeline)
//! the frame is dropped at the driver, exactly like a hardware driver with no
//! callback buffer queued.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use super::config::{Facing, FlashMode, FocusMode};
use super::driver::{
    AutoFocusCallback, BufferQueue, CameraBackend, CameraDevice, CameraInfo, Capabilities,
    FrameSink, PictureCallback, ShutterCallback, StreamParameters,
};
use super::frame::{PixelFormat, Size};
use super::negotiate::{FpsRange, FPS_SCALE};
use super::pool::RawBuffer;
use crate::error::{CameraError, Result};

const CID_FOCUS_AUTO: u32 = 0x009a_090c;
const CID_ZOOM_ABSOLUTE: u32 = 0x009a_090d;

/// Kernel-side buffers requested for the mmap stream.
const STREAM_BUFFERS: u32 = 4;
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(250);

/// One capture node and how it is mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V4l2DeviceConfig {
    pub path: String,
    #[serde(default)]
    pub facing: Facing,
    /// Sensor mounting angle in degrees.
    #[serde(default)]
    pub orientation: u32,
}

fn fourcc_for(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Nv21 => FourCC::new(b"NV21"),
        PixelFormat::Nv12 => FourCC::new(b"NV12"),
        PixelFormat::Yuyv => FourCC::new(b"YUYV"),
    }
}

/// Scan `/dev/video*` for capture-capable nodes that offer `format`.
pub fn probe_devices(format: PixelFormat) -> Vec<V4l2DeviceConfig> {
    info!("Auto-detecting capture devices...");
    let fourcc = fourcc_for(format);
    let mut found = Vec::new();

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            continue;
        }
        let offers_format = dev
            .enum_formats()
            .map(|formats| formats.iter().any(|f| f.fourcc == fourcc))
            .unwrap_or(false);
        if offers_format {
            info!("Found {} device: {} - {}", fourcc, path, caps.card);
            found.push(V4l2DeviceConfig {
                path,
                facing: Facing::Back,
                orientation: 0,
            });
        }
    }
    found
}

/// Cameras reachable through V4L2 capture nodes.
pub struct V4l2Backend {
    devices: Vec<V4l2DeviceConfig>,
    format: PixelFormat,
}

impl V4l2Backend {
    pub fn new(devices: Vec<V4l2DeviceConfig>, format: PixelFormat) -> Self {
        Self { devices, format }
    }

    /// Backend over whatever capture nodes are present right now.
    pub fn detect(format: PixelFormat) -> Self {
        Self::new(probe_devices(format), format)
    }
}

impl CameraBackend for V4l2Backend {
    fn cameras(&self) -> Result<Vec<CameraInfo>> {
        Ok(self
            .devices
            .iter()
            .map(|d| CameraInfo::new(d.path.clone(), d.facing, d.orientation))
            .collect())
    }

    fn open(&self, info: &CameraInfo) -> Result<Box<dyn CameraDevice>> {
        Ok(Box::new(V4l2Device::open(&info.id, self.format)?))
    }
}

struct V4l2Queue(flume::Sender<RawBuffer>);

impl BufferQueue for V4l2Queue {
    fn enqueue(&self, buffer: RawBuffer) {
        // Receiver only goes away with the device, and the buffer with it.
        let _ = self.0.send(buffer);
    }
}

struct StillRequest {
    shutter: Option<ShutterCallback>,
    picture: PictureCallback,
}

struct Streamer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct V4l2Device {
    path: String,
    device: Device,
    fourcc: FourCC,
    capabilities: Capabilities,
    params: Option<StreamParameters>,
    queue_tx: flume::Sender<RawBuffer>,
    queue_rx: flume::Receiver<RawBuffer>,
    sink: Option<Arc<dyn FrameSink>>,
    still: Arc<Mutex<Option<StillRequest>>>,
    streamer: Option<Streamer>,
    focus_mode: Option<FocusMode>,
}

impl V4l2Device {
    pub fn open(path: &str, format: PixelFormat) -> Result<Self> {
        info!("Initializing V4L2 capture: {}", path);
        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CameraError::Device(format!(
                "{path} doesn't support video capture"
            )));
        }

        let fourcc = fourcc_for(format);
        if !device.enum_formats()?.iter().any(|f| f.fourcc == fourcc) {
            return Err(CameraError::Device(format!("{path} does not offer {fourcc}")));
        }

        let capabilities = query_capabilities(&device, fourcc, format)?;
        let focus_mode = if capabilities.focus_modes.is_empty() {
            None
        } else {
            match device.control(CID_FOCUS_AUTO).map(|c| c.value) {
                Ok(Value::Integer(0)) | Ok(Value::Boolean(false)) => Some(FocusMode::Fixed),
                _ => Some(FocusMode::ContinuousVideo),
            }
        };

        let (queue_tx, queue_rx) = flume::unbounded();
        Ok(Self {
            path: path.to_string(),
            device,
            fourcc,
            capabilities,
            params: None,
            queue_tx,
            queue_rx,
            sink: None,
            still: Arc::new(Mutex::new(None)),
            streamer: None,
            focus_mode,
        })
    }

    fn set_integer_control(&self, id: u32, value: i64) -> Result<()> {
        self.device.set_control(Control {
            id,
            value: Value::Integer(value),
        })?;
        Ok(())
    }
}

fn fraction_fps(numerator: u32, denominator: u32) -> f32 {
    if numerator == 0 {
        0.0
    } else {
        denominator as f32 / numerator as f32
    }
}

fn query_capabilities(device: &Device, fourcc: FourCC, format: PixelFormat) -> Result<Capabilities> {
    let mut preview_sizes = Vec::new();
    for framesize in device.enum_framesizes(fourcc)? {
        match framesize.size {
            FrameSizeEnum::Discrete(d) => preview_sizes.push(Size::new(d.width, d.height)),
            FrameSizeEnum::Stepwise(s) => {
                preview_sizes.push(Size::new(s.max_width, s.max_height));
                preview_sizes.push(Size::new(s.min_width, s.min_height));
            }
        }
    }

    let mut fps_ranges = Vec::new();
    for size in &preview_sizes {
        let Ok(intervals) = device.enum_frameintervals(fourcc, size.width, size.height) else {
            continue;
        };
        for interval in intervals {
            let range = match interval.interval {
                FrameIntervalEnum::Discrete(f) => FpsRange::fixed(fraction_fps(f.numerator, f.denominator)),
                FrameIntervalEnum::Stepwise(s) => FpsRange::new(
                    (fraction_fps(s.max.numerator, s.max.denominator) * FPS_SCALE) as i32,
                    (fraction_fps(s.min.numerator, s.min.denominator) * FPS_SCALE) as i32,
                ),
            };
            if range.max > 0 && !fps_ranges.contains(&range) {
                fps_ranges.push(range);
            }
        }
    }

    let controls = device.query_controls().unwrap_or_default();
    let max_zoom = controls
        .iter()
        .find(|c| c.id == CID_ZOOM_ABSOLUTE)
        .map(|c| c.maximum.max(0) as u32);
    let focus_modes = if controls.iter().any(|c| c.id == CID_FOCUS_AUTO) {
        vec![FocusMode::ContinuousVideo, FocusMode::Fixed]
    } else {
        Vec::new()
    };

    Ok(Capabilities {
        picture_sizes: preview_sizes.clone(),
        preview_sizes,
        fps_ranges,
        preview_format: format,
        max_zoom,
        focus_modes,
        flash_modes: Vec::new(),
    })
}

impl CameraDevice for V4l2Device {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn apply(&mut self, params: &StreamParameters) -> Result<()> {
        let requested = Format::new(params.preview_size.width, params.preview_size.height, self.fourcc);
        let format = Capture::set_format(&self.device, &requested)?;
        if format.width != requested.width
            || format.height != requested.height
            || format.fourcc != self.fourcc
        {
            return Err(CameraError::Device(format!(
                "driver changed format to {}x{} {}",
                format.width, format.height, format.fourcc
            )));
        }

        let fps = (params.fps_range.max as f32 / FPS_SCALE).round().max(1.0) as u32;
        Capture::set_params(&self.device, &Parameters::with_fps(fps))?;

        if let Some(mode) = params.focus_mode {
            self.set_focus_mode(mode)?;
        }
        if params.display_angle != 0 {
            debug!(angle = params.display_angle, "Display orientation is left to the renderer");
        }
        self.params = Some(params.clone());
        Ok(())
    }

    fn focus_mode(&self) -> Option<FocusMode> {
        self.focus_mode
    }

    fn flash_mode(&self) -> Option<FlashMode> {
        None
    }

    fn buffer_queue(&self) -> Arc<dyn BufferQueue> {
        Arc::new(V4l2Queue(self.queue_tx.clone()))
    }

    fn set_frame_sink(&mut self, sink: Option<Arc<dyn FrameSink>>) {
        self.sink = sink;
    }

    fn start_preview(&mut self) -> Result<()> {
        if self.streamer.is_some() {
            return Ok(());
        }
        let sink = self
            .sink
            .clone()
            .ok_or_else(|| CameraError::Device("no frame sink registered".into()))?;
        if self.params.is_none() {
            return Err(CameraError::Device("stream parameters not applied".into()));
        }

        // The streaming thread gets its own handle; controls stay on ours.
        let stream_device = Device::with_path(&self.path)?;
        let stop = Arc::new(AtomicBool::new(false));
        let worker = StreamWorker {
            device: stream_device,
            stop: stop.clone(),
            sink,
            free: self.queue_rx.clone(),
            still: self.still.clone(),
        };
        let handle = thread::Builder::new()
            .name("camsource-v4l2".into())
            .spawn(move || {
                if let Err(e) = worker.run() {
                    error!("Capture stream error: {}", e);
                }
            })?;
        self.streamer = Some(Streamer { stop, handle });
        info!("Capture stream started with {} buffers", STREAM_BUFFERS);
        Ok(())
    }

    fn stop_preview(&mut self) {
        if let Some(streamer) = self.streamer.take() {
            streamer.stop.store(true, Ordering::Release);
            if streamer.handle.join().is_err() {
                error!("Capture stream thread panicked");
            }
            info!("Capture stream stopped");
        }
    }

    fn zoom(&self) -> u32 {
        match self.device.control(CID_ZOOM_ABSOLUTE).map(|c| c.value) {
            Ok(Value::Integer(v)) => v.max(0) as u32,
            _ => 0,
        }
    }

    fn set_zoom(&mut self, level: u32) -> Result<()> {
        if self.capabilities.max_zoom.is_none() {
            return Err(CameraError::Device("zoom is not supported".into()));
        }
        self.set_integer_control(CID_ZOOM_ABSOLUTE, i64::from(level))
    }

    fn set_focus_mode(&mut self, mode: FocusMode) -> Result<()> {
        let value = match mode {
            FocusMode::ContinuousVideo | FocusMode::ContinuousPicture => 1,
            FocusMode::Fixed => 0,
            other => {
                return Err(CameraError::Device(format!("focus mode {other:?} not supported")));
            }
        };
        self.set_integer_control(CID_FOCUS_AUTO, value)?;
        self.focus_mode = Some(mode);
        Ok(())
    }

    fn set_flash_mode(&mut self, mode: FlashMode) -> Result<()> {
        Err(CameraError::Device(format!("flash mode {mode:?} not supported")))
    }

    fn take_picture(
        &mut self,
        shutter: Option<ShutterCallback>,
        picture: PictureCallback,
    ) -> Result<()> {
        if self.streamer.is_none() {
            return Err(CameraError::Device("preview is not running".into()));
        }
        let mut still = self.still.lock().unwrap_or_else(PoisonError::into_inner);
        if still.is_some() {
            return Err(CameraError::Device("picture already in progress".into()));
        }
        *still = Some(StillRequest { shutter, picture });
        Ok(())
    }

    fn auto_focus(&mut self, callback: Option<AutoFocusCallback>) {
        // UVC cameras focus continuously; report the current state.
        let focused = self.focus_mode == Some(FocusMode::ContinuousVideo);
        if let Some(callback) = callback {
            thread::spawn(move || callback(focused));
        }
    }

    fn cancel_auto_focus(&mut self) {}

    fn close(mut self: Box<Self>) {
        self.stop_preview();
        info!("Closed {}", self.path);
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        self.stop_preview();
    }
}

struct StreamWorker {
    device: Device,
    stop: Arc<AtomicBool>,
    sink: Arc<dyn FrameSink>,
    free: flume::Receiver<RawBuffer>,
    still: Arc<Mutex<Option<StillRequest>>>,
}

impl StreamWorker {
    fn run(self) -> io::Result<()> {
        let mut stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, STREAM_BUFFERS)?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        while !self.stop.load(Ordering::Acquire) {
            let (data, meta) = match CaptureStream::next(&mut stream) {
                Ok(frame) => frame,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e),
            };
            let used = (meta.bytesused as usize).min(data.len());
            let data = &data[..used];

            let still = self
                .still
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(request) = still {
                let payload = Bytes::copy_from_slice(data);
                // Callbacks may take the camera lock, which stop() holds while
                // joining this thread.
                thread::spawn(move || {
                    if let Some(shutter) = request.shutter {
                        shutter();
                    }
                    (request.picture)(payload);
                });
            }

            match self.free.try_recv() {
                Ok(mut buffer) => {
                    let target = buffer.as_mut_slice();
                    let n = target.len().min(data.len());
                    target[..n].copy_from_slice(&data[..n]);
                    self.sink.on_frame(buffer);
                }
                Err(_) => {
                    debug!(sequence = meta.sequence, "No free preview buffer, dropping frame");
                }
            }
        }
        Ok(())
    }
}
