//! Latest-frame hand-off between the driver thread and the analyzer thread.
//!
//! The driver (producer) parks each filled buffer in a single pending slot,
//! replacing and recycling whatever frame was still waiting there. One
//! dedicated consumer thread takes the newest pending frame, runs the analyzer
//! on it with no lock held, and recycles the buffer afterwards.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use super::stats::{ConsumerGuard, Counters, PipelineStats};
use crate::analyzer::FrameAnalyzer;
use crate::capture::driver::FrameSink;
use crate::capture::pool::{BufferPool, RawBuffer};
use crate::capture::{Frame, PixelFormat, Rotation, Size};
use crate::error::{CameraError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No consumer thread.
    Idle,
    /// Consumer thread running and frames accepted.
    Running,
    /// Consumer told to exit, join in progress.
    Stopping,
    /// Analyzer released; the pipeline can never run again.
    Released,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Frames older than this when picked up are recycled unanalyzed.
    /// `None` keeps every frame regardless of how long it waited.
    pub max_frame_age: Option<Duration>,
    /// Pin the consumer thread to this core index.
    pub consumer_core: Option<usize>,
}

/// Everything the pipeline needs to know about the current stream.
#[derive(Debug)]
pub struct StreamSession {
    pub pool: Arc<BufferPool>,
    pub preview_size: Size,
    pub format: PixelFormat,
    pub rotation: Rotation,
}

struct PendingFrame {
    id: u64,
    timestamp: Duration,
    captured_at: Instant,
    buffer: RawBuffer,
}

struct Slot {
    active: bool,
    pending: Option<PendingFrame>,
    session: Option<Arc<StreamSession>>,
    last_id: u64,
}

struct Shared {
    slot: Mutex<Slot>,
    ready: Condvar,
    started_at: Instant,
    counters: Counters,
}

impl Shared {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type SharedAnalyzer = Arc<Mutex<Box<dyn FrameAnalyzer>>>;

/// Owns the consumer thread and the analyzer.
pub struct FramePipeline {
    shared: Arc<Shared>,
    analyzer: SharedAnalyzer,
    options: PipelineOptions,
    state: PipelineState,
    worker: Option<JoinHandle<()>>,
}

impl FramePipeline {
    pub fn new(analyzer: Box<dyn FrameAnalyzer>, options: PipelineOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    active: false,
                    pending: None,
                    session: None,
                    last_id: 0,
                }),
                ready: Condvar::new(),
                started_at: Instant::now(),
                counters: Counters::default(),
            }),
            analyzer: Arc::new(Mutex::new(analyzer)),
            options,
            state: PipelineState::Idle,
            worker: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.counters.snapshot()
    }

    /// The driver-facing entry point for filled buffers.
    pub fn producer(&self) -> FrameProducer {
        FrameProducer {
            shared: self.shared.clone(),
        }
    }

    /// Spawns the consumer thread for `session`. No-op while running.
    #[instrument(skip_all, fields(preview = %session.preview_size))]
    pub fn start(&mut self, session: StreamSession) -> Result<()> {
        match self.state {
            PipelineState::Running => return Ok(()),
            PipelineState::Released => return Err(CameraError::Released),
            PipelineState::Idle | PipelineState::Stopping => {}
        }

        let session = Arc::new(session);
        {
            let mut slot = self.shared.lock_slot();
            slot.active = true;
            slot.session = Some(session.clone());
        }

        let shared = self.shared.clone();
        let analyzer = self.analyzer.clone();
        let options = self.options.clone();
        let spawned = thread::Builder::new()
            .name("camsource-frames".into())
            .spawn(move || consume(shared, session, analyzer, options));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.state = PipelineState::Running;
                info!("Frame processing started");
                Ok(())
            }
            Err(e) => {
                self.deactivate();
                Err(CameraError::Io(e))
            }
        }
    }

    /// Stops accepting frames and blocks until the consumer thread has exited.
    #[instrument(skip_all)]
    pub fn stop(&mut self) {
        if self.state != PipelineState::Running {
            return;
        }
        self.state = PipelineState::Stopping;
        {
            let mut slot = self.shared.lock_slot();
            slot.active = false;
            self.shared.ready.notify_all();
        }

        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Frame processing thread panicked");
            }
        }
        self.deactivate();
        self.state = PipelineState::Idle;
        info!("Frame processing stopped");
    }

    /// Stops the pipeline and releases the analyzer. Terminal.
    pub fn release(&mut self) {
        if self.state == PipelineState::Released {
            return;
        }
        self.stop();
        self.analyzer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release();
        self.state = PipelineState::Released;
    }

    fn deactivate(&self) {
        let mut slot = self.shared.lock_slot();
        slot.active = false;
        let session = slot.session.take();
        if let (Some(frame), Some(session)) = (slot.pending.take(), session) {
            session.pool.recycle(frame.buffer);
        }
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle the driver uses to deliver frames. Cheap to clone.
#[derive(Clone)]
pub struct FrameProducer {
    shared: Arc<Shared>,
}

impl FrameSink for FrameProducer {
    fn on_frame(&self, buffer: RawBuffer) {
        let shared = &self.shared;
        let mut slot = shared.lock_slot();
        let Some(session) = slot.session.clone() else {
            debug!(id = ?buffer.id(), "Frame arrived with no active stream, dropping buffer");
            return;
        };

        if let Some(superseded) = slot.pending.take() {
            session.pool.recycle(superseded.buffer);
            shared.counters.dropped();
        }

        let buffer = match session.pool.resolve(buffer) {
            Ok(buffer) => buffer,
            Err(unknown) => {
                debug!(
                    id = ?unknown.id(),
                    "Skipping frame: buffer does not belong to the current pool"
                );
                shared.counters.skipped();
                return;
            }
        };

        if !slot.active {
            session.pool.recycle(buffer);
            return;
        }

        slot.last_id += 1;
        slot.pending = Some(PendingFrame {
            id: slot.last_id,
            timestamp: shared.started_at.elapsed(),
            captured_at: Instant::now(),
            buffer,
        });
        shared.counters.received();
        shared.ready.notify_all();
    }
}

fn pin_to_core(index: usize) {
    let core = core_affinity::get_core_ids().and_then(|ids| ids.into_iter().find(|c| c.id == index));
    match core {
        Some(core) if core_affinity::set_for_current(core) => {
            debug!(core = index, "Frame processing thread pinned");
        }
        _ => warn!(core = index, "Could not pin frame processing thread"),
    }
}

fn consume(
    shared: Arc<Shared>,
    session: Arc<StreamSession>,
    analyzer: SharedAnalyzer,
    options: PipelineOptions,
) {
    if let Some(core) = options.consumer_core {
        pin_to_core(core);
    }
    let _guard = ConsumerGuard::enter(&shared.counters);
    let mut analyzer = analyzer.lock().unwrap_or_else(PoisonError::into_inner);
    let pool = &session.pool;

    loop {
        let frame = {
            let mut slot = shared.lock_slot();
            while slot.active && slot.pending.is_none() {
                slot = shared
                    .ready
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if !slot.active {
                debug!("Frame processing loop terminated");
                return;
            }
            match slot.pending.take() {
                Some(frame) => frame,
                None => continue,
            }
        };

        pool.begin_analysis(&frame.buffer);

        if let Some(max_age) = options.max_frame_age {
            let age = frame.captured_at.elapsed();
            if age > max_age {
                debug!(id = frame.id, ?age, "Discarding stale frame");
                shared.counters.stale();
                pool.recycle(frame.buffer);
                continue;
            }
        }

        let view = Frame {
            data: frame.buffer.as_slice(),
            width: session.preview_size.width,
            height: session.preview_size.height,
            format: session.format,
            id: frame.id,
            timestamp: frame.timestamp,
            rotation: session.rotation,
        };

        let started = Instant::now();
        match panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(&view))) {
            Ok(Ok(())) => shared.counters.analyzed(),
            Ok(Err(e)) => {
                error!(id = frame.id, error = %e, "Frame analyzer failed");
                shared.counters.failed();
            }
            Err(_) => {
                error!(id = frame.id, "Frame analyzer panicked");
                shared.counters.failed();
            }
        }
        metrics::histogram!("camsource_analysis_time_us").record(started.elapsed().as_micros() as f64);

        pool.recycle(frame.buffer);
    }
}
