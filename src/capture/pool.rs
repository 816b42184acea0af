//! Fixed arena of preview buffers shared between the driver and the pipeline.
//!
//! A buffer is a plain owned byte region that moves by value between the
//! driver, the pending-frame slot and the consumer thread, so only one side
//! can ever touch it. The pool keeps a per-slot state word purely for
//! bookkeeping and to recognise buffers that belong to an older session.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use tracing::{debug, error, info};

use super::driver::BufferQueue;
use crate::error::{CameraError, Result};

/// Number of preview buffers kept in circulation.
pub const DEFAULT_BUFFER_COUNT: usize = 4;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    pub generation: u64,
    pub index: u32,
}

/// A preview buffer. Drivers write into it, analyzers read it.
pub struct RawBuffer {
    id: BufferId,
    data: Box<[u8]>,
}

impl RawBuffer {
    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// A buffer that does not belong to any pool. Drivers and tests use it to
    /// model foreign or stale memory.
    pub fn detached(len: usize) -> Self {
        Self {
            id: BufferId {
                generation: 0,
                index: u32::MAX,
            },
            data: vec![0; len].into_boxed_slice(),
        }
    }
}

impl fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBuffer")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum SlotState {
    Available = 0,
    Loaned = 1,
    Pending = 2,
    Analyzing = 3,
    Released = 4,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SlotState::Available,
            1 => SlotState::Loaned,
            2 => SlotState::Pending,
            3 => SlotState::Analyzing,
            _ => SlotState::Released,
        }
    }
}

/// Where every buffer of the pool currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCensus {
    pub available: usize,
    pub loaned: usize,
    pub pending: usize,
    pub analyzing: usize,
    pub released: usize,
}

impl PoolCensus {
    pub fn total(&self) -> usize {
        self.available + self.loaned + self.pending + self.analyzing + self.released
    }
}

/// Owns the slot bookkeeping for one streaming session.
pub struct BufferPool {
    generation: u64,
    buffer_len: usize,
    slots: Box<[CachePadded<AtomicU8>]>,
    queue: Arc<dyn BufferQueue>,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("generation", &self.generation)
            .field("buffer_len", &self.buffer_len)
            .field("census", &self.census())
            .finish()
    }
}

impl BufferPool {
    /// Allocates `count` buffers of `len` bytes and loans all of them to the
    /// driver queue. Nothing is loaned unless every allocation succeeds.
    pub fn allocate(count: usize, len: u64, queue: Arc<dyn BufferQueue>) -> Result<Self> {
        let len = usize::try_from(len).map_err(|_| {
            CameraError::BufferIntegrity(format!("{len} bytes is not addressable"))
        })?;
        if count == 0 || len == 0 {
            return Err(CameraError::BufferIntegrity(format!(
                "cannot create {count} buffers of {len} bytes"
            )));
        }

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let mut buffers = Vec::with_capacity(count);
        for index in 0..count {
            let mut data = Vec::new();
            data.try_reserve_exact(len)
                .map_err(|e| CameraError::BufferIntegrity(e.to_string()))?;
            data.resize(len, 0);
            let data = data.into_boxed_slice();
            if data.len() != len {
                return Err(CameraError::BufferIntegrity(format!(
                    "buffer {index} has {} bytes, expected {len}",
                    data.len()
                )));
            }
            buffers.push(RawBuffer {
                id: BufferId {
                    generation,
                    index: index as u32,
                },
                data,
            });
        }

        let slots = (0..count)
            .map(|_| CachePadded::new(AtomicU8::new(SlotState::Available as u8)))
            .collect();
        let pool = Self {
            generation,
            buffer_len: len,
            slots,
            queue,
        };

        for buffer in buffers {
            pool.loan(buffer);
        }
        info!(generation, count, buffer_len = len, "Preview buffers registered");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn slot(&self, id: BufferId) -> Option<&AtomicU8> {
        if id.generation != self.generation {
            return None;
        }
        self.slots.get(id.index as usize).map(|slot| &**slot)
    }

    fn transition(&self, id: BufferId, from: SlotState, to: SlotState) -> bool {
        self.slot(id).is_some_and(|slot| {
            slot.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    fn loan(&self, buffer: RawBuffer) {
        self.slots[buffer.id.index as usize].store(SlotState::Loaned as u8, Ordering::Release);
        self.queue.enqueue(buffer);
    }

    /// Maps a buffer handed back by the driver to its pool slot.
    ///
    /// Buffers from another session, or that this pool never loaned, are
    /// returned as `Err` for the caller to discard.
    pub fn resolve(&self, buffer: RawBuffer) -> std::result::Result<RawBuffer, RawBuffer> {
        if self.transition(buffer.id, SlotState::Loaned, SlotState::Pending) {
            Ok(buffer)
        } else {
            Err(buffer)
        }
    }

    /// Marks a pending buffer as being read by the consumer.
    pub fn begin_analysis(&self, buffer: &RawBuffer) {
        if !self.transition(buffer.id, SlotState::Pending, SlotState::Analyzing) {
            debug!(id = ?buffer.id, "Buffer was not pending when analysis began");
        }
    }

    /// Hands a buffer back to the driver's capture queue.
    ///
    /// Buffers of a released pool are dropped, and a buffer that is already on
    /// loan is never queued a second time.
    pub fn recycle(&self, buffer: RawBuffer) {
        let Some(slot) = self.slot(buffer.id) else {
            debug!(id = ?buffer.id, "Dropping buffer that does not belong to this pool");
            return;
        };
        let current = slot.load(Ordering::Acquire);
        match SlotState::from_u8(current) {
            SlotState::Released => {
                debug!(id = ?buffer.id, "Dropping buffer of released pool");
            }
            SlotState::Loaned => {
                error!(id = ?buffer.id, "Buffer returned while already on loan, dropping it; pool capacity reduced");
            }
            SlotState::Available | SlotState::Pending | SlotState::Analyzing => {
                if slot
                    .compare_exchange(current, SlotState::Loaned as u8, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.queue.enqueue(buffer);
                } else {
                    debug!(id = ?buffer.id, "Pool released while recycling, dropping buffer");
                }
            }
        }
    }

    /// Forgets every buffer. Later resolves fail and recycled buffers are
    /// dropped instead of being queued.
    pub fn release_all(&self) {
        for slot in self.slots.iter() {
            slot.store(SlotState::Released as u8, Ordering::Release);
        }
        debug!(generation = self.generation, "Buffer associations cleared");
    }

    pub fn census(&self) -> PoolCensus {
        let mut census = PoolCensus::default();
        for slot in self.slots.iter() {
            match SlotState::from_u8(slot.load(Ordering::Acquire)) {
                SlotState::Available => census.available += 1,
                SlotState::Loaned => census.loaned += 1,
                SlotState::Pending => census.pending += 1,
                SlotState::Analyzing => census.analyzing += 1,
                SlotState::Released => census.released += 1,
            }
        }
        census
    }
}
