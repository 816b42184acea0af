//! Frame accounting shared by the producer and the consumer thread

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

#[derive(Default)]
pub(crate) struct Counters {
    received: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    skipped: CachePadded<AtomicU64>,
    stale: CachePadded<AtomicU64>,
    analyzed: CachePadded<AtomicU64>,
    failed: CachePadded<AtomicU64>,
    active_consumers: AtomicUsize,
    peak_consumers: AtomicUsize,
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames accepted from the driver; equals the last issued frame id.
    pub frames_received: u64,
    /// Pending frames superseded by a newer arrival.
    pub frames_dropped: u64,
    /// Buffers the pool could not resolve.
    pub frames_skipped: u64,
    /// Frames discarded for exceeding the configured maximum age.
    pub frames_stale: u64,
    pub frames_analyzed: u64,
    pub analyzer_failures: u64,
    pub active_consumers: usize,
    /// Highest number of consumer loops ever running at once.
    pub peak_consumers: usize,
}

impl Counters {
    pub(crate) fn received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camsource_frames_received").increment(1);
    }

    pub(crate) fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camsource_frames_dropped").increment(1);
    }

    pub(crate) fn skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camsource_frames_skipped").increment(1);
    }

    pub(crate) fn stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camsource_frames_stale").increment(1);
    }

    pub(crate) fn analyzed(&self) {
        self.analyzed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camsource_frames_analyzed").increment(1);
    }

    pub(crate) fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camsource_analyzer_failures").increment(1);
    }

    pub(crate) fn consumer_entered(&self) {
        let active = self.active_consumers.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_consumers.fetch_max(active, Ordering::AcqRel);
    }

    pub(crate) fn consumer_exited(&self) {
        self.active_consumers.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_received: self.received.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            frames_skipped: self.skipped.load(Ordering::Relaxed),
            frames_stale: self.stale.load(Ordering::Relaxed),
            frames_analyzed: self.analyzed.load(Ordering::Relaxed),
            analyzer_failures: self.failed.load(Ordering::Relaxed),
            active_consumers: self.active_consumers.load(Ordering::Acquire),
            peak_consumers: self.peak_consumers.load(Ordering::Acquire),
        }
    }
}

/// Keeps the active consumer count right even if the loop unwinds.
pub(crate) struct ConsumerGuard<'a>(&'a Counters);

impl<'a> ConsumerGuard<'a> {
    pub(crate) fn enter(counters: &'a Counters) -> Self {
        counters.consumer_entered();
        Self(counters)
    }
}

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        self.0.consumer_exited();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_overlapping_consumers() {
        let counters = Counters::default();
        {
            let _a = ConsumerGuard::enter(&counters);
            let _b = ConsumerGuard::enter(&counters);
            assert_eq!(counters.snapshot().active_consumers, 2);
        }
        let _c = ConsumerGuard::enter(&counters);
        let stats = counters.snapshot();
        assert_eq!(stats.active_consumers, 1);
        assert_eq!(stats.peak_consumers, 2);
    }
}
