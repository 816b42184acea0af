//! Pluggable per-frame analysis.

use std::time::Duration;

use tracing::{debug, info};

use crate::capture::Frame;

pub type AnalyzerError = Box<dyn std::error::Error + Send + Sync>;

/// Inspects preview frames on the pipeline's consumer thread.
///
/// Errors and panics are absorbed by the pipeline: one bad frame never stops
/// the stream. The frame borrows a pool buffer, so anything kept past the
/// call must be copied out.
pub trait FrameAnalyzer: Send {
    fn analyze(&mut self, frame: &Frame<'_>) -> Result<(), AnalyzerError>;

    /// Called once when the owning camera source is released.
    fn release(&mut self) {}
}

impl<F> FrameAnalyzer for F
where
    F: FnMut(&Frame<'_>) -> Result<(), AnalyzerError> + Send,
{
    fn analyze(&mut self, frame: &Frame<'_>) -> Result<(), AnalyzerError> {
        self(frame)
    }
}

/// Mean luma and frame-id continuity, reported periodically.
#[derive(Debug, Default)]
pub struct FrameStatsAnalyzer {
    last_id: Option<u64>,
    analyzed: u64,
    gaps: u64,
    last_report: Duration,
    report_every: Duration,
}

impl FrameStatsAnalyzer {
    pub fn new(report_every: Duration) -> Self {
        Self {
            report_every,
            ..Default::default()
        }
    }

    pub fn analyzed(&self) -> u64 {
        self.analyzed
    }

    /// Frames that were superseded before this analyzer saw them.
    pub fn skipped_frames(&self) -> u64 {
        self.gaps
    }
}

pub fn mean_luma(frame: &Frame<'_>) -> f64 {
    let (sum, count) = frame
        .luma()
        .fold((0u64, 0u64), |(sum, count), &v| (sum + u64::from(v), count + 1));
    if count == 0 {
        return 0.0;
    }
    sum as f64 / count as f64
}

impl FrameAnalyzer for FrameStatsAnalyzer {
    fn analyze(&mut self, frame: &Frame<'_>) -> Result<(), AnalyzerError> {
        if let Some(last) = self.last_id {
            if frame.id <= last {
                return Err(format!("frame {} arrived after {}", frame.id, last).into());
            }
            self.gaps += frame.id - last - 1;
        }
        self.last_id = Some(frame.id);
        self.analyzed += 1;

        let luma = mean_luma(frame);
        debug!(id = frame.id, luma, "Frame analyzed");

        if frame.timestamp.saturating_sub(self.last_report) >= self.report_every {
            self.last_report = frame.timestamp;
            info!(
                analyzed = self.analyzed,
                skipped = self.gaps,
                luma,
                size = %frame.size(),
                rotation = frame.rotation.degrees(),
                "Analyzer progress"
            );
        }
        Ok(())
    }

    fn release(&mut self) {
        info!(analyzed = self.analyzed, skipped = self.gaps, "Analyzer released");
    }
}
