use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::StepBy;
use std::slice;
use std::time::Duration;

/// Width/height pair as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Preview pixel formats we can hand to an analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Nv21,
    Nv12,
    Yuyv,
}

impl PixelFormat {
    pub const fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Nv21 | PixelFormat::Nv12 => 12,
            PixelFormat::Yuyv => 16,
        }
    }
}

/// Frame rotation relative to the display, in quarter turns (0..=3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rotation(u8);

impl Rotation {
    pub const DEG_0: Rotation = Rotation(0);
    pub const DEG_90: Rotation = Rotation(1);
    pub const DEG_180: Rotation = Rotation(2);
    pub const DEG_270: Rotation = Rotation(3);

    /// Snaps an angle in degrees to the nearest lower quarter turn.
    pub fn from_degrees(degrees: u32) -> Self {
        Rotation(((degrees % 360) / 90) as u8)
    }

    pub fn quarter_turns(self) -> u8 {
        self.0
    }

    pub fn degrees(self) -> u32 {
        u32::from(self.0) * 90
    }
}

/// A captured preview frame as seen by an analyzer.
///
/// Borrows the pool buffer for the duration of one analyzer call; the buffer
/// goes back to the driver as soon as the call returns.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Per-received-frame counter; gaps mean frames were dropped.
    pub id: u64,
    /// Elapsed time since the pipeline started.
    pub timestamp: Duration,
    pub rotation: Rotation,
}

impl Frame<'_> {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Luma samples: the first plane of NV12/NV21, every even byte of YUYV.
    pub fn luma(&self) -> StepBy<slice::Iter<'_, u8>> {
        let plane = (self.width as usize).saturating_mul(self.height as usize);
        match self.format {
            PixelFormat::Nv21 | PixelFormat::Nv12 => {
                self.data[..plane.min(self.data.len())].iter().step_by(1)
            }
            PixelFormat::Yuyv => {
                let packed = plane.saturating_mul(2).min(self.data.len());
                self.data[..packed].iter().step_by(2)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_from_degrees() {
        assert_eq!(Rotation::from_degrees(0), Rotation::DEG_0);
        assert_eq!(Rotation::from_degrees(90), Rotation::DEG_90);
        assert_eq!(Rotation::from_degrees(270), Rotation::DEG_270);
        assert_eq!(Rotation::from_degrees(360), Rotation::DEG_0);
        assert_eq!(Rotation::DEG_180.degrees(), 180);
    }

    #[test]
    fn planar_luma_is_first_plane() {
        let data = vec![7u8; 4 * 2 * 3 / 2];
        let frame = Frame {
            data: &data,
            width: 4,
            height: 2,
            format: PixelFormat::Nv21,
            id: 1,
            timestamp: Duration::ZERO,
            rotation: Rotation::DEG_0,
        };
        assert_eq!(frame.luma().count(), 8);
    }

    #[test]
    fn packed_luma_skips_chroma() {
        // Y0 U Y1 V for a 2x1 image.
        let data = [10u8, 200, 30, 100];
        let frame = Frame {
            data: &data,
            width: 2,
            height: 1,
            format: PixelFormat::Yuyv,
            id: 1,
            timestamp: Duration::ZERO,
            rotation: Rotation::DEG_0,
        };
        assert_eq!(frame.luma().copied().collect::<Vec<_>>(), vec![10, 30]);
    }
}
