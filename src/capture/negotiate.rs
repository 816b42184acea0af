//! Resolution and frame-rate negotiation against driver capabilities.
//!
//! Everything here is a pure function of the driver's capability lists, so
//! selection is deterministic for a fixed listing order.

use tracing::warn;

use super::config::Facing;
use super::driver::CameraInfo;
use super::frame::{PixelFormat, Rotation, Size};

/// Preview and picture aspect ratios closer than this are considered equal.
pub const ASPECT_RATIO_TOLERANCE: f32 = 0.01;

/// Drivers express frame rates in thousandths of a frame per second.
pub const FPS_SCALE: f32 = 1000.0;

/// A preview size and the still picture size sharing its aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizePair {
    pub preview: Size,
    pub picture: Option<Size>,
}

/// Supported frame rate bounds, in the driver's scaled unit (fps * 1000).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpsRange {
    pub min: i32,
    pub max: i32,
}

impl FpsRange {
    pub const fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    /// Single-rate range, as reported by drivers with discrete intervals.
    pub fn fixed(fps: f32) -> Self {
        let scaled = scale_fps(fps);
        Self::new(scaled, scaled)
    }
}

fn scale_fps(fps: f32) -> i32 {
    (fps * FPS_SCALE) as i32
}

/// Preview sizes that have a same-aspect picture size, paired with the first
/// such picture size. Falls back to every preview size without a picture size.
fn valid_size_pairs(preview_sizes: &[Size], picture_sizes: &[Size]) -> Vec<SizePair> {
    let mut pairs: Vec<SizePair> = preview_sizes
        .iter()
        .filter_map(|preview| {
            let ratio = preview.aspect_ratio();
            picture_sizes
                .iter()
                .find(|picture| (ratio - picture.aspect_ratio()).abs() < ASPECT_RATIO_TOLERANCE)
                .map(|picture| SizePair {
                    preview: *preview,
                    picture: Some(*picture),
                })
        })
        .collect();

    if pairs.is_empty() {
        warn!("No preview sizes have a corresponding same-aspect-ratio picture size");
        pairs = preview_sizes
            .iter()
            .map(|preview| SizePair {
                preview: *preview,
                picture: None,
            })
            .collect();
    }

    pairs
}

/// Picks the size pair whose preview size is closest to the desired size
/// (L1 distance over width and height). The first minimum wins.
pub fn select_size_pair(
    preview_sizes: &[Size],
    picture_sizes: &[Size],
    desired_width: u32,
    desired_height: u32,
) -> Option<SizePair> {
    let mut selected = None;
    let mut min_diff = u64::MAX;
    for pair in valid_size_pairs(preview_sizes, picture_sizes) {
        let diff = u64::from(pair.preview.width.abs_diff(desired_width))
            + u64::from(pair.preview.height.abs_diff(desired_height));
        if diff < min_diff {
            selected = Some(pair);
            min_diff = diff;
        }
    }
    selected
}

/// Picks the range minimising `|desired - min| + |desired - max|`, compared in
/// the driver's integer unit.
pub fn select_fps_range(ranges: &[FpsRange], desired_fps: f32) -> Option<FpsRange> {
    let desired = i64::from(scale_fps(desired_fps));
    let mut selected = None;
    let mut min_diff = i64::MAX;
    for range in ranges {
        let diff = (desired - i64::from(range.min)).abs() + (desired - i64::from(range.max)).abs();
        if diff < min_diff {
            selected = Some(*range);
            min_diff = diff;
        }
    }
    selected
}

/// Bytes needed for one preview frame, rounded up to whole bytes.
pub fn preview_buffer_len(size: Size, format: PixelFormat) -> u64 {
    let bits = u64::from(size.width) * u64::from(size.height) * u64::from(format.bits_per_pixel());
    bits.div_ceil(8)
}

/// Orientation to program into the device for a given display rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Orientation {
    /// Rotation analyzers must apply to see the frame upright.
    pub rotation: Rotation,
    /// Clockwise angle for the preview display, mirrored for front cameras.
    pub display_angle: u32,
    /// Angle to tag still pictures with.
    pub picture_angle: u32,
}

/// Combines the sensor mounting angle with the current display rotation.
pub fn orientation_for(info: &CameraInfo, display_rotation: Rotation) -> Orientation {
    let degrees = display_rotation.degrees();
    let sensor = info.orientation % 360;
    let (angle, display_angle) = match info.facing {
        Facing::Front => {
            let angle = (sensor + degrees) % 360;
            (angle, (360 - angle) % 360)
        }
        Facing::Back => {
            let angle = (sensor + 360 - degrees) % 360;
            (angle, angle)
        }
    };
    Orientation {
        rotation: Rotation::from_degrees(angle),
        display_angle,
        picture_angle: angle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(list: &[(u32, u32)]) -> Vec<Size> {
        list.iter().map(|&(w, h)| Size::new(w, h)).collect()
    }

    #[test]
    fn exact_preview_match_wins() {
        let previews = sizes(&[(640, 480), (1280, 960), (1024, 768)]);
        let pair = select_size_pair(&previews, &previews, 1024, 768).unwrap();
        assert_eq!(pair.preview, Size::new(1024, 768));
        assert_eq!(pair.picture, Some(Size::new(640, 480)));
    }

    #[test]
    fn picture_is_first_aspect_match_in_driver_order() {
        let previews = sizes(&[(1280, 720)]);
        let pictures = sizes(&[(4000, 3000), (3840, 2160), (1920, 1080)]);
        let pair = select_size_pair(&previews, &pictures, 1280, 720).unwrap();
        assert_eq!(pair.picture, Some(Size::new(3840, 2160)));
    }

    #[test]
    fn previews_without_matching_picture_are_not_candidates() {
        // 1024x768 is closest but only 16:9 pictures exist.
        let previews = sizes(&[(1024, 768), (1920, 1080)]);
        let pictures = sizes(&[(3840, 2160)]);
        let pair = select_size_pair(&previews, &pictures, 1024, 768).unwrap();
        assert_eq!(pair.preview, Size::new(1920, 1080));
    }

    #[test]
    fn falls_back_to_all_previews_without_pictures() {
        let previews = sizes(&[(800, 600), (1024, 768)]);
        let pictures = sizes(&[(3840, 2160)]);
        let pair = select_size_pair(&previews, &pictures, 1000, 700).unwrap();
        assert_eq!(pair.preview, Size::new(1024, 768));
        assert_eq!(pair.picture, None);
    }

    #[test]
    fn selection_is_member_of_supplied_list() {
        let previews = sizes(&[(176, 144), (320, 240), (352, 288), (1920, 1080)]);
        for (w, h) in [(1, 1), (333, 250), (5000, 5000), (1_000_000, 1)] {
            let pair = select_size_pair(&previews, &previews, w, h).unwrap();
            assert!(previews.contains(&pair.preview));
            let picture = pair.picture.unwrap();
            assert!((pair.preview.aspect_ratio() - picture.aspect_ratio()).abs() < 0.01);
        }
    }

    #[test]
    fn ties_resolve_to_first_candidate() {
        let previews = sizes(&[(600, 400), (400, 600)]);
        let pair = select_size_pair(&previews, &[], 500, 500).unwrap();
        assert_eq!(pair.preview, Size::new(600, 400));
    }

    #[test]
    fn empty_preview_list_selects_nothing() {
        assert!(select_size_pair(&[], &sizes(&[(640, 480)]), 640, 480).is_none());
    }

    #[test]
    fn fps_range_uses_scaled_l1_distance() {
        let ranges = [FpsRange::new(10000, 20000), FpsRange::new(25000, 30000)];
        assert_eq!(select_fps_range(&ranges, 29.97), Some(FpsRange::new(25000, 30000)));
    }

    #[test]
    fn fps_range_prefers_tight_range_around_target() {
        let ranges = [
            FpsRange::new(15000, 30000),
            FpsRange::new(30000, 30000),
            FpsRange::new(7000, 60000),
        ];
        assert_eq!(select_fps_range(&ranges, 30.0), Some(FpsRange::new(30000, 30000)));
    }

    #[test]
    fn fps_range_empty_list_selects_nothing() {
        assert_eq!(select_fps_range(&[], 30.0), None);
    }

    #[test]
    fn nv21_buffer_len_rounds_up() {
        assert_eq!(preview_buffer_len(Size::new(1024, 768), PixelFormat::Nv21), 1_179_648);
        assert_eq!(preview_buffer_len(Size::new(3, 1), PixelFormat::Nv21), 5);
        assert_eq!(preview_buffer_len(Size::new(2, 2), PixelFormat::Yuyv), 8);
    }

    #[test]
    fn orientation_for_back_camera() {
        let info = CameraInfo::new("0", Facing::Back, 90);
        let o = orientation_for(&info, Rotation::DEG_0);
        assert_eq!(o.rotation, Rotation::DEG_90);
        assert_eq!(o.display_angle, 90);

        let o = orientation_for(&info, Rotation::DEG_270);
        assert_eq!(o.picture_angle, 180);
        assert_eq!(o.rotation, Rotation::DEG_180);
    }

    #[test]
    fn orientation_for_front_camera_is_mirrored() {
        let info = CameraInfo::new("1", Facing::Front, 270);
        let o = orientation_for(&info, Rotation::DEG_0);
        assert_eq!(o.rotation, Rotation::DEG_270);
        assert_eq!(o.display_angle, 90);

        let o = orientation_for(&info, Rotation::DEG_90);
        assert_eq!(o.picture_angle, 0);
        assert_eq!(o.display_angle, 0);
    }
}
