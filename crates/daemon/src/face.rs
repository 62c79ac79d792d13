use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned face bounding box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        FaceRegion { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect with a `frame_width` x `frame_height` frame.
    ///
    /// Returns None when nothing of the box lies inside the frame.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<FaceRegion> {
        if self.x >= frame_width || self.y >= frame_height {
            return None;
        }
        let right = self.x.saturating_add(self.width).min(frame_width);
        let bottom = self.y.saturating_add(self.height).min(frame_height);
        let width = right - self.x;
        let height = bottom - self.y;
        if width == 0 || height == 0 {
            return None;
        }
        Some(FaceRegion::new(self.x, self.y, width, height))
    }

    /// Grow the box by `ratio` of its longer side on every edge, clamped to the frame
    pub fn padded(&self, ratio: f32, frame_width: u32, frame_height: u32) -> Option<FaceRegion> {
        let padding = (self.width.max(self.height) as f32 * ratio.max(0.0)) as u32;
        let x1 = self.x.saturating_sub(padding);
        let y1 = self.y.saturating_sub(padding);
        let x2 = self
            .x
            .saturating_add(self.width)
            .saturating_add(padding)
            .min(frame_width);
        let y2 = self
            .y
            .saturating_add(self.height)
            .saturating_add(padding)
            .min(frame_height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(FaceRegion::new(x1, y1, x2 - x1, y2 - y1))
    }
}

/// Face-detection service seam.
///
/// An empty result is a normal outcome: the frame passes through untouched.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<FaceRegion>>;
}

/// Drop faces smaller than `min_size` on either side, then keep the largest
pub fn select_face(detections: &[FaceRegion], min_size: u32) -> Option<FaceRegion> {
    detections
        .iter()
        .filter(|f| f.width >= min_size && f.height >= min_size)
        .max_by_key(|f| f.area())
        .copied()
}

/// Detect and select the face for one frame, treating detector errors as a miss
pub fn locate_face(
    detector: &dyn FaceDetector,
    frame: &RgbImage,
    min_size: u32,
    frame_index: usize,
) -> Option<FaceRegion> {
    use log::{debug, warn};

    let detections = match detector.detect(frame) {
        Ok(d) => d,
        Err(e) => {
            warn!("Face detection failed on frame {}: {:#}", frame_index, e);
            return None;
        }
    };

    let face = select_face(&detections, min_size)
        .and_then(|f| f.clamp_to(frame.width(), frame.height()));
    if face.is_none() {
        debug!("No usable face in frame {} ({} detections)", frame_index, detections.len());
    }
    face
}

/// Detector that reports a known face location on every frame.
///
/// Used when the job or the avatar pins where the face is.
#[derive(Debug, Clone)]
pub struct FixedRegionDetector {
    region: FaceRegion,
}

impl FixedRegionDetector {
    pub fn new(region: FaceRegion) -> Self {
        FixedRegionDetector { region }
    }
}

impl FaceDetector for FixedRegionDetector {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<FaceRegion>> {
        Ok(self
            .region
            .clamp_to(frame.width(), frame.height())
            .into_iter()
            .collect())
    }
}

/// Detector that never finds a face
#[derive(Debug, Clone, Default)]
pub struct NoFaceDetector;

impl FaceDetector for NoFaceDetector {
    fn detect(&self, _frame: &RgbImage) -> Result<Vec<FaceRegion>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct FailingDetector;

    impl FaceDetector for FailingDetector {
        fn detect(&self, _frame: &RgbImage) -> Result<Vec<FaceRegion>> {
            anyhow::bail!("detector offline")
        }
    }

    #[test]
    fn test_select_face_prefers_largest_above_minimum() {
        let faces = vec![
            FaceRegion::new(0, 0, 50, 50),
            FaceRegion::new(10, 10, 120, 100),
            FaceRegion::new(20, 20, 100, 130),
            FaceRegion::new(30, 30, 300, 40),
        ];
        assert_eq!(select_face(&faces, 96), Some(FaceRegion::new(20, 20, 100, 130)));
        assert_eq!(select_face(&faces[..1], 96), None);
    }

    #[test]
    fn test_clamp_outside_frame_is_none() {
        assert_eq!(FaceRegion::new(100, 0, 10, 10).clamp_to(100, 100), None);
        assert_eq!(
            FaceRegion::new(90, 95, 20, 20).clamp_to(100, 100),
            Some(FaceRegion::new(90, 95, 10, 5))
        );
    }

    #[test]
    fn test_detector_error_is_a_miss() {
        let frame = RgbImage::new(64, 64);
        assert_eq!(locate_face(&FailingDetector, &frame, 1, 0), None);
        assert_eq!(locate_face(&NoFaceDetector, &frame, 1, 0), None);
    }

    #[test]
    fn test_fixed_detector_clamps_to_frame() {
        let frame = RgbImage::new(64, 48);
        let detector = FixedRegionDetector::new(FaceRegion::new(40, 30, 40, 40));
        assert_eq!(
            locate_face(&detector, &frame, 1, 3),
            Some(FaceRegion::new(40, 30, 24, 18))
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// A padded box always contains the original box and stays inside the frame
        #[test]
        fn test_padded_contains_original(
            x in 0u32..200,
            y in 0u32..200,
            w in 1u32..100,
            h in 1u32..100,
            ratio in 0.0f32..0.5,
        ) {
            let (fw, fh) = (300u32, 300u32);
            let region = FaceRegion::new(x, y, w, h).clamp_to(fw, fh).unwrap();
            let padded = region.padded(ratio, fw, fh).unwrap();
            prop_assert!(padded.x <= region.x && padded.y <= region.y);
            prop_assert!(padded.x + padded.width >= region.x + region.width);
            prop_assert!(padded.y + padded.height >= region.y + region.height);
            prop_assert!(padded.x + padded.width <= fw && padded.y + padded.height <= fh);
        }
    }
}
