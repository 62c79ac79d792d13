//! Puts generated faces back into their frames and restores frame order.

use std::collections::BTreeMap;

use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::batch::Batch;
use crate::error::{PipelineError, Result};
use crate::face::FaceRegion;

/// Resize `face` to `region` and paste it over a copy of `frame`
pub fn composite(frame: &RgbImage, face: &RgbImage, region: FaceRegion) -> RgbImage {
    let mut out = frame.clone();
    let Some(region) = region.clamp_to(frame.width(), frame.height()) else {
        return out;
    };
    let resized = if face.dimensions() == (region.width, region.height) {
        face.clone()
    } else {
        imageops::resize(face, region.width, region.height, FilterType::Lanczos3)
    };
    imageops::replace(&mut out, &resized, region.x as i64, region.y as i64);
    out
}

/// Composite one model output per batch entry, keeping each entry's frame index
pub fn reconstruct_batch(batch: &Batch, outputs: &[RgbImage]) -> Result<Vec<(usize, RgbImage)>> {
    if outputs.len() != batch.len() {
        return Err(PipelineError::external(
            "inference",
            format!("expected {} faces, got {}", batch.len(), outputs.len()),
        ));
    }
    Ok(batch
        .entries
        .iter()
        .zip(outputs)
        .map(|(entry, face)| (entry.index, composite(&entry.frame, face, entry.face.detected)))
        .collect())
}

/// Reorders frames that arrive out of order.
///
/// Frames are released strictly by index, starting at 0.
#[derive(Debug)]
pub struct FrameSequencer {
    next: usize,
    expected: usize,
    held: BTreeMap<usize, RgbImage>,
}

impl FrameSequencer {
    pub fn new(expected: usize) -> Self {
        FrameSequencer {
            next: 0,
            expected,
            held: BTreeMap::new(),
        }
    }

    /// Next index that will be released
    pub fn next_index(&self) -> usize {
        self.next
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Accept one frame and return every frame that is now in order
    pub fn push(&mut self, index: usize, frame: RgbImage) -> Result<Vec<RgbImage>> {
        if index >= self.expected {
            return Err(PipelineError::Validation(format!(
                "frame index {} out of range (expected {} frames)",
                index, self.expected
            )));
        }
        if index < self.next || self.held.contains_key(&index) {
            return Err(PipelineError::Validation(format!("frame {} delivered twice", index)));
        }
        self.held.insert(index, frame);

        let mut ready = Vec::new();
        while let Some(frame) = self.held.remove(&self.next) {
            ready.push(frame);
            self.next += 1;
        }
        Ok(ready)
    }

    /// Fails when any frame never arrived
    pub fn finish(self) -> Result<usize> {
        if self.next != self.expected {
            return Err(PipelineError::Validation(format!(
                "frame sequence incomplete: frame {} missing ({} of {} released)",
                self.next, self.next, self.expected
            )));
        }
        Ok(self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::AlignmentWindow;
    use crate::batch::{schedule, Emission, FacePlacement, FrameInput};
    use ndarray::Array2;
    use proptest::prelude::*;

    fn solid(w: u32, h: u32, v: u8) -> RgbImage {
        RgbImage::from_pixel(w, h, image::Rgb([v, v, v]))
    }

    #[test]
    fn test_composite_only_touches_region() {
        let frame = solid(40, 30, 10);
        let face = solid(8, 8, 200);
        let region = FaceRegion::new(10, 5, 16, 12);
        let out = composite(&frame, &face, region);

        assert_eq!(out.dimensions(), (40, 30));
        assert_eq!(out.get_pixel(0, 0)[0], 10);
        assert_eq!(out.get_pixel(39, 29)[0], 10);
        assert_eq!(out.get_pixel(9, 5)[0], 10);
        assert_eq!(out.get_pixel(26, 5)[0], 10);
        assert!(out.get_pixel(18, 10)[0] > 190);
    }

    #[test]
    fn test_composite_clamps_to_frame() {
        let frame = solid(20, 20, 0);
        let out = composite(&frame, &solid(4, 4, 255), FaceRegion::new(15, 15, 10, 10));
        assert!(out.get_pixel(19, 19)[0] >= 250);
        assert_eq!(out.get_pixel(14, 14)[0], 0);
    }

    #[test]
    fn test_padded_crop_pastes_into_detected_box() {
        let detected = FaceRegion::new(8, 8, 8, 8);
        let placement = FacePlacement::new(detected, 0.5, 32, 32).unwrap();
        let inputs = vec![FrameInput {
            index: 0,
            frame: solid(32, 32, 10),
            window: AlignmentWindow {
                frame_index: 0,
                source_index: 0,
                features: Array2::zeros((2, 2)),
            },
            face: Some(placement),
        }];
        let emissions = schedule(inputs, 4).unwrap();
        let Emission::Batch(batch) = &emissions[0] else {
            panic!("expected a batch");
        };
        let (_, frame) = reconstruct_batch(batch, &[solid(6, 6, 255)]).unwrap().remove(0);
        assert!(frame.get_pixel(8, 8)[0] >= 250);
        assert!(frame.get_pixel(15, 15)[0] >= 250);
        // Padding ring keeps the original background
        assert_eq!(frame.get_pixel(7, 7)[0], 10);
        assert_eq!(frame.get_pixel(16, 16)[0], 10);
        assert_eq!(frame.get_pixel(placement.crop.x, placement.crop.y)[0], 10);
    }

    #[test]
    fn test_sequencer_releases_in_order() {
        let mut seq = FrameSequencer::new(4);
        assert!(seq.push(2, solid(1, 1, 2)).unwrap().is_empty());
        assert!(seq.push(1, solid(1, 1, 1)).unwrap().is_empty());
        let ready = seq.push(0, solid(1, 1, 0)).unwrap();
        assert_eq!(ready.iter().map(|f| f.get_pixel(0, 0)[0]).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(seq.push(1, solid(1, 1, 1)).is_err());
        assert_eq!(seq.push(3, solid(1, 1, 3)).unwrap().len(), 1);
        assert_eq!(seq.finish().unwrap(), 4);
    }

    #[test]
    fn test_sequencer_detects_missing_frame() {
        let mut seq = FrameSequencer::new(3);
        seq.push(0, solid(1, 1, 0)).unwrap();
        seq.push(2, solid(1, 1, 2)).unwrap();
        assert!(seq.finish().is_err());
        assert!(FrameSequencer::new(1).push(5, solid(1, 1, 0)).is_err());
    }

    #[test]
    fn test_output_count_must_match_batch() {
        let inputs = (0..3).map(|i| FrameInput {
            index: i,
            frame: solid(16, 16, 0),
            window: AlignmentWindow {
                frame_index: i,
                source_index: i,
                features: Array2::zeros((2, 2)),
            },
            face: Some(FacePlacement::exact(FaceRegion::new(0, 0, 8, 8))),
        });
        let emissions = schedule(inputs, 8).unwrap();
        let Emission::Batch(batch) = &emissions[0] else {
            panic!("expected a batch");
        };
        assert!(reconstruct_batch(batch, &[solid(8, 8, 1)]).is_err());
        assert_eq!(reconstruct_batch(batch, &vec![solid(8, 8, 1); 3]).unwrap().len(), 3);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Mixed pass-through and batched frames come out in original order,
        /// and pass-through frames are pixel-identical to their inputs
        #[test]
        fn test_order_and_pass_through_identity(
            faces in proptest::collection::vec(any::<bool>(), 1..120),
            max in 1usize..10,
        ) {
            let frames: Vec<RgbImage> = (0..faces.len()).map(|i| solid(12, 12, i as u8)).collect();
            let inputs = faces.iter().enumerate().map(|(i, &f)| FrameInput {
                index: i,
                frame: frames[i].clone(),
                window: AlignmentWindow {
                    frame_index: i,
                    source_index: i,
                    features: Array2::zeros((2, 2)),
                },
                face: f.then(|| FacePlacement::exact(FaceRegion::new(2, 2, 6, 6))),
            });

            let mut seq = FrameSequencer::new(faces.len());
            let mut out = Vec::new();
            for emission in schedule(inputs, max).unwrap() {
                match emission {
                    Emission::PassThrough { index, frame } => out.extend(seq.push(index, frame).unwrap()),
                    Emission::Batch(batch) => {
                        // Stand-in model output: faces painted 255
                        let faces_out = vec![solid(6, 6, 255); batch.len()];
                        for (index, frame) in reconstruct_batch(&batch, &faces_out).unwrap() {
                            out.extend(seq.push(index, frame).unwrap());
                        }
                    }
                }
            }
            prop_assert_eq!(seq.finish().unwrap(), faces.len());
            prop_assert_eq!(out.len(), faces.len());

            for (i, frame) in out.iter().enumerate() {
                // Corner pixel is outside every face region, so it identifies the frame
                prop_assert_eq!(frame.get_pixel(0, 0)[0], i as u8);
                if faces[i] {
                    prop_assert_eq!(frame.get_pixel(4, 4)[0], 255);
                } else {
                    prop_assert_eq!(frame, &frames[i]);
                }
            }
        }
    }
}
