//! Groups frames with a detected face into inference batches.
//!
//! Frames without a face never enter a batch; they are handed straight back
//! as pass-through emissions.

use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::align::AlignmentWindow;
use crate::error::{PipelineError, Result};
use crate::face::FaceRegion;
use crate::inference::InferenceInput;

/// Where a face was found and what the model gets to see of it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FacePlacement {
    /// Detected box; the generated face is pasted back here
    pub detected: FaceRegion,
    /// Padded box cropped out for the model
    pub crop: FaceRegion,
}

impl FacePlacement {
    /// Pad `detected` by `ratio` for the crop. `None` when the box misses the frame.
    pub fn new(detected: FaceRegion, ratio: f32, frame_width: u32, frame_height: u32) -> Option<Self> {
        let detected = detected.clamp_to(frame_width, frame_height)?;
        let crop = detected.padded(ratio, frame_width, frame_height)?;
        Some(FacePlacement { detected, crop })
    }

    /// Crop and paste share one box
    pub fn exact(region: FaceRegion) -> Self {
        FacePlacement {
            detected: region,
            crop: region,
        }
    }
}

/// One decoded frame with its audio window and (maybe) a face
#[derive(Debug, Clone)]
pub struct FrameInput {
    pub index: usize,
    pub frame: RgbImage,
    pub window: AlignmentWindow,
    pub face: Option<FacePlacement>,
}

#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub index: usize,
    pub frame: RgbImage,
    pub window: AlignmentWindow,
    pub face: FacePlacement,
}

/// Entries in frame order, never more than the scheduler's maximum
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn indices(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.index).collect()
    }

    /// Square face crops of `model_size` paired with their feature windows
    pub fn inference_inputs(&self, model_size: u32) -> Vec<InferenceInput> {
        self.entries
            .iter()
            .map(|entry| {
                let f = entry.face.crop;
                let crop = imageops::crop_imm(&entry.frame, f.x, f.y, f.width, f.height).to_image();
                InferenceInput {
                    face_crop: imageops::resize(&crop, model_size, model_size, FilterType::Triangle),
                    features: entry.window.features.clone(),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum Emission {
    /// No face: the frame goes to the output untouched
    PassThrough { index: usize, frame: RgbImage },
    Batch(Batch),
}

#[derive(Debug)]
pub struct BatchScheduler {
    max_size: usize,
    pending: Batch,
}

impl BatchScheduler {
    pub fn new(max_size: usize) -> Result<Self> {
        if max_size == 0 {
            return Err(PipelineError::Validation("batch size must be greater than zero".into()));
        }
        Ok(BatchScheduler {
            max_size,
            pending: Batch {
                entries: Vec::with_capacity(max_size),
            },
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of entries waiting for the batch to fill
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed the next frame; returns whatever became ready
    pub fn push(&mut self, input: FrameInput) -> Option<Emission> {
        let face = match input.face {
            Some(face) => face,
            None => {
                return Some(Emission::PassThrough {
                    index: input.index,
                    frame: input.frame,
                })
            }
        };

        self.pending.entries.push(BatchEntry {
            index: input.index,
            frame: input.frame,
            window: input.window,
            face,
        });

        if self.pending.len() >= self.max_size {
            let full = std::mem::replace(
                &mut self.pending,
                Batch {
                    entries: Vec::with_capacity(self.max_size),
                },
            );
            return Some(Emission::Batch(full));
        }
        None
    }

    /// Trailing partial batch, if any frames are still waiting
    pub fn finish(self) -> Option<Batch> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending)
        }
    }
}

/// Run a whole frame sequence through a scheduler
pub fn schedule<I>(inputs: I, max_size: usize) -> Result<Vec<Emission>>
where
    I: IntoIterator<Item = FrameInput>,
{
    let mut scheduler = BatchScheduler::new(max_size)?;
    let mut emissions: Vec<Emission> = inputs
        .into_iter()
        .filter_map(|input| scheduler.push(input))
        .collect();
    if let Some(tail) = scheduler.finish() {
        emissions.push(Emission::Batch(tail));
    }
    Ok(emissions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use proptest::prelude::*;

    fn input(index: usize, has_face: bool) -> FrameInput {
        FrameInput {
            index,
            frame: RgbImage::from_pixel(32, 32, image::Rgb([(index * 50 % 256) as u8, 0, 0])),
            window: AlignmentWindow {
                frame_index: index,
                source_index: index,
                features: Array2::zeros((4, 2)),
            },
            face: has_face.then(|| FacePlacement::exact(FaceRegion::new(8, 8, 16, 16))),
        }
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(matches!(BatchScheduler::new(0), Err(PipelineError::Validation(_))));
    }

    #[test]
    fn test_placement_pads_crop_only() {
        let placement = FacePlacement::new(FaceRegion::new(16, 8, 24, 24), 0.2, 64, 48).unwrap();
        assert_eq!(placement.detected, FaceRegion::new(16, 8, 24, 24));
        assert!(placement.crop.width > 24 && placement.crop.x < 16);
        assert!(FacePlacement::new(FaceRegion::new(70, 0, 8, 8), 0.2, 64, 48).is_none());
    }

    #[test]
    fn test_pass_through_is_immediate() {
        let mut scheduler = BatchScheduler::new(4).unwrap();
        assert!(scheduler.push(input(0, true)).is_none());
        match scheduler.push(input(1, false)) {
            Some(Emission::PassThrough { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected pass-through, got {:?}", other.map(|_| ())),
        }
        assert_eq!(scheduler.pending_len(), 1);
    }

    #[test]
    fn test_trailing_partial_batch_kept() {
        let emissions = schedule((0..10).map(|i| input(i, true)), 4).unwrap();
        let sizes: Vec<usize> = emissions
            .iter()
            .map(|e| match e {
                Emission::Batch(b) => b.len(),
                Emission::PassThrough { .. } => 0,
            })
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_inference_inputs_are_square() {
        let emissions = schedule((0..3).map(|i| input(i, true)), 8).unwrap();
        let Emission::Batch(batch) = &emissions[0] else {
            panic!("expected a batch");
        };
        let inputs = batch.inference_inputs(12);
        assert_eq!(inputs.len(), 3);
        assert!(inputs.iter().all(|i| i.face_crop.dimensions() == (12, 12)));
        assert!((inputs[2].face_crop.get_pixel(6, 6)[0] as i32 - 100).abs() <= 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Every frame comes out exactly once, batches respect the cap, and
        /// face-less frames never land in a batch
        #[test]
        fn test_every_frame_accounted_for(
            faces in proptest::collection::vec(any::<bool>(), 0..200),
            max in 1usize..16,
        ) {
            let inputs: Vec<FrameInput> = faces.iter().enumerate().map(|(i, &f)| input(i, f)).collect();
            let emissions = schedule(inputs, max).unwrap();

            let mut seen = vec![false; faces.len()];
            for emission in &emissions {
                match emission {
                    Emission::PassThrough { index, .. } => {
                        prop_assert!(!faces[*index]);
                        prop_assert!(!seen[*index]);
                        seen[*index] = true;
                    }
                    Emission::Batch(batch) => {
                        prop_assert!(!batch.is_empty() && batch.len() <= max);
                        let idx = batch.indices();
                        prop_assert!(idx.windows(2).all(|w| w[0] < w[1]));
                        for i in idx {
                            prop_assert!(faces[i]);
                            prop_assert!(!seen[i]);
                            seen[i] = true;
                        }
                    }
                }
            }
            prop_assert!(seen.iter().all(|&s| s));
        }
    }
}
