use anyhow::Result;
use image::RgbImage;
use ndarray::Array2;

use crate::error::PipelineError;

/// One face crop with the audio window it should be synced to
#[derive(Debug, Clone)]
pub struct InferenceInput {
    pub face_crop: RgbImage,
    /// Shape: [window_width, n_mels]
    pub features: Array2<f32>,
}

/// Lip-sync model seam.
///
/// Implementations return one reconstructed face per input, in input order.
/// Calls may block; the pipeline runs them off the async runtime.
pub trait LipSyncModel: Send + Sync {
    fn name(&self) -> &str;

    fn infer(&self, batch: &[InferenceInput]) -> Result<Vec<RgbImage>>;
}

/// Hands the crops back unchanged
#[derive(Debug, Clone, Default)]
pub struct IdentityModel;

impl LipSyncModel for IdentityModel {
    fn name(&self) -> &str {
        "identity"
    }

    fn infer(&self, batch: &[InferenceInput]) -> Result<Vec<RgbImage>> {
        Ok(batch.iter().map(|input| input.face_crop.clone()).collect())
    }
}

/// Call the model and check it honoured the one-output-per-input contract
pub fn run_inference(
    model: &dyn LipSyncModel,
    batch: &[InferenceInput],
) -> std::result::Result<Vec<RgbImage>, PipelineError> {
    let outputs = model
        .infer(batch)
        .map_err(|e| PipelineError::external("inference", format!("{}: {:#}", model.name(), e)))?;
    if outputs.len() != batch.len() {
        return Err(PipelineError::external(
            "inference",
            format!(
                "{} returned {} faces for a batch of {}",
                model.name(),
                outputs.len(),
                batch.len()
            ),
        ));
    }
    Ok(outputs)
}
