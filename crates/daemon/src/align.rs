//! Maps an audio feature sequence onto the output video frames.
//!
//! The video frame count decides the output length. Audio rows are
//! index-mapped onto frames, never time-stretched.

use ndarray::{s, Array2, ArrayView2};

use crate::error::{PipelineError, Result};

/// Fixed-width feature slice owned by one output frame
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentWindow {
    pub frame_index: usize,
    /// Row of the feature sequence this frame was mapped to
    pub source_index: usize,
    /// Shape: [window_width, n_features]
    pub features: Array2<f32>,
}

/// `floor(frame * rows / frame_count)`
pub fn source_index(frame: usize, frame_count: usize, rows: usize) -> usize {
    if frame_count == 0 {
        return 0;
    }
    ((frame as u128 * rows as u128) / frame_count as u128) as usize
}

/// Slice `width` rows starting at `start`, repeating the last row past the end
fn window_at(features: ArrayView2<'_, f32>, start: usize, width: usize) -> Array2<f32> {
    let rows = features.nrows();
    let cols = features.ncols();
    let end = (start + width).min(rows);

    let mut window = Array2::<f32>::zeros((width, cols));
    let available = end - start;
    window
        .slice_mut(s![..available, ..])
        .assign(&features.slice(s![start..end, ..]));

    if available < width {
        let last = features.row(rows - 1);
        for r in available..width {
            window.row_mut(r).assign(&last);
        }
    }
    window
}

/// One window per frame for `frame_count` frames.
///
/// Window `i` starts at `max(0, source_index(i) - width / 2)`.
pub fn align(
    features: &Array2<f32>,
    frame_count: usize,
    window_width: usize,
) -> Result<Vec<AlignmentWindow>> {
    if window_width == 0 {
        return Err(PipelineError::Validation("window width must be greater than zero".into()));
    }
    let rows = features.nrows();
    if rows == 0 && frame_count > 0 {
        return Err(PipelineError::Validation("audio feature sequence is empty".into()));
    }

    let half = window_width / 2;
    let windows = (0..frame_count)
        .map(|frame| {
            let mapped = source_index(frame, frame_count, rows);
            let start = mapped.saturating_sub(half);
            AlignmentWindow {
                frame_index: frame,
                source_index: mapped,
                features: window_at(features.view(), start, window_width),
            }
        })
        .collect();
    Ok(windows)
}
