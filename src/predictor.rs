use crate::frames::{Frame, FrameError};
use ndarray::{s, Array1, Array2, Array4, ArrayView2};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictorError {
    #[error("Not implemented: {0}")]
    Unsupported(String),
    #[error("Invalid predictor input: {0}")]
    InvalidInput(String),
    #[error("Frame source error: {0}")]
    Frame(#[from] FrameError),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Space the prompt coordinates are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateSpace {
    /// Absolute pixels of the frame the prompt targets.
    Pixels,
    /// Fractions of the frame width and height.
    Normalized,
}

#[derive(Debug, Clone)]
pub struct PointPrompt {
    pub frame_index: usize,
    pub object_id: i64,
    /// `[N, 2]` rows of `(x, y)`.
    pub points: Array2<f32>,
    pub labels: Array1<i32>,
    pub clear_old_points: bool,
    pub coordinates: CoordinateSpace,
}

#[derive(Debug, Clone)]
pub struct PredictorOutput {
    pub frame_index: usize,
    pub object_ids: Vec<i64>,
    /// Raw logits, `[objects, 1, height, width]`, aligned with `object_ids`.
    pub masks: Array4<f32>,
}

impl PredictorOutput {
    pub fn mask_for(&self, object_id: i64) -> Option<ArrayView2<'_, f32>> {
        let index = self.object_ids.iter().position(|id| *id == object_id)?;
        if index >= self.masks.shape()[0] {
            return None;
        }
        Some(self.masks.slice(s![index, 0, .., ..]))
    }
}

/// A promptable video segmentation model.
///
/// The predictor is shared by every session and is not reentrant: callers
/// serialize all access behind one lock. Tracking state is owned by the
/// session and handed in on every call.
pub trait Predictor: Send + Sync + 'static {
    type State: Send + 'static;

    /// `None` builds an empty state that is filled one frame at a time.
    fn init_state(&self, source: Option<&Path>) -> Result<Self::State, PredictorError>;

    /// Drops every object, prompt and cached mask held by the state.
    fn reset_state(&self, state: &mut Self::State) -> Result<(), PredictorError>;

    /// Replaces the frames of the state with `frame` as frame 0.
    fn install_frame(&self, state: &mut Self::State, frame: &Frame) -> Result<(), PredictorError>;

    fn frame_count(&self, state: &Self::State) -> usize;

    /// Returns masks for every tracked object on `prompt.frame_index`,
    /// not only for the object that was prompted.
    fn add_new_points_or_box(
        &self,
        state: &mut Self::State,
        prompt: PointPrompt,
    ) -> Result<PredictorOutput, PredictorError>;

    fn enter_reduced_precision(&self) {}

    fn exit_reduced_precision(&self) {}
}

/// Holds the predictor in reduced precision until dropped.
pub struct PrecisionScope<'a, P: Predictor> {
    predictor: &'a P,
}

impl<'a, P: Predictor> PrecisionScope<'a, P> {
    pub fn enter(predictor: &'a P) -> Self {
        predictor.enter_reduced_precision();
        Self { predictor }
    }
}

impl<P: Predictor> Drop for PrecisionScope<'_, P> {
    fn drop(&mut self) {
        self.predictor.exit_reduced_precision();
    }
}
