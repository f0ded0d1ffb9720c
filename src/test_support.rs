use crate::frames::Frame;
use crate::predictor::{PointPrompt, Predictor, PredictorError, PredictorOutput};
use image::Rgb;
use ndarray::Array4;
use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

pub const NO_OBJECT_LOGIT: f32 = -1024.0;

/// Writes `count` numbered PNG frames; frame `i` is filled with `Rgb([i, 0, 0])`.
pub fn write_frame_sequence(dir: &Path, count: usize, width: u32, height: u32) {
    for i in 0..count {
        Frame::from_pixel(width, height, Rgb([i as u8, 0, 0]))
            .save(dir.join(format!("{:05}.png", i)))
            .unwrap();
    }
}

#[derive(Debug, Default)]
pub struct CallCounts {
    pub init: AtomicUsize,
    pub reset: AtomicUsize,
    pub install: AtomicUsize,
    pub add_points: AtomicUsize,
    pub precision_enter: AtomicUsize,
    pub precision_exit: AtomicUsize,
}

impl CallCounts {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct StubState {
    pub frame_count: usize,
    pub frame_size: Option<(u32, u32)>,
    /// `(frame, object)` to number of active points.
    pub prompts: BTreeMap<(usize, i64), usize>,
    pub object_ids: Vec<i64>,
}

impl StubState {
    pub fn prompted_objects(&self, frame_index: usize) -> Vec<i64> {
        self.prompts
            .keys()
            .filter(|(frame, _)| *frame == frame_index)
            .map(|(_, object)| *object)
            .collect()
    }
}

/// Deterministic predictor: prompted objects get a checkerboard of logits,
/// everything else the "no object" logit.
#[derive(Debug, Clone)]
pub struct StubPredictor {
    pub calls: Arc<CallCounts>,
    pub video_frames: usize,
    pub video_size: (u32, u32),
    pub omit_object: Option<i64>,
    pub unsupported: bool,
    /// Time spent inside `add_new_points_or_box`, after the call is counted.
    pub delay: Option<Duration>,
}

impl StubPredictor {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(CallCounts::default()),
            video_frames: 10,
            video_size: (8, 6),
            omit_object: None,
            unsupported: false,
            delay: None,
        }
    }

    fn logit(object_id: i64, x: usize, y: usize) -> f32 {
        if (x + y + object_id as usize) % 2 == 0 {
            3.0
        } else {
            -1.0
        }
    }
}

impl Predictor for StubPredictor {
    type State = StubState;

    fn init_state(&self, source: Option<&Path>) -> Result<StubState, PredictorError> {
        self.calls.init.fetch_add(1, Ordering::SeqCst);
        Ok(match source {
            Some(_) => StubState {
                frame_count: self.video_frames,
                frame_size: Some(self.video_size),
                ..StubState::default()
            },
            None => StubState::default(),
        })
    }

    fn reset_state(&self, state: &mut StubState) -> Result<(), PredictorError> {
        self.calls.reset.fetch_add(1, Ordering::SeqCst);
        state.prompts.clear();
        state.object_ids.clear();
        Ok(())
    }

    fn install_frame(&self, state: &mut StubState, frame: &Frame) -> Result<(), PredictorError> {
        self.calls.install.fetch_add(1, Ordering::SeqCst);
        state.frame_count = 1;
        state.frame_size = Some(frame.dimensions());
        Ok(())
    }

    fn frame_count(&self, state: &StubState) -> usize {
        state.frame_count
    }

    fn add_new_points_or_box(
        &self,
        state: &mut StubState,
        prompt: PointPrompt,
    ) -> Result<PredictorOutput, PredictorError> {
        self.calls.add_points.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.unsupported {
            return Err(PredictorError::Unsupported("box prompts".into()));
        }
        let (width, height) = state
            .frame_size
            .ok_or_else(|| PredictorError::InvalidInput("no frame loaded".into()))?;
        if prompt.frame_index >= state.frame_count {
            return Err(PredictorError::InvalidInput(format!(
                "frame {} out of range",
                prompt.frame_index
            )));
        }

        let key = (prompt.frame_index, prompt.object_id);
        let added = prompt.points.nrows();
        if prompt.clear_old_points {
            state.prompts.insert(key, added);
        } else {
            *state.prompts.entry(key).or_default() += added;
        }
        if !state.object_ids.contains(&prompt.object_id) {
            state.object_ids.push(prompt.object_id);
        }

        let object_ids: Vec<i64> = state
            .object_ids
            .iter()
            .copied()
            .filter(|id| Some(*id) != self.omit_object)
            .collect();
        let masks = Array4::from_shape_fn(
            (object_ids.len(), 1, height as usize, width as usize),
            |(n, _, y, x)| {
                let id = object_ids[n];
                if state.prompts.contains_key(&(prompt.frame_index, id)) {
                    Self::logit(id, x, y)
                } else {
                    NO_OBJECT_LOGIT
                }
            },
        );

        Ok(PredictorOutput {
            frame_index: prompt.frame_index,
            object_ids,
            masks,
        })
    }

    fn enter_reduced_precision(&self) {
        self.calls.precision_enter.fetch_add(1, Ordering::SeqCst);
    }

    fn exit_reduced_precision(&self) {
        self.calls.precision_exit.fetch_add(1, Ordering::SeqCst);
    }
}
