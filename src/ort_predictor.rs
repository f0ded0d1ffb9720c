use crate::{
    config::ModelConfig,
    frames::{Frame, FrameExtractor},
    predictor::{CoordinateSpace, PointPrompt, Predictor, PredictorError, PredictorOutput},
};
use image::{imageops, imageops::FilterType, ImageBuffer, Luma};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayD, ArrayView2, Axis};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

const INPUT_SIZE: u32 = 1024;
const LOW_RES_MASK_SIZE: usize = 256;
const NO_OBJECT_LOGIT: f32 = -1024.0;
const PADDING_LABEL: f32 = -1.0;
const PIXEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const PIXEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

fn inference_error(err: ort::Error) -> PredictorError {
    PredictorError::Inference(err.to_string())
}

/// Resizes to the encoder input and applies ImageNet normalization, NCHW.
fn preprocess(frame: &Frame) -> Array4<f32> {
    let resized = imageops::resize(frame, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);

    let mut input = Array4::zeros((1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for channel in 0..3 {
            input[[0, channel, y as usize, x as usize]] =
                (pixel[channel] as f32 / 255. - PIXEL_MEAN[channel]) / PIXEL_STD[channel];
        }
    }
    input
}

/// Point coordinates in encoder input space plus the padding point the
/// exported decoder expects when no box is given.
fn prompt_tensors(points: &ObjectPoints, width: u32, height: u32) -> (Array3<f32>, Array2<f32>) {
    let n = points.coords.len() + 1;
    let scale_x = INPUT_SIZE as f32 / width as f32;
    let scale_y = INPUT_SIZE as f32 / height as f32;

    let mut coords = Array3::zeros((1, n, 2));
    let mut labels = Array2::from_elem((1, n), PADDING_LABEL);
    for (i, ([x, y], label)) in points.coords.iter().zip(&points.labels).enumerate() {
        coords[[0, i, 0]] = x * scale_x;
        coords[[0, i, 1]] = y * scale_y;
        labels[[0, i]] = *label;
    }
    (coords, labels)
}

/// Picks the candidate with the highest predicted IoU out of `[1, K, H, W]`.
fn select_best_mask(masks: &ArrayD<f32>, iou: &ArrayD<f32>) -> Result<Array2<f32>, PredictorError> {
    let best = iou
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(index, _)| index)
        .ok_or_else(|| PredictorError::Inference("decoder returned no mask candidates".into()))?;

    let masks = masks
        .view()
        .into_dimensionality::<ndarray::Ix4>()
        .map_err(|e| PredictorError::Inference(format!("unexpected mask shape: {}", e)))?;
    if best >= masks.shape()[1] {
        return Err(PredictorError::Inference(format!(
            "iou index {} outside of {} mask candidates",
            best,
            masks.shape()[1]
        )));
    }
    Ok(masks.slice(s![0, best, .., ..]).to_owned())
}

fn upsample(low_res: ArrayView2<f32>, width: u32, height: u32) -> Array2<f32> {
    let (rows, cols) = low_res.dim();
    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_fn(cols as u32, rows as u32, |x, y| {
            Luma([low_res[[y as usize, x as usize]]])
        });
    let resized = imageops::resize(&buffer, width, height, FilterType::Triangle);

    Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        resized.get_pixel(x as u32, y as u32)[0]
    })
}

#[derive(Debug, Clone)]
struct ImageFeatures {
    image_embed: ArrayD<f32>,
    high_res_feats_0: ArrayD<f32>,
    high_res_feats_1: ArrayD<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ObjectPoints {
    coords: Vec<[f32; 2]>,
    labels: Vec<f32>,
}

#[derive(Debug)]
enum FrameSource {
    Video { path: PathBuf, frame_count: usize },
    Single(Option<Frame>),
}

/// Per-session cache of encoder features, prompts and decoded masks.
#[derive(Debug)]
pub struct OrtTrackingState {
    source: FrameSource,
    features: HashMap<usize, ImageFeatures>,
    prompts: HashMap<(usize, i64), ObjectPoints>,
    masks: HashMap<(usize, i64), Array2<f32>>,
    object_ids: Vec<i64>,
}

impl OrtTrackingState {
    fn new(source: FrameSource) -> Self {
        Self {
            source,
            features: HashMap::new(),
            prompts: HashMap::new(),
            masks: HashMap::new(),
            object_ids: Vec::new(),
        }
    }

    fn clear(&mut self) {
        self.features.clear();
        self.prompts.clear();
        self.masks.clear();
        self.object_ids.clear();
    }

    fn add_points(
        &mut self,
        frame_index: usize,
        object_id: i64,
        points: ObjectPoints,
        clear_old: bool,
    ) -> &ObjectPoints {
        let entry = self.prompts.entry((frame_index, object_id)).or_default();
        if clear_old {
            *entry = points;
        } else {
            entry.coords.extend(points.coords);
            entry.labels.extend(points.labels);
        }
        if !self.object_ids.contains(&object_id) {
            self.object_ids.push(object_id);
        }
        entry
    }

    fn frame_count(&self) -> usize {
        match &self.source {
            FrameSource::Video { frame_count, .. } => *frame_count,
            FrameSource::Single(Some(_)) => 1,
            FrameSource::Single(None) => 0,
        }
    }

    fn output(&self, frame_index: usize, width: u32, height: u32) -> PredictorOutput {
        let (width, height) = (width as usize, height as usize);
        let mut masks = Array4::from_elem(
            (self.object_ids.len(), 1, height, width),
            NO_OBJECT_LOGIT,
        );
        for (mut slot, object_id) in masks.axis_iter_mut(Axis(0)).zip(&self.object_ids) {
            let cached = self.masks.get(&(frame_index, *object_id));
            if let Some(mask) = cached.filter(|mask| mask.dim() == (height, width)) {
                slot.index_axis_mut(Axis(0), 0).assign(mask);
            }
        }

        PredictorOutput {
            frame_index,
            object_ids: self.object_ids.clone(),
            masks,
        }
    }
}

/// SAM 2.1 image encoder and prompt decoder exported to ONNX.
pub struct OrtPredictor {
    encoder: Mutex<Session>,
    decoder: Mutex<Session>,
    frames: FrameExtractor,
}

impl OrtPredictor {
    pub fn new(model_config: &ModelConfig, frames: FrameExtractor) -> anyhow::Result<Self> {
        if !model_config.force_cpu {
            ort::init()
                .with_execution_providers([CUDAExecutionProvider::default().build()])
                .commit()?;
        }

        let load = |path: PathBuf| -> anyhow::Result<Session> {
            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .commit_from_file(&path)?;
            tracing::info!("Loaded ONNX model {:?}", path);
            Ok(session)
        };

        Ok(Self {
            encoder: Mutex::new(load(model_config.get_encoder_path())?),
            decoder: Mutex::new(load(model_config.get_decoder_path())?),
            frames,
        })
    }

    fn encode_image(&self, frame: &Frame) -> Result<ImageFeatures, PredictorError> {
        let input = preprocess(frame);
        let mut encoder = self.encoder.lock();

        let tensor = TensorRef::from_array_view(input.view()).map_err(inference_error)?;
        let outputs = encoder
            .run(ort::inputs!["image" => tensor])
            .map_err(inference_error)?;

        let extract = |name: &str| -> Result<ArrayD<f32>, PredictorError> {
            let (shape, data) = outputs[name]
                .try_extract_tensor::<f32>()
                .map_err(inference_error)?;
            ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
                .map_err(|e| PredictorError::Inference(format!("invalid tensor shape: {}", e)))
        };

        Ok(ImageFeatures {
            image_embed: extract("image_embed")?,
            high_res_feats_0: extract("high_res_feats_0")?,
            high_res_feats_1: extract("high_res_feats_1")?,
        })
    }

    fn decode_mask(
        &self,
        features: &ImageFeatures,
        points: &ObjectPoints,
        width: u32,
        height: u32,
    ) -> Result<Array2<f32>, PredictorError> {
        let (coords, labels) = prompt_tensors(points, width, height);
        let mask_input = Array4::<f32>::zeros((1, 1, LOW_RES_MASK_SIZE, LOW_RES_MASK_SIZE));
        let has_mask_input = Array1::<f32>::zeros(1);

        let mut decoder = self.decoder.lock();
        let outputs = decoder
            .run(ort::inputs![
                "image_embed" => TensorRef::from_array_view(features.image_embed.view()).map_err(inference_error)?,
                "high_res_feats_0" => TensorRef::from_array_view(features.high_res_feats_0.view()).map_err(inference_error)?,
                "high_res_feats_1" => TensorRef::from_array_view(features.high_res_feats_1.view()).map_err(inference_error)?,
                "point_coords" => TensorRef::from_array_view(coords.view()).map_err(inference_error)?,
                "point_labels" => TensorRef::from_array_view(labels.view()).map_err(inference_error)?,
                "mask_input" => TensorRef::from_array_view(mask_input.view()).map_err(inference_error)?,
                "has_mask_input" => TensorRef::from_array_view(has_mask_input.view()).map_err(inference_error)?,
            ])
            .map_err(inference_error)?;

        let extract = |name: &str| -> Result<ArrayD<f32>, PredictorError> {
            let (shape, data) = outputs[name]
                .try_extract_tensor::<f32>()
                .map_err(inference_error)?;
            ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
                .map_err(|e| PredictorError::Inference(format!("invalid tensor shape: {}", e)))
        };

        let best = select_best_mask(&extract("masks")?, &extract("iou_predictions")?)?;
        Ok(upsample(best.view(), width, height))
    }

    fn load_frame(
        &self,
        state: &OrtTrackingState,
        frame_index: usize,
    ) -> Result<Frame, PredictorError> {
        match &state.source {
            FrameSource::Video { path, .. } => {
                Ok(self.frames.try_extract(path, frame_index as u32)?)
            }
            FrameSource::Single(Some(frame)) => Ok(frame.clone()),
            FrameSource::Single(None) => Err(PredictorError::InvalidInput(
                "no frame has been installed in this session".into(),
            )),
        }
    }
}

impl Predictor for OrtPredictor {
    type State = OrtTrackingState;

    fn init_state(&self, source: Option<&Path>) -> Result<OrtTrackingState, PredictorError> {
        let source = match source {
            Some(path) => FrameSource::Video {
                path: path.to_path_buf(),
                frame_count: self.frames.count_frames(path)?,
            },
            None => FrameSource::Single(None),
        };
        Ok(OrtTrackingState::new(source))
    }

    fn reset_state(&self, state: &mut OrtTrackingState) -> Result<(), PredictorError> {
        state.clear();
        Ok(())
    }

    fn install_frame(
        &self,
        state: &mut OrtTrackingState,
        frame: &Frame,
    ) -> Result<(), PredictorError> {
        state.features.clear();
        state.masks.clear();
        state.source = FrameSource::Single(Some(frame.clone()));
        Ok(())
    }

    fn frame_count(&self, state: &OrtTrackingState) -> usize {
        state.frame_count()
    }

    fn add_new_points_or_box(
        &self,
        state: &mut OrtTrackingState,
        prompt: PointPrompt,
    ) -> Result<PredictorOutput, PredictorError> {
        let frame_count = state.frame_count();
        if prompt.frame_index >= frame_count {
            return Err(PredictorError::InvalidInput(format!(
                "frame {} out of range for {} frames",
                prompt.frame_index, frame_count
            )));
        }
        if prompt.points.ncols() != 2 || prompt.points.nrows() != prompt.labels.len() {
            return Err(PredictorError::InvalidInput(format!(
                "points {:?} do not match labels {:?}",
                prompt.points.shape(),
                prompt.labels.shape()
            )));
        }

        let frame = self.load_frame(state, prompt.frame_index)?;
        let (width, height) = frame.dimensions();
        let scale = match prompt.coordinates {
            CoordinateSpace::Pixels => [1., 1.],
            CoordinateSpace::Normalized => [width as f32, height as f32],
        };
        let points = ObjectPoints {
            coords: prompt
                .points
                .rows()
                .into_iter()
                .map(|row| [row[0] * scale[0], row[1] * scale[1]])
                .collect(),
            labels: prompt.labels.iter().map(|label| *label as f32).collect(),
        };

        if !state.features.contains_key(&prompt.frame_index) {
            tracing::debug!("encoding frame {}", prompt.frame_index);
            let features = self.encode_image(&frame)?;
            state.features.insert(prompt.frame_index, features);
        }

        let points = state
            .add_points(prompt.frame_index, prompt.object_id, points, prompt.clear_old_points)
            .clone();
        let features = state.features.get(&prompt.frame_index).ok_or_else(|| {
            PredictorError::Inference(format!("missing features for frame {}", prompt.frame_index))
        })?;
        let mask = self.decode_mask(features, &points, width, height)?;
        state
            .masks
            .insert((prompt.frame_index, prompt.object_id), mask);

        Ok(state.output(prompt.frame_index, width, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::{array, IxDyn};

    #[test]
    fn test_preprocess() {
        let frame = Frame::from_pixel(10, 5, Rgb([255, 0, 0]));
        let input = preprocess(&frame);

        assert_eq!(input.shape(), &[1, 3, 1024, 1024]);
        let red = (1.0 - PIXEL_MEAN[0]) / PIXEL_STD[0];
        let green = -PIXEL_MEAN[1] / PIXEL_STD[1];
        assert!((input[[0, 0, 500, 500]] - red).abs() < 1e-5);
        assert!((input[[0, 1, 0, 1023]] - green).abs() < 1e-5);
    }

    #[test]
    fn test_prompt_tensors_scale_and_pad() {
        let points = ObjectPoints {
            coords: vec![[50.0, 25.0]],
            labels: vec![1.0],
        };
        let (coords, labels) = prompt_tensors(&points, 100, 50);

        assert_eq!(coords, array![[[512.0f32, 512.0], [0.0, 0.0]]]);
        assert_eq!(labels, array![[1.0f32, -1.0]]);
    }

    #[test]
    fn test_select_best_mask() {
        let masks = ArrayD::from_shape_fn(IxDyn(&[1, 3, 2, 2]), |idx| idx[1] as f32);
        let iou = ArrayD::from_shape_vec(IxDyn(&[1, 3]), vec![0.1, 0.9, 0.5]).unwrap();

        assert_eq!(select_best_mask(&masks, &iou).unwrap(), Array2::from_elem((2, 2), 1.0f32));
    }

    #[test]
    fn test_upsample_constant_mask() {
        let low_res = Array2::from_elem((4, 4), 2.5f32);
        let mask = upsample(low_res.view(), 10, 6);

        assert_eq!(mask.dim(), (6, 10));
        assert!(mask.iter().all(|v| (v - 2.5).abs() < 1e-5));
    }

    #[test]
    fn test_state_points_and_output() {
        let mut state = OrtTrackingState::new(FrameSource::Single(None));
        assert_eq!(state.frame_count(), 0);
        state.source = FrameSource::Single(Some(Frame::new(4, 3)));
        assert_eq!(state.frame_count(), 1);

        let point = |x| ObjectPoints {
            coords: vec![[x, 1.0]],
            labels: vec![1.0],
        };
        state.add_points(0, 7, point(1.0), true);
        state.add_points(0, 7, point(2.0), false);
        assert_eq!(state.prompts[&(0, 7)].coords.len(), 2);
        state.add_points(0, 7, point(3.0), true);
        assert_eq!(state.prompts[&(0, 7)], point(3.0));

        state.add_points(0, 9, point(1.0), true);
        state.masks.insert((0, 9), Array2::from_elem((3, 4), 5.0));
        let output = state.output(0, 4, 3);

        assert_eq!(output.object_ids, vec![7, 9]);
        assert_eq!(output.masks.shape(), &[2, 1, 3, 4]);
        assert_eq!(output.mask_for(7).unwrap()[[0, 0]], NO_OBJECT_LOGIT);
        assert_eq!(output.mask_for(9).unwrap()[[2, 3]], 5.0);

        state.clear();
        assert!(state.object_ids.is_empty());
        assert_eq!(state.frame_count(), 1);
    }
}
