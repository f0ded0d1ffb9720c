use crate::{
    frames::{Frame, FrameExtractor},
    mask::{self, MaskEncoding},
    models::{
        EncodedMask, FrameResult, ObjectMeta, ObjectPayload, ObjectResult, PointPayload,
        PredictPayload,
    },
    predictor::{CoordinateSpace, PointPrompt, PrecisionScope, Predictor, PredictorError},
    session::{SessionNotFound, SessionStore, TrackingMode},
    video::{VideoPathError, VideoResolver},
};
use ndarray::Array2;
use parking_lot::Mutex;
use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Resource(String),
    #[error(transparent)]
    VideoPath(#[from] VideoPathError),
    #[error("Session error: {0}")]
    Session(#[from] SessionNotFound),
    #[error("{0}")]
    Unsupported(String),
    #[error("{0}")]
    Internal(String),
}

impl From<PredictorError> for InferenceError {
    fn from(err: PredictorError) -> Self {
        match err {
            PredictorError::Unsupported(msg) => InferenceError::Unsupported(msg),
            PredictorError::InvalidInput(msg) => InferenceError::Validation(msg),
            PredictorError::Frame(e) => InferenceError::Resource(e.to_string()),
            PredictorError::Inference(msg) => InferenceError::Internal(msg),
        }
    }
}

#[derive(Debug, Clone)]
struct ObjectPrompt {
    object_id: i64,
    points: Vec<PointPayload>,
    meta: Option<ObjectMeta>,
}

impl ObjectPrompt {
    fn to_point_prompt(&self, frame_index: usize, width: u32, height: u32) -> PointPrompt {
        let pixels: Vec<(f32, f32)> = self
            .points
            .iter()
            .map(|point| point.to_pixel(width, height))
            .collect();
        let points = Array2::from_shape_fn((pixels.len(), 2), |(i, axis)| {
            if axis == 0 {
                pixels[i].0
            } else {
                pixels[i].1
            }
        });

        PointPrompt {
            frame_index,
            object_id: self.object_id,
            points,
            labels: self.points.iter().map(|point| point.label).collect(),
            clear_old_points: true,
            coordinates: CoordinateSpace::Pixels,
        }
    }
}

#[derive(Debug)]
struct RawObjectMask {
    object_id: i64,
    logits: Array2<f32>,
    meta: Option<ObjectMeta>,
}

/// The predictor and every session's state. Only ever touched through the
/// service mutex.
struct Engine<P: Predictor> {
    predictor: P,
    sessions: SessionStore<P::State>,
}

impl<P: Predictor> Engine<P> {
    fn start(&mut self, id: Option<String>, source: Option<&Path>) -> Result<String, PredictorError> {
        let Engine {
            predictor,
            sessions,
        } = self;
        let _precision = PrecisionScope::enter(&*predictor);

        let state = predictor.init_state(source)?;
        let mode = TrackingMode::from_frame_count(predictor.frame_count(&state));
        let id = sessions.create(id, state, mode);
        tracing::info!("started session {} in {:?} mode", id, mode);
        Ok(id)
    }

    fn track(
        &mut self,
        session_id: &str,
        frame_index: u32,
        frame: &Frame,
        prompts: &[ObjectPrompt],
    ) -> Result<Vec<RawObjectMask>, InferenceError> {
        let Engine {
            predictor,
            sessions,
        } = self;
        let _precision = PrecisionScope::enter(&*predictor);

        if !sessions.contains(session_id) {
            tracing::info!("Auto-creating session {} for predict call", session_id);
            let state = predictor.init_state(None)?;
            let mode = TrackingMode::from_frame_count(predictor.frame_count(&state));
            sessions.create(Some(session_id.to_string()), state, mode);
        }

        let session = sessions.get_mut(session_id)?;
        session.touch();

        let target_frame = match session.mode {
            TrackingMode::Stateless => {
                if session.last_frame_index != Some(frame_index) {
                    tracing::debug!(
                        "session {} moved from frame {:?} to {}, resetting",
                        session_id,
                        session.last_frame_index,
                        frame_index
                    );
                    predictor.reset_state(&mut session.state)?;
                    predictor.install_frame(&mut session.state, frame)?;
                    session.last_frame_index = Some(frame_index);
                }
                0
            }
            TrackingMode::Stateful => frame_index as usize,
        };

        tracing::debug!(
            "predict called: session={} frame={} (mapped to {}) objects={}",
            session_id,
            frame_index,
            target_frame,
            prompts.len()
        );

        let (width, height) = frame.dimensions();
        let mut masks = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            tracing::debug!(
                "processing object {} with {} points",
                prompt.object_id,
                prompt.points.len()
            );
            let output = predictor.add_new_points_or_box(
                &mut session.state,
                prompt.to_point_prompt(target_frame, width, height),
            )?;
            tracing::debug!(
                "predictor returned: frame_idx={} obj_ids={:?} masks_shape={:?}",
                output.frame_index,
                output.object_ids,
                output.masks.shape()
            );

            match output.mask_for(prompt.object_id) {
                Some(logits) => masks.push(RawObjectMask {
                    object_id: prompt.object_id,
                    logits: logits.to_owned(),
                    meta: prompt.meta.clone(),
                }),
                None => tracing::warn!(
                    "predictor returned no mask for object {}, skipping it",
                    prompt.object_id
                ),
            }
        }

        Ok(masks)
    }
}

/// Serializes every predictor interaction behind one process-wide lock.
///
/// Session start, close and the predictor part of `predict` all take the
/// lock, so two predict calls never overlap even on different sessions.
/// Frame extraction and mask encoding run outside of it.
pub struct InferenceService<P: Predictor> {
    engine: Arc<Mutex<Engine<P>>>,
    open_sessions: Arc<AtomicUsize>,
    frames: FrameExtractor,
    videos: VideoResolver,
    mask_threshold: f32,
}

impl<P: Predictor> Clone for InferenceService<P> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            open_sessions: self.open_sessions.clone(),
            frames: self.frames.clone(),
            videos: self.videos.clone(),
            mask_threshold: self.mask_threshold,
        }
    }
}

impl<P: Predictor> InferenceService<P> {
    pub fn new(
        predictor: P,
        sessions: SessionStore<P::State>,
        frames: FrameExtractor,
        videos: VideoResolver,
        mask_threshold: f32,
    ) -> Self {
        Self {
            open_sessions: sessions.open_counter(),
            engine: Arc::new(Mutex::new(Engine {
                predictor,
                sessions,
            })),
            frames,
            videos,
            mask_threshold,
        }
    }

    #[instrument(skip(self))]
    pub async fn start_session(&self, path: Option<String>) -> Result<String, InferenceError> {
        let source = path
            .filter(|p| !p.is_empty())
            .map(|p| self.videos.resolve(&p))
            .transpose()?;
        let engine = self.engine.clone();

        blocking(move || Ok(engine.lock().start(None, source.as_deref())?)).await
    }

    #[instrument(skip(self))]
    pub async fn close_session(&self, session_id: String) -> Result<bool, InferenceError> {
        let engine = self.engine.clone();
        blocking(move || Ok(engine.lock().sessions.close(&session_id).is_some())).await
    }

    pub async fn evict_idle_sessions(&self) -> Result<Vec<String>, InferenceError> {
        let engine = self.engine.clone();
        blocking(move || Ok(engine.lock().sessions.evict_idle(Instant::now()))).await
    }

    /// Read without the engine lock, so it never waits on a running predictor call.
    pub fn session_count(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    #[instrument(skip(self, payload), fields(session_id = ?payload.session_id, frame_index = ?payload.frame_index))]
    pub async fn predict(
        &self,
        payload: PredictPayload,
        encoding: MaskEncoding,
    ) -> Result<FrameResult, InferenceError> {
        let video_path = payload
            .video_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| InferenceError::Validation("videoPath is required".into()))?;
        let frame_index = payload
            .frame_index
            .ok_or_else(|| InferenceError::Validation("frameIndex is required".into()))?;
        let prompts = collect_prompts(&payload.objects)?;
        let source = self.videos.resolve(video_path)?;

        let frames = self.frames.clone();
        let frame = blocking(move || {
            frames.extract(&source, frame_index).ok_or_else(|| {
                InferenceError::Resource("Failed to extract frame from video".into())
            })
        })
        .await?;
        let (width, height) = frame.dimensions();

        let session_id = payload
            .session_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let engine = self.engine.clone();
        let tracked_id = session_id.clone();
        let raw_masks = blocking(move || {
            engine
                .lock()
                .track(&tracked_id, frame_index, &frame, &prompts)
        })
        .await?;

        let threshold = self.mask_threshold;
        let results = blocking(move || {
            Ok(encode_results(raw_masks, threshold, width, height, encoding))
        })
        .await?;

        Ok(FrameResult {
            session_id,
            frame_index,
            results,
            meta: payload.meta,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_session<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&crate::session::Session<P::State>) -> R,
    ) -> Option<R> {
        let engine = self.engine.lock();
        engine.sessions.get(session_id).ok().map(f)
    }
}

fn collect_prompts(objects: &[ObjectPayload]) -> Result<Vec<ObjectPrompt>, InferenceError> {
    let mut prompts = Vec::with_capacity(objects.len());
    for object in objects {
        if object.points.is_empty() {
            tracing::debug!(
                "skipping object {:?} because it has no points",
                object.object_id
            );
            continue;
        }

        let object_id = object.object_id.ok_or_else(|| {
            InferenceError::Validation("objectId is required for objects with points".into())
        })?;
        for point in &object.points {
            point.validate().map_err(InferenceError::Validation)?;
        }

        prompts.push(ObjectPrompt {
            object_id,
            points: object.points.clone(),
            meta: object.meta.clone(),
        });
    }
    Ok(prompts)
}

fn encode_results(
    raw_masks: Vec<RawObjectMask>,
    threshold: f32,
    width: u32,
    height: u32,
    encoding: MaskEncoding,
) -> Vec<ObjectResult> {
    raw_masks
        .into_iter()
        .filter_map(|raw| {
            let binary = mask::binarize(raw.logits.view(), threshold);
            let score = mask::confidence(raw.logits.view());
            match mask::mask_png_bytes(binary.view()) {
                Ok(png) => Some(ObjectResult {
                    object_id: raw.object_id,
                    score,
                    mask: EncodedMask {
                        width,
                        height,
                        format: mask::MASK_FORMAT.to_string(),
                        data: mask::encode(png, encoding),
                    },
                    meta: raw.meta,
                }),
                Err(e) => {
                    tracing::warn!("failed to encode mask for object {}: {}", raw.object_id, e);
                    None
                }
            }
        })
        .collect()
}

async fn blocking<T, F>(f: F) -> Result<T, InferenceError>
where
    F: FnOnce() -> Result<T, InferenceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| InferenceError::Internal(format!("worker task failed: {}", e)))?
}
