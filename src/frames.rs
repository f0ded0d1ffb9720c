use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A decoded video frame in RGB channel order.
pub type Frame = RgbImage;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Failed to open video source {0:?}")]
    OpenFailed(PathBuf),
    #[error("Frame index {index} out of bounds for video with {total} frames")]
    OutOfBounds { index: u32, total: usize },
    #[error("Failed to read frame {0}")]
    ReadFailed(u32),
    #[error("Failed to decode frame: {0}")]
    Decode(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Decoding {0:?} requires the `opencv` feature")]
    Unsupported(PathBuf),
    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// Reads single frames out of a video file or a directory of still images.
///
/// Nothing is cached: every call opens the source, seeks and decodes.
#[derive(Debug, Clone, Default)]
pub struct FrameExtractor;

impl FrameExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, path: &Path, index: u32) -> Option<Frame> {
        match self.try_extract(path, index) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!("Failed to extract frame {} from {:?}: {}", index, path, e);
                None
            }
        }
    }

    pub fn try_extract(&self, path: &Path, index: u32) -> Result<Frame, FrameError> {
        if path.is_dir() {
            ImageSequence::open(path)?.frame(index)
        } else {
            capture::frame(path, index)
        }
    }

    pub fn count_frames(&self, path: &Path) -> Result<usize, FrameError> {
        if path.is_dir() {
            Ok(ImageSequence::open(path)?.len())
        } else {
            capture::count(path)
        }
    }
}

struct ImageSequence {
    frames: Vec<PathBuf>,
}

impl ImageSequence {
    fn open(dir: &Path) -> Result<Self, FrameError> {
        let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();

        let numeric_stems: Option<Vec<u64>> = frames.iter().map(|p| numeric_stem(p)).collect();
        match numeric_stems {
            Some(_) => frames.sort_by_key(|p| numeric_stem(p)),
            None => frames.sort(),
        }

        if frames.is_empty() {
            return Err(FrameError::OpenFailed(dir.to_path_buf()));
        }

        Ok(Self { frames })
    }

    fn len(&self) -> usize {
        self.frames.len()
    }

    fn frame(&self, index: u32) -> Result<Frame, FrameError> {
        let path = self
            .frames
            .get(index as usize)
            .ok_or(FrameError::OutOfBounds {
                index,
                total: self.frames.len(),
            })?;
        Ok(image::open(path)?.to_rgb8())
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn numeric_stem(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

#[cfg(feature = "opencv")]
mod capture {
    use super::{Frame, FrameError};
    use opencv::{core::Mat, prelude::*, videoio};
    use std::path::Path;

    fn open(path: &Path) -> Result<(videoio::VideoCapture, usize), FrameError> {
        let capture = videoio::VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(FrameError::OpenFailed(path.to_path_buf()));
        }
        let total = capture.get(videoio::CAP_PROP_FRAME_COUNT)?.max(0.0) as usize;
        Ok((capture, total))
    }

    pub fn count(path: &Path) -> Result<usize, FrameError> {
        let (_, total) = open(path)?;
        Ok(total)
    }

    pub fn frame(path: &Path, index: u32) -> Result<Frame, FrameError> {
        let (mut capture, total) = open(path)?;
        if index as usize >= total {
            return Err(FrameError::OutOfBounds { index, total });
        }

        capture.set(videoio::CAP_PROP_POS_FRAMES, index as f64)?;
        let mut mat = Mat::default();
        if !capture.read(&mut mat)? || mat.empty() || mat.channels() != 3 {
            return Err(FrameError::ReadFailed(index));
        }

        let mat = mat.try_clone()?;
        let (width, height) = (mat.cols() as u32, mat.rows() as u32);
        // OpenCV hands out BGR
        let rgb: Vec<u8> = mat
            .data_bytes()?
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect();

        Frame::from_raw(width, height, rgb).ok_or(FrameError::ReadFailed(index))
    }
}

#[cfg(not(feature = "opencv"))]
mod capture {
    use super::{Frame, FrameError};
    use std::path::Path;

    pub fn count(path: &Path) -> Result<usize, FrameError> {
        Err(FrameError::Unsupported(path.to_path_buf()))
    }

    pub fn frame(path: &Path, _index: u32) -> Result<Frame, FrameError> {
        Err(FrameError::Unsupported(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_frame_sequence;
    use image::Rgb;

    #[test]
    fn test_extract_frame_from_sequence() {
        let dir = tempfile::tempdir().unwrap();
        write_frame_sequence(dir.path(), 3, 8, 6);

        let extractor = FrameExtractor::new();
        let frame = extractor.extract(dir.path(), 2).unwrap();

        assert_eq!(frame.dimensions(), (8, 6));
        assert_eq!(frame.get_pixel(0, 0), &Rgb([2, 0, 0]));
        assert_eq!(extractor.count_frames(dir.path()).unwrap(), 3);
    }

    #[test]
    fn test_out_of_range_frame_is_none() {
        let dir = tempfile::tempdir().unwrap();
        write_frame_sequence(dir.path(), 2, 4, 4);

        let extractor = FrameExtractor::new();
        assert!(extractor.extract(dir.path(), 2).is_none());
        assert!(matches!(
            extractor.try_extract(dir.path(), 7),
            Err(FrameError::OutOfBounds { index: 7, total: 2 })
        ));
    }

    #[test]
    fn test_numeric_stems_sort_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for (name, value) in [("10.png", 10u8), ("2.png", 2), ("1.png", 1)] {
            Frame::from_pixel(2, 2, Rgb([value, 0, 0]))
                .save(dir.path().join(name))
                .unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let extractor = FrameExtractor::new();
        let values: Vec<u8> = (0..3)
            .map(|i| extractor.extract(dir.path(), i).unwrap().get_pixel(0, 0)[0])
            .collect();

        assert_eq!(values, vec![1, 2, 10]);
    }

    #[test]
    fn test_missing_source_is_none() {
        let extractor = FrameExtractor::new();
        assert!(extractor
            .extract(Path::new("/definitely/not/here.mp4"), 0)
            .is_none());
    }

    #[cfg(feature = "opencv")]
    #[test]
    fn test_extract_frame_from_video_file() {
        use opencv::{
            core::{Mat, Scalar, Size, CV_8UC3},
            prelude::*,
            videoio::VideoWriter,
        };

        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("clip.avi");
        let mut writer = VideoWriter::new(
            &clip.to_string_lossy(),
            VideoWriter::fourcc('M', 'J', 'P', 'G').unwrap(),
            10.0,
            Size::new(32, 24),
            true,
        )
        .unwrap();
        // pure blue in OpenCV's BGR order
        let blue = Mat::new_rows_cols_with_default(24, 32, CV_8UC3, Scalar::new(255.0, 0.0, 0.0, 0.0))
            .unwrap();
        for _ in 0..4 {
            writer.write(&blue).unwrap();
        }
        writer.release().unwrap();

        let extractor = FrameExtractor::new();
        assert_eq!(extractor.count_frames(&clip).unwrap(), 4);

        let frame = extractor.try_extract(&clip, 3).unwrap();
        assert_eq!(frame.dimensions(), (32, 24));
        let pixel = frame.get_pixel(16, 12);
        assert!(pixel[2] > 200 && pixel[0] < 60, "expected blue, got {:?}", pixel);

        assert!(matches!(
            extractor.try_extract(&clip, 4),
            Err(FrameError::OutOfBounds { index: 4, total: 4 })
        ));
    }
}
