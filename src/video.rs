use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VideoPathError {
    #[error("Absolute paths not allowed")]
    Absolute,
    #[error("Invalid video path")]
    Escapes,
    #[error("Video not found")]
    NotFound,
}

/// Maps client supplied video names onto files under the video directory.
#[derive(Debug, Clone)]
pub struct VideoResolver {
    base: PathBuf,
}

impl VideoResolver {
    pub fn new(video_dir: impl Into<PathBuf>) -> Self {
        Self {
            base: video_dir.into(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Accepts `clip.mp4` as well as `videos/clip.mp4`. The target may be a
    /// video file or a directory of numbered frames.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, VideoPathError> {
        let requested = Path::new(filename);
        if requested.is_absolute() || requested.has_root() {
            return Err(VideoPathError::Absolute);
        }

        let mut components: Vec<Component> = requested.components().collect();
        let leading_videos_dir = matches!(
            components.first(),
            Some(Component::Normal(first)) if first.eq_ignore_ascii_case("videos")
        );
        if leading_videos_dir && components.len() > 1 {
            components.remove(0);
        }

        let mut relative = PathBuf::new();
        for component in components {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(VideoPathError::Escapes);
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(VideoPathError::Absolute),
            }
        }

        let target = self.base.join(&relative);
        if !target.exists() {
            return Err(VideoPathError::NotFound);
        }

        // symlinks may still point outside the base
        let base = self
            .base
            .canonicalize()
            .map_err(|_| VideoPathError::NotFound)?;
        let target = target.canonicalize().map_err(|_| VideoPathError::NotFound)?;
        if !target.starts_with(&base) || target == base {
            return Err(VideoPathError::Escapes);
        }

        Ok(target)
    }
}
