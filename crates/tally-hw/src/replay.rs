//! Replay still images from a directory as a frame source.

use crate::frame::Frame;
use crate::{CameraError, FrameSource};
use std::path::{Path, PathBuf};

const EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Frames read from image files in a directory, in file-name order.
pub struct DirectorySource {
    files: std::vec::IntoIter<PathBuf>,
    sequence: u32,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> Result<Self, CameraError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CameraError::DeviceNotFound(format!("{}: {e}", dir.display())))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        files.sort();

        tracing::info!(dir = %dir.display(), frames = files.len(), "replaying frames from directory");
        Ok(Self {
            files: files.into_iter(),
            sequence: 0,
        })
    }

    pub fn remaining(&self) -> usize {
        self.files.len()
    }
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        let Some(path) = self.files.next() else {
            return Ok(None);
        };
        let image = image::open(&path)
            .map_err(|e| CameraError::Unreadable {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
            .to_rgb8();
        let frame = Frame::new(image, self.sequence);
        self.sequence += 1;
        Ok(Some(frame))
    }
}
