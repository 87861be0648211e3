// THEORY:
// A `FrameSource` yields the latest available frame each time it is asked.
// The scheduler never queues frames: whatever is current when it asks is what
// gets analyzed, and everything in between is dropped. Sources that run out
// (a recorded clip, a folder of stills) loop back to their first frame.

use crate::error::FrameError;
use image::DynamicImage;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

pub trait FrameSource {
    /// Returns the current frame. Never returns "end of stream".
    fn next_frame(&mut self) -> Result<DynamicImage, FrameError>;
}

/// Replays a directory of still images in file-name order, looping forever.
pub struct ImageSequenceSource {
    frames: Vec<PathBuf>,
    cursor: usize,
}

impl ImageSequenceSource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, FrameError> {
        let mut frames = Vec::new();
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image {
                frames.push(path);
            }
        }
        Self::from_paths(frames)
    }

    pub fn from_paths(mut frames: Vec<PathBuf>) -> Result<Self, FrameError> {
        if frames.is_empty() {
            return Err(FrameError::Empty);
        }
        frames.sort();
        Ok(Self { frames, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<DynamicImage, FrameError> {
        let path = &self.frames[self.cursor];
        self.cursor = (self.cursor + 1) % self.frames.len();
        Ok(image::open(path)?)
    }
}

/// A fixed in-memory cycle of frames. Useful for tests and demos.
pub struct LoopingFrames {
    frames: Vec<DynamicImage>,
    cursor: usize,
}

impl LoopingFrames {
    pub fn new(frames: Vec<DynamicImage>) -> Result<Self, FrameError> {
        if frames.is_empty() {
            return Err(FrameError::Empty);
        }
        Ok(Self { frames, cursor: 0 })
    }
}

impl FrameSource for LoopingFrames {
    fn next_frame(&mut self) -> Result<DynamicImage, FrameError> {
        let frame = self.frames[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.frames.len();
        Ok(frame)
    }
}
