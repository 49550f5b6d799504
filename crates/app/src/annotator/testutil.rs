//! Shared test doubles for the annotator modules.

use frame_source::{Frame, FrameFormat, VideoSource};

/// A solid-colour BGR frame, the workhorse fixture for pixel assertions.
pub(crate) fn solid_frame(width: u32, height: u32, bgr: [u8; 3]) -> Frame {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for _ in 0..width * height {
        data.extend_from_slice(&bgr);
    }
    Frame {
        data,
        width,
        height,
        timestamp_ms: 0,
        format: FrameFormat::Bgr8,
    }
}

/// Video source double that always hands out the same frame (or none).
pub(crate) struct StaticSource {
    frame: Option<Frame>,
    size: Option<(u32, u32)>,
}

impl StaticSource {
    /// A source that has not produced a frame yet.
    pub(crate) fn empty() -> Self {
        Self {
            frame: None,
            size: None,
        }
    }

    pub(crate) fn solid(width: u32, height: u32, bgr: [u8; 3]) -> Self {
        Self {
            frame: Some(solid_frame(width, height, bgr)),
            size: Some((width, height)),
        }
    }

    /// Corrupt the frame by chopping its pixel data down to `len` bytes.
    pub(crate) fn truncate_data(&mut self, len: usize) {
        if let Some(frame) = self.frame.as_mut() {
            frame.data.truncate(len);
        }
    }
}

impl VideoSource for StaticSource {
    fn current_frame(&self) -> Option<Frame> {
        self.frame.clone()
    }

    fn native_size(&self) -> Option<(u32, u32)> {
        self.size
    }
}
