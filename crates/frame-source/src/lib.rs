//! Video source acquisition.
//!
//! A [`VideoSource`] hands out the *current* decoded frame rather than a
//! stream: the annotation pipeline samples at its own cadence and only ever
//! wants the newest picture. The bundled [`FfmpegSource`] decodes a camera
//! device, file, or network URI through an FFmpeg subprocess and keeps a
//! shared latest-frame slot updated from a background reader thread.

use std::sync::{Arc, Mutex};

pub use crate::ffmpeg::FfmpegSource;
pub use crate::types::{Frame, FrameFormat, SourceError};

mod ffmpeg;
mod types;

/// Shared slot holding the most recently decoded frame.
pub(crate) type LatestFrame = Arc<Mutex<Option<Frame>>>;

/// Capability consumed by the pipeline: "current decoded frame" plus the
/// source's native dimensions.
pub trait VideoSource {
    /// The most recently decoded frame, or `None` if the source has not
    /// produced one yet.
    fn current_frame(&self) -> Option<Frame>;

    /// Native width/height, or `None` while the source cannot report them.
    fn native_size(&self) -> Option<(u32, u32)>;
}
