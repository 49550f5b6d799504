//! Frame sampling: turn the source's current frame into one encoded still.

use frame_source::{Frame, FrameFormat, VideoSource};
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use thiserror::Error;
use tracing::debug;

use crate::annotator::{config::DEFAULT_CAPTURE_SIZE, state::SampledFrame};

#[derive(Debug, Error)]
pub(crate) enum SampleError {
    /// The source has not produced a decoded frame yet. Transient; the
    /// caller skips the current tick rather than retrying synchronously.
    #[error("video source has no decoded frame yet")]
    NotReady,
    #[error("jpeg encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Owns the live video source and produces [`SampledFrame`]s on demand.
///
/// Exactly one JPEG encode happens per capture; the sampler never mutates
/// shared state.
pub(crate) struct FrameSampler<S> {
    source: S,
    jpeg_quality: u8,
}

impl<S: VideoSource> FrameSampler<S> {
    pub(crate) fn new(source: S, jpeg_quality: u8) -> Self {
        Self {
            source,
            jpeg_quality,
        }
    }

    /// The current live frame, for repainting. Unlike [`capture`], this does
    /// not encode anything.
    ///
    /// [`capture`]: FrameSampler::capture
    pub(crate) fn current_frame(&self) -> Option<Frame> {
        self.source.current_frame()
    }

    /// Capture the current visible frame as an encoded still image.
    ///
    /// The declared dimensions come from the frame itself, falling back to
    /// the source's native size and finally to 640x480 when nothing reports
    /// dimensions yet.
    pub(crate) fn capture(&self) -> Result<SampledFrame, SampleError> {
        let frame = self.source.current_frame().ok_or(SampleError::NotReady)?;

        let (width, height) = if frame.width > 0 && frame.height > 0 {
            (frame.width, frame.height)
        } else {
            self.source.native_size().unwrap_or(DEFAULT_CAPTURE_SIZE)
        };

        let expected = (width as usize) * (height as usize) * 3;
        if frame.data.len() != expected {
            debug!(
                got = frame.data.len(),
                expected, "frame size mismatch; treating source as not ready"
            );
            return Err(SampleError::NotReady);
        }

        let rgb = match frame.format {
            FrameFormat::Bgr8 => bgr_to_rgb(&frame.data),
        };
        let image = RgbImage::from_raw(width, height, rgb).ok_or(SampleError::NotReady)?;

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality).encode_image(&image)?;

        Ok(SampledFrame {
            jpeg,
            width,
            height,
        })
    }
}

pub(crate) fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
    }
    output
}
