//! FFmpeg-subprocess frame reader.

use std::{
    io::Read,
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex},
    thread,
};

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    types::{Frame, FrameFormat, SourceError},
    LatestFrame, VideoSource,
};

/// Video source backed by an FFmpeg child process decoding to raw BGR24.
///
/// The reader thread overwrites the latest-frame slot on every decoded
/// frame; consumers that sample slower than the source simply skip frames.
pub struct FfmpegSource {
    latest: LatestFrame,
    size: (u32, u32),
    child: Arc<Mutex<Child>>,
}

impl FfmpegSource {
    /// Spawn FFmpeg against `uri` and start the background reader.
    ///
    /// `uri` may be a v4l device (`0`, `/dev/video0`), a file path, or any
    /// URI FFmpeg can open. Frames are scaled to `target_size`.
    pub fn spawn(uri: &str, target_size: (u32, u32)) -> Result<Self, SourceError> {
        let mut cmd = build_command(uri, target_size);
        let mut child = cmd.spawn().map_err(|_| SourceError::Open {
            uri: uri.to_string(),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

        let latest: LatestFrame = Arc::new(Mutex::new(None));
        let slot = latest.clone();
        thread::Builder::new()
            .name("frame-source-reader".into())
            .spawn(move || {
                if let Err(err) = pump_frames(stdout, target_size, &slot) {
                    warn!("frame reader stopped: {err}");
                }
            })
            .map_err(|err| SourceError::Other(err.into()))?;

        Ok(Self {
            latest,
            size: target_size,
            child: Arc::new(Mutex::new(child)),
        })
    }
}

impl VideoSource for FfmpegSource {
    fn current_frame(&self) -> Option<Frame> {
        self.latest.lock().ok()?.clone()
    }

    fn native_size(&self) -> Option<(u32, u32)> {
        Some(self.size)
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Assemble the FFmpeg invocation for `uri`.
fn build_command(uri: &str, target_size: (u32, u32)) -> Command {
    let scale_arg = format!("scale={}:{}", target_size.0, target_size.1);

    let (is_v4l, input) = if let Some(index) = parse_device_index(uri) {
        (true, format!("/dev/video{index}"))
    } else if uri.starts_with("/dev/video") {
        (true, uri.to_string())
    } else {
        (false, uri.to_string())
    };

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");
    if is_v4l {
        cmd.arg("-f").arg("video4linux2");
    }
    cmd.arg("-i")
        .arg(&input)
        .arg("-an")
        .arg("-vf")
        .arg(&scale_arg)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    cmd
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<u32> {
    if let Ok(index) = uri.parse::<u32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<u32>().ok();
        }
    }
    None
}

/// Read raw BGR24 frames from `stdout` into the latest-frame slot until the
/// stream ends or errors.
fn pump_frames(
    mut stdout: impl Read,
    target_size: (u32, u32),
    slot: &LatestFrame,
) -> Result<(), SourceError> {
    let frame_bytes = (target_size.0 as usize) * (target_size.1 as usize) * 3;
    let mut buffer = vec![0u8; frame_bytes];
    let mut frames: u64 = 0;

    loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                let frame = Frame {
                    data: buffer.clone(),
                    width: target_size.0,
                    height: target_size.1,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    format: FrameFormat::Bgr8,
                };
                if let Ok(mut guard) = slot.lock() {
                    *guard = Some(frame);
                }
                frames = frames.wrapping_add(1);
                if frames % 300 == 0 {
                    debug!("decoded {frames} frames");
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("video source ended after {frames} frames");
                return Ok(());
            }
            Err(err) => return Err(SourceError::Other(err.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    use super::{parse_device_index, pump_frames};

    #[test]
    fn device_index_parsing() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam/stream"), None);
        assert_eq!(parse_device_index("clip.mp4"), None);
    }

    #[test]
    fn pump_keeps_newest_frame() {
        // Two 2x2 BGR frames back to back; the slot must hold the second.
        let first = vec![1u8; 12];
        let second = vec![9u8; 12];
        let stream: Vec<u8> = first.iter().chain(second.iter()).copied().collect();

        let slot = Arc::new(Mutex::new(None));
        pump_frames(Cursor::new(stream), (2, 2), &slot).expect("pump");

        let frame = slot.lock().unwrap().clone().expect("frame present");
        assert_eq!(frame.data, second);
        assert_eq!((frame.width, frame.height), (2, 2));
    }

    #[test]
    fn pump_ignores_trailing_partial_frame() {
        let full = vec![5u8; 12];
        let mut stream = full.clone();
        stream.extend_from_slice(&[7u8; 5]);

        let slot = Arc::new(Mutex::new(None));
        pump_frames(Cursor::new(stream), (2, 2), &slot).expect("pump");

        let frame = slot.lock().unwrap().clone().expect("frame present");
        assert_eq!(frame.data, full);
    }
}
