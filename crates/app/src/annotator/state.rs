use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// One recognized object instance, in pixel coordinates of the sampled frame.
/// Immutable once received.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub(crate) struct Detection {
    pub(crate) class: String,
    pub(crate) confidence: f32,
    pub(crate) bbox: [f32; 4],
}

/// Result of one successful detection round trip. Each new result supersedes
/// the previous one entirely; there is no merging.
///
/// A body without `detections` decodes as an empty list and a body without
/// `flagged` as `false` — both are valid service responses, not errors.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub(crate) struct DetectionResult {
    #[serde(default)]
    pub(crate) detections: Vec<Detection>,
    #[serde(default)]
    pub(crate) flagged: bool,
}

/// Request-layer failure classification surfaced to status consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ErrorKind {
    Network,
    Service(u16),
    Decode,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Service(status) => write!(f, "http {status}"),
            ErrorKind::Decode => write!(f, "decode"),
        }
    }
}

/// Shared pipeline state: written only by the scheduler's response handling,
/// read by the renderer and the status endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub(crate) struct PipelineState {
    pub(crate) latest_result: Option<DetectionResult>,
    pub(crate) in_flight: bool,
    pub(crate) last_error: Option<ErrorKind>,
}

/// Encoded still image captured for one request. Owned by the in-flight
/// request that produced it and discarded once that request resolves.
pub(crate) struct SampledFrame {
    pub(crate) jpeg: Vec<u8>,
    pub(crate) width: u32,
    pub(crate) height: u32,
}

/// Annotated preview frame published for the HTTP surface.
#[derive(Clone)]
pub(crate) struct PreviewPacket {
    pub(crate) jpeg: Vec<u8>,
    pub(crate) frame_number: u64,
    pub(crate) timestamp_ms: i64,
}

pub(crate) type SharedState = Arc<Mutex<PipelineState>>;
pub(crate) type SharedPreview = Arc<Mutex<Option<PreviewPacket>>>;
