//! HTTP client for the remote detection service.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use thiserror::Error;

use crate::annotator::state::{DetectionResult, ErrorKind, SampledFrame};

/// Upper bound on a single round trip. A service slower than this is treated
/// as a transport failure; the next tick tries again.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub(crate) enum DetectError {
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("service returned HTTP {0}")]
    Service(u16),
    #[error("invalid response body: {0}")]
    Decode(#[source] serde_json::Error),
}

impl From<&DetectError> for ErrorKind {
    fn from(err: &DetectError) -> Self {
        match err {
            DetectError::Network(_) => ErrorKind::Network,
            DetectError::Service(status) => ErrorKind::Service(*status),
            DetectError::Decode(_) => ErrorKind::Decode,
        }
    }
}

/// Seam the scheduler dispatches through; lets tests script round trips.
///
/// The returned future must not borrow the detector so it can outlive the
/// call site as the single in-flight request.
pub(crate) trait Detector {
    fn detect(
        &self,
        frame: SampledFrame,
    ) -> impl Future<Output = Result<DetectionResult, DetectError>> + 'static;
}

/// Sends one encoded frame per call to `{base_url}/detect` as a multipart
/// upload. No retries live at this layer; a call yields exactly one result
/// or one failure.
#[derive(Clone)]
pub(crate) struct DetectionClient {
    http: reqwest::Client,
    detect_url: String,
}

impl DetectionClient {
    pub(crate) fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        let detect_url = format!("{}/detect", base_url.trim_end_matches('/'));
        Ok(Self { http, detect_url })
    }
}

impl Detector for DetectionClient {
    fn detect(
        &self,
        frame: SampledFrame,
    ) -> impl Future<Output = Result<DetectionResult, DetectError>> + 'static {
        let http = self.http.clone();
        let url = self.detect_url.clone();
        async move {
            let part = Part::bytes(frame.jpeg)
                .file_name("frame.jpg")
                .mime_str("image/jpeg")
                .map_err(DetectError::Network)?;
            let form = Form::new().part("file", part);

            let response = http
                .post(&url)
                .multipart(form)
                .send()
                .await
                .map_err(DetectError::Network)?;
            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(DetectError::Network)?;
            decode_response(status, &body)
        }
    }
}

/// Classify the HTTP outcome and decode the body. Pure over `(status, bytes)`
/// so wire handling is testable without a live service.
pub(crate) fn decode_response(status: u16, body: &[u8]) -> Result<DetectionResult, DetectError> {
    if !(200..300).contains(&status) {
        return Err(DetectError::Service(status));
    }
    serde_json::from_slice(body).map_err(DetectError::Decode)
}
