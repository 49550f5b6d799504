//! Pipeline supervisor: fixed-period capture against a variable-latency
//! detection round trip.
//!
//! The scheduler is a small state machine (`Idle` → `Capturing` →
//! `AwaitingResponse` → `Idle`, with `Stopped` terminal). A tick that
//! arrives while a request is outstanding is dropped on the floor, never
//! buffered, so at most one request is in flight at any instant and
//! responses apply strictly in dispatch order. When the service is slower
//! than the sampling period, the effective update rate degrades to the
//! service's response rate instead of queueing.

use std::{future::Future, pin::Pin, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use frame_source::{FfmpegSource, VideoSource};
use futures::{
    future::{Fuse, FusedFuture},
    FutureExt,
};
use metrics::{counter, gauge, histogram};
use tokio::{
    sync::watch,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::annotator::{
    client::{DetectError, DetectionClient, Detector},
    config::PipelineConfig,
    overlay::{encode_jpeg, OverlayRenderer},
    sampler::{FrameSampler, SampleError},
    server::spawn_preview_server,
    state::{
        DetectionResult, ErrorKind, PipelineState, PreviewPacket, SampledFrame, SharedPreview,
        SharedState,
    },
};

type DetectFuture = Pin<Box<dyn Future<Output = Result<DetectionResult, DetectError>>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Capturing,
    AwaitingResponse,
    Stopped,
}

pub(crate) struct PipelineScheduler<S, D> {
    sampler: FrameSampler<S>,
    client: D,
    renderer: OverlayRenderer,
    state: SharedState,
    preview: SharedPreview,
    period: Duration,
    jpeg_quality: u8,
    phase: Phase,
    frame_number: u64,
    dispatched_at: Option<Instant>,
}

impl<S: VideoSource, D: Detector> PipelineScheduler<S, D> {
    pub(crate) fn new(
        sampler: FrameSampler<S>,
        client: D,
        state: SharedState,
        preview: SharedPreview,
        period: Duration,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            sampler,
            client,
            renderer: OverlayRenderer,
            state,
            preview,
            period,
            jpeg_quality,
            phase: Phase::Idle,
            frame_number: 0,
            dispatched_at: None,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// Handle one timer tick: capture and hand back the frame to dispatch,
    /// or `None` when the tick is a no-op (busy, stopped, or source not
    /// ready).
    fn begin_tick(&mut self) -> Option<SampledFrame> {
        if self.phase != Phase::Idle {
            counter!("annotate_ticks_skipped_total").increment(1);
            debug!(phase = ?self.phase, "tick dropped; request still outstanding");
            return None;
        }

        self.phase = Phase::Capturing;
        match self.sampler.capture() {
            Ok(frame) => {
                self.phase = Phase::AwaitingResponse;
                if let Ok(mut state) = self.state.lock() {
                    state.in_flight = true;
                }
                counter!("annotate_requests_total").increment(1);
                gauge!("annotate_in_flight").set(1.0);
                Some(frame)
            }
            Err(SampleError::NotReady) => {
                debug!("source not ready; skipping tick");
                self.phase = Phase::Idle;
                None
            }
            Err(err) => {
                warn!("capture failed: {err}");
                self.phase = Phase::Idle;
                None
            }
        }
    }

    /// Apply a resolved round trip. A response arriving after stop is
    /// discarded without touching shared state.
    fn finish_request(&mut self, outcome: std::result::Result<DetectionResult, DetectError>) {
        if self.phase == Phase::Stopped {
            debug!("discarding response; pipeline already stopped");
            return;
        }

        if let Some(dispatched_at) = self.dispatched_at.take() {
            histogram!("annotate_round_trip_seconds").record(dispatched_at.elapsed().as_secs_f64());
        }
        gauge!("annotate_in_flight").set(0.0);

        if let Ok(mut state) = self.state.lock() {
            state.in_flight = false;
            match outcome {
                Ok(result) => {
                    debug!(
                        detections = result.detections.len(),
                        flagged = result.flagged,
                        "detection result applied"
                    );
                    state.latest_result = Some(result);
                    state.last_error = None;
                }
                Err(err) => {
                    let kind = ErrorKind::from(&err);
                    error!("detection request failed: {err}");
                    counter!("annotate_request_errors_total").increment(1);
                    // Keep the previous result: stale-but-valid beats blank.
                    state.last_error = Some(kind);
                }
            }
        }
        self.phase = Phase::Idle;
    }

    /// Repaint from the *current* live frame — not the frame that was sent,
    /// which may already be stale — and publish for the preview surface.
    fn repaint(&mut self) {
        let Some(frame) = self.sampler.current_frame() else {
            return;
        };
        let snapshot = match self.state.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };

        let packet = self
            .renderer
            .render(&frame, &snapshot)
            .and_then(|image| encode_jpeg(&image, self.jpeg_quality));
        match packet {
            Ok(jpeg) => {
                self.frame_number = self.frame_number.wrapping_add(1);
                if let Ok(mut guard) = self.preview.lock() {
                    *guard = Some(PreviewPacket {
                        jpeg,
                        frame_number: self.frame_number,
                        timestamp_ms: Utc::now().timestamp_millis(),
                    });
                }
            }
            Err(err) => warn!("overlay render failed: {err}"),
        }
    }

    /// Enter the terminal state and reset shared state to its initial value.
    pub(crate) fn stop(&mut self) {
        self.phase = Phase::Stopped;
        if let Ok(mut state) = self.state.lock() {
            *state = PipelineState::default();
        }
    }

    /// Drive the pipeline until `stop` fires. The in-flight request, if any,
    /// is allowed to complete rather than aborted; its resolution is then
    /// discarded against `Stopped`.
    pub(crate) async fn run(mut self, mut stop: watch::Receiver<bool>) -> Self {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut inflight: Fuse<DetectFuture> = Fuse::terminated();

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => {
                    self.stop();
                    if !inflight.is_terminated() {
                        let outcome = (&mut inflight).await;
                        self.finish_request(outcome);
                    }
                    break;
                }
                outcome = &mut inflight => {
                    self.finish_request(outcome);
                    self.repaint();
                }
                _ = ticker.tick() => {
                    counter!("annotate_ticks_total").increment(1);
                    if let Some(frame) = self.begin_tick() {
                        self.dispatched_at = Some(Instant::now());
                        inflight = (Box::pin(self.client.detect(frame)) as DetectFuture).fuse();
                    } else {
                        self.repaint();
                    }
                }
            }
        }

        self
    }
}

/// Wire up the whole pipeline from configuration and block until shutdown.
pub(crate) fn run(config: PipelineConfig) -> Result<()> {
    if config.verbose {
        info!(?config, "starting pipeline");
    }

    let source = FfmpegSource::spawn(&config.source_uri, (config.width, config.height))
        .with_context(|| format!("failed to start capture from {}", config.source_uri))?;

    let state = SharedState::default();
    let preview = SharedPreview::default();
    let preview_server = spawn_preview_server(&config.listen, preview.clone(), state.clone())?;
    info!(
        "preview available at http://{}/ (frame.jpg, stream.mjpg, state, metrics)",
        config.listen
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })
    .context("failed to install Ctrl+C handler")?;

    let sampler = FrameSampler::new(source, config.jpeg_quality);
    let client = DetectionClient::new(&config.endpoint)?;
    let scheduler = PipelineScheduler::new(
        sampler,
        client,
        state,
        preview,
        Duration::from_millis(config.period_ms),
        config.jpeg_quality,
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build pipeline runtime")?;
    info!(period_ms = config.period_ms, endpoint = %config.endpoint, "pipeline running; press Ctrl+C to stop");
    runtime.block_on(scheduler.run(stop_rx));

    preview_server.stop();
    info!("pipeline stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    use tokio::sync::watch;

    use super::{Phase, PipelineScheduler};
    use crate::annotator::client::{DetectError, Detector};
    use crate::annotator::sampler::FrameSampler;
    use crate::annotator::state::{
        Detection, DetectionResult, ErrorKind, PipelineState, SampledFrame, SharedPreview,
        SharedState,
    };
    use crate::annotator::testutil::StaticSource;

    /// Detector double: counts dispatches and answers with an empty success
    /// after `latency`. Failure paths are exercised through `finish_request`
    /// directly.
    #[derive(Clone)]
    struct ScriptedDetector {
        latency: Duration,
        dispatched: Arc<AtomicUsize>,
    }

    impl ScriptedDetector {
        fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                dispatched: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn dispatched(&self) -> usize {
            self.dispatched.load(Ordering::SeqCst)
        }
    }

    impl Detector for ScriptedDetector {
        fn detect(
            &self,
            _frame: SampledFrame,
        ) -> impl Future<Output = Result<DetectionResult, DetectError>> + 'static {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            let latency = self.latency;
            async move {
                tokio::time::sleep(latency).await;
                Ok(DetectionResult::default())
            }
        }
    }

    /// Flags on drop when the owning future never ran to completion.
    struct DrainGuard {
        done: bool,
        dropped_early: Arc<AtomicBool>,
    }

    impl Drop for DrainGuard {
        fn drop(&mut self) {
            if !self.done {
                self.dropped_early.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Detector whose future notices being cancelled before its response
    /// arrives.
    #[derive(Clone)]
    struct DrainingDetector {
        latency: Duration,
        dropped_early: Arc<AtomicBool>,
    }

    impl Detector for DrainingDetector {
        fn detect(
            &self,
            _frame: SampledFrame,
        ) -> impl Future<Output = Result<DetectionResult, DetectError>> + 'static {
            let mut guard = DrainGuard {
                done: false,
                dropped_early: self.dropped_early.clone(),
            };
            let latency = self.latency;
            async move {
                // Move the whole guard into the future; field-precise capture
                // would otherwise drop it before the future is polled.
                let mut guard = guard;
                tokio::time::sleep(latency).await;
                guard.done = true;
                Ok(person_result())
            }
        }
    }

    fn person_result() -> DetectionResult {
        DetectionResult {
            detections: vec![Detection {
                class: "person".into(),
                confidence: 0.92,
                bbox: [10.0, 20.0, 110.0, 220.0],
            }],
            flagged: true,
        }
    }

    fn scheduler_with<D: Detector>(
        source: StaticSource,
        detector: D,
    ) -> (PipelineScheduler<StaticSource, D>, SharedState) {
        let state = SharedState::default();
        let preview = SharedPreview::default();
        let scheduler = PipelineScheduler::new(
            FrameSampler::new(source, 85),
            detector,
            state.clone(),
            preview,
            Duration::from_millis(1_000),
            85,
        );
        (scheduler, state)
    }

    #[tokio::test(start_paused = true)]
    async fn slow_service_degrades_to_response_rate() {
        // Ticks every 1000ms, service answers in 3000ms: dispatches settle
        // to one per response, at t=1000, 4000, 7000, 10000 — never queued.
        let detector = ScriptedDetector::with_latency(Duration::from_millis(3_000));
        let dispatched = detector.clone();
        let (scheduler, state) = scheduler_with(StaticSource::solid(32, 24, [9, 9, 9]), detector);

        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = async {
            tokio::time::sleep(Duration::from_millis(10_500)).await;
            stop_tx.send(true).unwrap();
        };
        let (scheduler, ()) = tokio::join!(scheduler.run(stop_rx), driver);

        assert_eq!(dispatched.dispatched(), 4);
        assert_eq!(scheduler.phase(), Phase::Stopped);
        // Stop resets shared state to its initial value.
        assert_eq!(*state.lock().unwrap(), PipelineState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_in_flight_request_complete_then_discards_it() {
        // Dispatch at t=1000ms with a 5000ms round trip, stop at t=2000ms:
        // the outstanding request must run to completion (never aborted) and
        // its result must not reach shared state.
        let dropped_early = Arc::new(AtomicBool::new(false));
        let detector = DrainingDetector {
            latency: Duration::from_millis(5_000),
            dropped_early: dropped_early.clone(),
        };
        let (scheduler, state) = scheduler_with(StaticSource::solid(32, 24, [9, 9, 9]), detector);

        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = async {
            tokio::time::sleep(Duration::from_millis(2_000)).await;
            stop_tx.send(true).unwrap();
        };
        let (scheduler, ()) = tokio::join!(scheduler.run(stop_rx), driver);

        assert!(!dropped_early.load(Ordering::SeqCst));
        assert_eq!(scheduler.phase(), Phase::Stopped);
        assert_eq!(*state.lock().unwrap(), PipelineState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_source_issues_no_requests() {
        let detector = ScriptedDetector::with_latency(Duration::ZERO);
        let dispatched = detector.clone();
        let (scheduler, _state) = scheduler_with(StaticSource::empty(), detector);

        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = async {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            stop_tx.send(true).unwrap();
        };
        let (scheduler, ()) = tokio::join!(scheduler.run(stop_rx), driver);

        assert_eq!(dispatched.dispatched(), 0);
        assert_eq!(scheduler.phase(), Phase::Stopped);
    }

    #[test]
    fn successful_result_replaces_state_and_clears_error() {
        let detector = ScriptedDetector::with_latency(Duration::ZERO);
        let (mut scheduler, state) =
            scheduler_with(StaticSource::solid(32, 24, [9, 9, 9]), detector);

        assert!(scheduler.begin_tick().is_some());
        assert_eq!(scheduler.phase(), Phase::AwaitingResponse);
        assert!(state.lock().unwrap().in_flight);

        scheduler.finish_request(Ok(person_result()));
        let snapshot = state.lock().unwrap().clone();
        assert_eq!(snapshot.latest_result, Some(person_result()));
        assert!(!snapshot.in_flight);
        assert_eq!(snapshot.last_error, None);
        assert_eq!(scheduler.phase(), Phase::Idle);
    }

    #[test]
    fn failed_tick_preserves_latest_result() {
        let detector = ScriptedDetector::with_latency(Duration::ZERO);
        let (mut scheduler, state) =
            scheduler_with(StaticSource::solid(32, 24, [9, 9, 9]), detector);

        assert!(scheduler.begin_tick().is_some());
        scheduler.finish_request(Ok(person_result()));

        assert!(scheduler.begin_tick().is_some());
        scheduler.finish_request(Err(DetectError::Service(500)));

        let snapshot = state.lock().unwrap().clone();
        assert_eq!(snapshot.last_error, Some(ErrorKind::Service(500)));
        assert_eq!(snapshot.latest_result, Some(person_result()));
        assert!(!snapshot.in_flight);

        // The next tick proceeds normally.
        assert_eq!(scheduler.phase(), Phase::Idle);
        assert!(scheduler.begin_tick().is_some());
    }

    #[test]
    fn busy_scheduler_drops_ticks() {
        let detector = ScriptedDetector::with_latency(Duration::ZERO);
        let (mut scheduler, _state) =
            scheduler_with(StaticSource::solid(32, 24, [9, 9, 9]), detector);

        assert!(scheduler.begin_tick().is_some());
        // Single-flight: further ticks are no-ops until the response lands.
        assert!(scheduler.begin_tick().is_none());
        assert!(scheduler.begin_tick().is_none());
        assert_eq!(scheduler.phase(), Phase::AwaitingResponse);
    }

    #[test]
    fn not_ready_capture_returns_to_idle() {
        let detector = ScriptedDetector::with_latency(Duration::ZERO);
        let (mut scheduler, state) = scheduler_with(StaticSource::empty(), detector);

        assert!(scheduler.begin_tick().is_none());
        assert_eq!(scheduler.phase(), Phase::Idle);
        assert!(!state.lock().unwrap().in_flight);
    }

    #[test]
    fn response_after_stop_is_discarded() {
        let detector = ScriptedDetector::with_latency(Duration::ZERO);
        let (mut scheduler, state) =
            scheduler_with(StaticSource::solid(32, 24, [9, 9, 9]), detector);

        assert!(scheduler.begin_tick().is_some());
        scheduler.stop();
        let at_stop = state.lock().unwrap().clone();

        scheduler.finish_request(Ok(person_result()));
        assert_eq!(*state.lock().unwrap(), at_stop);
        assert_eq!(scheduler.phase(), Phase::Stopped);

        scheduler.finish_request(Err(DetectError::Service(503)));
        assert_eq!(*state.lock().unwrap(), at_stop);
    }

    #[test]
    fn repaint_publishes_preview_packets() {
        let detector = ScriptedDetector::with_latency(Duration::ZERO);
        let state = SharedState::default();
        let preview = SharedPreview::default();
        let mut scheduler = PipelineScheduler::new(
            FrameSampler::new(StaticSource::solid(32, 24, [9, 9, 9]), 85),
            detector,
            state.clone(),
            preview.clone(),
            Duration::from_millis(1_000),
            85,
        );

        scheduler.finish_request(Ok(person_result()));
        scheduler.repaint();
        let packet = preview.lock().unwrap().clone().expect("packet");
        assert_eq!(packet.frame_number, 1);
        assert_eq!(&packet.jpeg[..2], &[0xFF, 0xD8]);

        scheduler.repaint();
        let packet = preview.lock().unwrap().clone().expect("packet");
        assert_eq!(packet.frame_number, 2);
    }
}
