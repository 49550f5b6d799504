//! Actix Web preview server exposing the annotated stream and pipeline status.
//!
//! The server runs on a dedicated thread to keep the pipeline hot path free
//! from Actix runtime concerns. It reads the latest annotated frame and the
//! shared pipeline state; it never writes either.

use std::time::Duration;

use actix_web::{
    http::header,
    web::{self, Bytes},
    App, HttpResponse, HttpServer,
};
use anyhow::{Context, Result};
use async_stream::stream;
use tokio::sync::oneshot;
use tracing::error;

use crate::annotator::{
    state::{PreviewPacket, SharedPreview, SharedState},
    telemetry,
};

/// Shared state backing HTTP handlers.
pub(crate) struct ServerState {
    pub(crate) preview: SharedPreview,
    pub(crate) state: SharedState,
}

#[derive(Default)]
/// Handle for the preview server thread.
pub(crate) struct PreviewServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PreviewServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Spawn the preview server thread and return a handle that can stop it.
///
/// Blocks until the listener is bound so a bad `listen` address fails the
/// pipeline at startup instead of logging from a thread nobody watches.
pub(crate) fn spawn_preview_server(
    listen: &str,
    preview: SharedPreview,
    state: SharedState,
) -> Result<PreviewServer> {
    let listen = listen.to_string();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::io::Result<()>>();
    let handle = telemetry::spawn_thread("annotate-preview-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let bound = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(ServerState {
                        preview: preview.clone(),
                        state: state.clone(),
                    }))
                    .route("/", web::get().to(index_route))
                    .route("/frame.jpg", web::get().to(frame_handler))
                    .route("/stream.mjpg", web::get().to(stream_handler))
                    .route("/state", web::get().to(state_handler))
                    .route("/metrics", web::get().to(metrics_handler))
            })
            .bind(listen.as_str());
            let server = match bound {
                Ok(bound) => bound.run(),
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return Ok(());
                }
            };
            let _ = ready_tx.send(Ok(()));

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn preview server thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(PreviewServer {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }),
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(err).context("Failed to bind preview server listener")
        }
        Err(_) => {
            let _ = handle.join();
            anyhow::bail!("Preview server thread exited before binding")
        }
    }
}

/// Fetch the latest annotated frame from the shared pointer.
fn latest_packet(preview: &SharedPreview) -> Option<PreviewPacket> {
    match preview.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => None,
    }
}

/// Return the latest annotated frame as a single JPEG.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    match latest_packet(&state.preview) {
        Some(packet) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .body(packet.jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Stream annotated frames over a multipart MJPEG response.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(100));
        let mut last_sent = 0u64;
        loop {
            interval.tick().await;
            let packet = latest_packet(&state.preview);
            if let Some(packet) = packet {
                if packet.frame_number == last_sent {
                    continue;
                }
                last_sent = packet.frame_number;
                let mut payload = Vec::with_capacity(packet.jpeg.len() + 64);
                payload.extend_from_slice(b"--frame\r\n");
                payload.extend_from_slice(
                    format!("X-Sequence: {}\r\n", packet.frame_number).as_bytes(),
                );
                payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
                payload.extend_from_slice(&packet.jpeg);
                payload.extend_from_slice(b"\r\n");
                yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

/// Serve the viewer page.
async fn index_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}

/// Return the current pipeline state as JSON.
async fn state_handler(state: web::Data<ServerState>) -> HttpResponse {
    let snapshot = match state.state.lock() {
        Ok(guard) => guard.clone(),
        Err(err) => return HttpResponse::InternalServerError().body(err.to_string()),
    };
    HttpResponse::Ok().json(snapshot)
}

/// Render the Prometheus exposition text.
async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not initialised"),
    }
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <title>live-annotate</title>
  <style>
    body { font-family: sans-serif; background: #111; color: #ddd; margin: 1rem; }
    img { max-width: 100%; border: 1px solid #333; }
    pre { background: #1a1a1a; padding: 0.5rem; overflow-x: auto; }
  </style>
</head>
<body>
  <h2>Live Detection</h2>
  <img src="/stream.mjpg" alt="annotated stream">
  <pre id="state">waiting for state...</pre>
  <script>
    setInterval(async () => {
      try {
        const response = await fetch('/state');
        const state = await response.json();
        document.getElementById('state').textContent = JSON.stringify(state, null, 2);
      } catch (err) {
        document.getElementById('state').textContent = String(err);
      }
    }, 1000);
  </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::spawn_preview_server;
    use crate::annotator::state::{SharedPreview, SharedState};

    #[test]
    fn bind_failure_is_reported_at_spawn() {
        let result = spawn_preview_server(
            "definitely-not-an-address",
            SharedPreview::default(),
            SharedState::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn spawn_and_stop_round_trip() {
        let server = spawn_preview_server(
            "127.0.0.1:0",
            SharedPreview::default(),
            SharedState::default(),
        )
        .expect("spawn");
        server.stop();
    }
}
