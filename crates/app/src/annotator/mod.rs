//! Live annotation loop: sample camera frames at a fixed period, send each
//! one to a remote detection service, and overlay the latest result on the
//! live preview.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `state`: Shared structs passed between stages.
//! - `sampler`: Frame capture and JPEG encoding.
//! - `client`: Multipart upload to the detection endpoint.
//! - `scheduler`: Fixed-period, single-flight request loop.
//! - `overlay`: Bounding box and label drawing.
//! - `server`: Actix Web preview endpoints.
//! - `telemetry`: Tracing and Prometheus wiring.

/// Re-export pipeline settings so callers can configure runs without reaching
/// into submodules.
pub(crate) use config::PipelineConfig;
/// Launch the annotation pipeline with a ready-made configuration.
pub(crate) use scheduler::run;

mod client;
mod config;
mod overlay;
mod sampler;
mod scheduler;
mod server;
mod state;
pub(crate) mod telemetry;

#[cfg(test)]
pub(crate) mod testutil;
