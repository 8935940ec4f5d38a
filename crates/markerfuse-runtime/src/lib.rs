//! `markerfuse-runtime` – orchestration around the fusion core.
//!
//! # Modules
//!
//! - [`tracker`] – [`Tracker`][tracker::Tracker]: learning / resolved state
//!   machine that owns the pairwise estimator, the reference table and the
//!   pose fuser, and turns [`ObservationBatch`][markerfuse_types::ObservationBatch]es
//!   into [`StampedPose`][markerfuse_types::StampedPose]s.
//! - [`pipeline`] – [`run_fusion_loop`][pipeline::run_fusion_loop]: the
//!   timer-driven loop that reads frames from the
//!   [`FrameBus`][markerfuse_middleware::FrameBus], switches from learning to
//!   tracking and publishes fused poses.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP span export.

pub mod pipeline;
pub mod telemetry;
pub mod tracker;

pub use pipeline::{PipelineConfig, PipelineError, PipelineReport, PipelineSignals, run_fusion_loop};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use tracker::{EdgeSummary, FrameOutcome, Tracker, TrackerConfig};
