//! Timer-driven fusion loop.
//!
//! Wires a [`Tracker`] to a [`FrameBus`]: on every tick the loop takes the
//! newest unseen frame snapshot, feeds it to the tracker and publishes the
//! fused pose.  While the tracker is still learning, the loop resolves the
//! calibration once the calibration window has elapsed or the input has
//! ended, whichever comes first, and saves the table if a path is
//! configured.
//!
//! # Shutdown
//!
//! The loop stops when [`PipelineSignals::shutdown`] is raised, or once
//! [`PipelineSignals::input_finished`] is raised and the last frame has been
//! consumed.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use markerfuse_middleware::FrameBus;
use markerfuse_perception::table::TableError;
use markerfuse_types::{FusionError, TrackingMode};
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::tracker::{FrameOutcome, Tracker};

/// Default period of the fusion timer.
pub const DEFAULT_FUSION_INTERVAL: Duration = Duration::from_millis(100);
/// Default length of the learning phase.
pub const DEFAULT_CALIBRATION_WINDOW: Duration = Duration::from_secs(120);

/// Errors that abort the fusion loop.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Fusion(#[from] FusionError),

    #[error("Failed to persist reference table: {0}")]
    Table(#[from] TableError),

    #[error("Fusion interval must be positive")]
    ZeroInterval,
}

/// Loop timing and persistence settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub fusion_interval: Duration,
    pub calibration_window: Duration,
    /// Where to save the table after resolution.
    pub table_path: Option<PathBuf>,
}

impl PipelineConfig {
    /// Build a config, rejecting a zero fusion interval.
    pub fn new(
        fusion_interval: Duration,
        calibration_window: Duration,
        table_path: Option<PathBuf>,
    ) -> Result<Self, PipelineError> {
        let config = Self {
            fusion_interval,
            calibration_window,
            table_path,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.fusion_interval.is_zero() {
            return Err(PipelineError::ZeroInterval);
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fusion_interval: DEFAULT_FUSION_INTERVAL,
            calibration_window: DEFAULT_CALIBRATION_WINDOW,
            table_path: None,
        }
    }
}

/// Flags shared between the loop, the producer and the Ctrl-C handler.
#[derive(Debug, Clone, Default)]
pub struct PipelineSignals {
    /// Raised by the producer after its final frame.
    pub input_finished: Arc<AtomicBool>,
    /// Raised to stop the loop at the next tick.
    pub shutdown: Arc<AtomicBool>,
}

/// Counters returned when the loop exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub frames_processed: u64,
    pub frames_learned: u64,
    pub poses_published: u64,
    /// Markers in the table, if the tracker ended up resolved.
    pub resolved_markers: Option<usize>,
}

/// Run the fusion loop until shutdown or end of input.
///
/// Returns the tracker so callers can inspect the final table and pose.
/// Fails before reading any frame if `config` does not validate.
pub async fn run_fusion_loop(
    mut tracker: Tracker,
    bus: FrameBus,
    config: PipelineConfig,
    signals: PipelineSignals,
) -> Result<(Tracker, PipelineReport), PipelineError> {
    config.validate()?;
    let mut frames = bus.subscribe_frames();
    let mut ticker = tokio::time::interval(config.fusion_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();
    let mut report = PipelineReport::default();

    info!(
        mode = %tracker.mode(),
        interval_ms = config.fusion_interval.as_millis() as u64,
        window_s = config.calibration_window.as_secs(),
        "Fusion loop started"
    );

    loop {
        ticker.tick().await;
        if signals.shutdown.load(Ordering::SeqCst) {
            info!("Shutdown requested; stopping fusion loop");
            break;
        }

        // Read the flag before the frame so a final frame is never missed.
        let input_done = signals.input_finished.load(Ordering::SeqCst);
        let batch = frames.take_new();

        if let Some(batch) = &batch {
            report.frames_processed += 1;
            match tracker.process_batch(batch)? {
                FrameOutcome::Learned { .. } => report.frames_learned += 1,
                FrameOutcome::Fused(pose) => {
                    bus.publish_pose(pose);
                    report.poses_published += 1;
                }
                FrameOutcome::Held | FrameOutcome::NoPose | FrameOutcome::Duplicate => {}
            }
        }

        if tracker.mode() == TrackingMode::Learning {
            let window_over = started.elapsed() >= config.calibration_window;
            if window_over || input_done {
                debug!(window_over, input_done, "Calibration phase over");
                resolve_and_save(&mut tracker, config.table_path.as_ref())?;
            }
        }

        if input_done && batch.is_none() {
            info!("Input finished; stopping fusion loop");
            break;
        }
    }

    report.resolved_markers = tracker.table().map(|t| t.len());
    info!(
        frames = report.frames_processed,
        poses = report.poses_published,
        "Fusion loop stopped"
    );
    Ok((tracker, report))
}

/// Resolve against the configured reference and persist the table.
pub fn resolve_and_save(
    tracker: &mut Tracker,
    table_path: Option<&PathBuf>,
) -> Result<(), PipelineError> {
    let reference = tracker.config().reference_id;
    let table = tracker.resolve(reference)?;
    if let Some(path) = table_path {
        table.save(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerConfig;
    use approx::assert_relative_eq;
    use markerfuse_perception::table::ReferenceTransformTable;
    use markerfuse_perception::transform::Transform3D;
    use markerfuse_types::{MarkerId, MarkerObservation, ObservationBatch, PoseRecord};

    fn at(x: f64) -> PoseRecord {
        PoseRecord {
            translation: [x, 0.0, 1.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
        }
    }

    fn frame(sequence: u64, markers: &[(MarkerId, f64)]) -> ObservationBatch {
        ObservationBatch::new(
            sequence,
            markers
                .iter()
                .map(|&(id, x)| MarkerObservation { id, pose: at(x) })
                .collect(),
        )
    }

    fn tracker() -> Tracker {
        Tracker::new(TrackerConfig {
            reference_id: 1,
            update_rate: 1.0,
            ..TrackerConfig::default()
        })
        .unwrap()
    }

    fn fast(window: Duration, table_path: Option<PathBuf>) -> PipelineConfig {
        PipelineConfig {
            fusion_interval: Duration::from_millis(5),
            calibration_window: window,
            table_path,
        }
    }

    #[tokio::test]
    async fn window_expiry_resolves_then_fuses() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let table_path = dir.path().join("tables").join("table.json");
        let bus = FrameBus::default();
        bus.publish_frame(frame(1, &[(1, 0.0), (2, 0.1)]))?;

        let signals = PipelineSignals::default();
        let handle = tokio::spawn(run_fusion_loop(
            tracker(),
            bus.clone(),
            fast(Duration::ZERO, Some(table_path.clone())),
            signals.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(5), bus.wait_consumed(1)).await?;
        bus.publish_frame(frame(2, &[(2, 0.6)]))?;
        tokio::time::timeout(Duration::from_secs(5), bus.wait_consumed(2)).await?;
        signals.input_finished.store(true, Ordering::SeqCst);

        let (tracker, report) = tokio::time::timeout(Duration::from_secs(5), handle).await???;
        assert_eq!(tracker.mode(), TrackingMode::Resolved);
        assert_eq!(report.frames_processed, 2);
        assert_eq!(report.frames_learned, 1);
        assert_eq!(report.poses_published, 1);
        assert_eq!(report.resolved_markers, Some(1));

        let pose = bus.latest_pose().ok_or("no pose published")?;
        assert_relative_eq!(pose.pose.translation[0], 0.5, epsilon = 1e-12);

        let saved = ReferenceTransformTable::load(&table_path)?;
        assert_eq!(saved.reference_id(), 1);
        assert!(saved.resolves(2));
        Ok(())
    }

    #[tokio::test]
    async fn end_of_input_resolves_learning_tracker() -> Result<(), Box<dyn std::error::Error>> {
        let bus = FrameBus::default();
        let signals = PipelineSignals::default();
        let handle = tokio::spawn(run_fusion_loop(
            tracker(),
            bus.clone(),
            fast(Duration::from_secs(600), None),
            signals.clone(),
        ));

        for sequence in 1..=3 {
            bus.publish_frame(frame(sequence, &[(1, 0.0), (2, 0.1), (3, 0.3)]))?;
            tokio::time::timeout(Duration::from_secs(5), bus.wait_consumed(sequence)).await?;
        }
        signals.input_finished.store(true, Ordering::SeqCst);

        let (tracker, report) = tokio::time::timeout(Duration::from_secs(5), handle).await???;
        assert_eq!(report.frames_learned, 3);
        assert_eq!(report.poses_published, 0);
        assert_eq!(tracker.mode(), TrackingMode::Resolved);
        assert_eq!(tracker.table().map(|t| t.len()), Some(2));
        assert_eq!(tracker.estimator().get(1, 2).map(|e| e.updates), Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn saved_table_skips_learning() -> Result<(), Box<dyn std::error::Error>> {
        let mut table = ReferenceTransformTable::new(1);
        table.insert(
            2,
            Transform3D::from_record(&PoseRecord {
                translation: [-0.1, 0.0, 0.0],
                rotation: [0.0, 0.0, 0.0, 1.0],
            })
            .ok_or("bad record")?,
        );
        let tracker = Tracker::from_table(
            TrackerConfig {
                reference_id: 1,
                update_rate: 1.0,
                ..TrackerConfig::default()
            },
            table,
        )?;

        let bus = FrameBus::default();
        let mut poses = bus.subscribe_poses();
        let signals = PipelineSignals::default();
        let handle = tokio::spawn(run_fusion_loop(
            tracker,
            bus.clone(),
            fast(Duration::ZERO, None),
            signals.clone(),
        ));

        bus.publish_frame(frame(1, &[(2, 1.1)]))?;
        tokio::time::timeout(Duration::from_secs(5), poses.changed()).await??;
        let x = poses.borrow().as_ref().map(|p| p.pose.translation[0]);
        assert_relative_eq!(x.ok_or("no pose")?, 1.0, epsilon = 1e-12);

        signals.input_finished.store(true, Ordering::SeqCst);
        let (_, report) = tokio::time::timeout(Duration::from_secs(5), handle).await???;
        assert_eq!(report.frames_learned, 0);
        assert_eq!(report.poses_published, 1);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_stops_loop() -> Result<(), Box<dyn std::error::Error>> {
        let bus = FrameBus::default();
        let signals = PipelineSignals::default();
        let handle = tokio::spawn(run_fusion_loop(
            tracker(),
            bus.clone(),
            fast(Duration::from_secs(600), None),
            signals.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        signals.shutdown.store(true, Ordering::SeqCst);
        let (tracker, report) = tokio::time::timeout(Duration::from_secs(5), handle).await???;
        assert_eq!(tracker.mode(), TrackingMode::Learning);
        assert_eq!(report.resolved_markers, None);
        Ok(())
    }

    #[tokio::test]
    async fn held_pose_is_not_republished() -> Result<(), Box<dyn std::error::Error>> {
        let bus = FrameBus::default();
        bus.publish_frame(frame(1, &[(1, 0.0), (2, 0.1)]))?;
        let signals = PipelineSignals::default();
        let handle = tokio::spawn(run_fusion_loop(
            tracker(),
            bus.clone(),
            fast(Duration::ZERO, None),
            signals.clone(),
        ));
        tokio::time::timeout(Duration::from_secs(5), bus.wait_consumed(1)).await?;

        // Marker 9 is not in the table, so the last frame only holds the pose.
        for batch in [frame(2, &[(2, 0.6)]), frame(3, &[(9, 2.0)])] {
            let sequence = bus.publish_frame(batch)?;
            tokio::time::timeout(Duration::from_secs(5), bus.wait_consumed(sequence)).await?;
        }
        signals.input_finished.store(true, Ordering::SeqCst);

        let (tracker, report) = tokio::time::timeout(Duration::from_secs(5), handle).await???;
        assert_eq!(report.frames_processed, 3);
        assert_eq!(report.poses_published, 1);
        assert_eq!(bus.latest_pose().as_ref(), tracker.fused_stamped_pose());
        Ok(())
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let result = run_fusion_loop(
            tracker(),
            FrameBus::default(),
            PipelineConfig {
                fusion_interval: Duration::ZERO,
                ..PipelineConfig::default()
            },
            PipelineSignals::default(),
        )
        .await;
        assert!(matches!(result, Err(PipelineError::ZeroInterval)));
        assert!(matches!(
            PipelineConfig::new(Duration::ZERO, DEFAULT_CALIBRATION_WINDOW, None),
            Err(PipelineError::ZeroInterval)
        ));
        assert!(PipelineConfig::new(DEFAULT_FUSION_INTERVAL, Duration::ZERO, None).is_ok());
    }

    #[test]
    fn resolve_and_save_requires_learning_mode() {
        let mut tracker = tracker();
        assert!(resolve_and_save(&mut tracker, None).is_ok());
        assert!(matches!(
            resolve_and_save(&mut tracker, None),
            Err(PipelineError::Fusion(FusionError::WrongMode { .. }))
        ));
    }
}
