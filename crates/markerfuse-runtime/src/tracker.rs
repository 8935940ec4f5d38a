//! [`Tracker`] – calibration and tracking state machine.
//!
//! A tracker starts in [`TrackingMode::Learning`], where every frame feeds
//! the [`PairwiseEstimator`].  A single call to [`Tracker::resolve`] turns
//! the learned edges into a [`ReferenceTransformTable`] and switches to
//! [`TrackingMode::Resolved`], where frames are fused into one object pose by
//! the [`PoseFuser`].  The two modes never overlap: learning after resolution
//! and fusing before it are both reported as [`FusionError::WrongMode`].
//!
//! # Example
//!
//! ```rust
//! use markerfuse_runtime::tracker::{Tracker, TrackerConfig};
//! use markerfuse_types::{MarkerObservation, ObservationBatch, PoseRecord, TrackingMode};
//!
//! let mut tracker = Tracker::new(TrackerConfig::default()).unwrap();
//! let mut b = PoseRecord::identity();
//! b.translation[0] = 0.1;
//! let frame = ObservationBatch::new(
//!     1,
//!     vec![
//!         MarkerObservation { id: 45, pose: PoseRecord::identity() },
//!         MarkerObservation { id: 3, pose: b },
//!     ],
//! );
//! tracker.process_batch(&frame).unwrap();
//! tracker.resolve(45).unwrap();
//! assert_eq!(tracker.mode(), TrackingMode::Resolved);
//! ```

use markerfuse_perception::fusion::{DEFAULT_UPDATE_RATE, PoseFuser};
use markerfuse_perception::pairwise::{PairwiseEstimator, SmoothingConfig};
use markerfuse_perception::resolver::resolve_reference_table;
use markerfuse_perception::table::ReferenceTransformTable;
use markerfuse_perception::transform::Transform3D;
use markerfuse_types::{
    FusionError, MarkerId, ObservationBatch, PoseRecord, StampedPose, TrackingMode,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Reference marker used when none is configured.
pub const DEFAULT_REFERENCE_ID: MarkerId = 45;
/// Default parent frame of the published pose.
pub const DEFAULT_CAMERA_FRAME: &str = "rgb_camera_link";
/// Default child frame of the published pose.
pub const DEFAULT_OBJECT_FRAME: &str = "aruco_obj";

/// Configuration bundle for [`Tracker`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Marker whose frame defines the tracked object frame.
    pub reference_id: MarkerId,
    /// Edge smoothing used while learning.
    pub smoothing: SmoothingConfig,
    /// Blend rate of the fused pose, in `(0, 1]`.
    pub update_rate: f64,
    /// Frame the fused pose is expressed in.
    pub camera_frame_id: String,
    /// Frame name given to the tracked object.
    pub object_frame_id: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            reference_id: DEFAULT_REFERENCE_ID,
            smoothing: SmoothingConfig::default(),
            update_rate: DEFAULT_UPDATE_RATE,
            camera_frame_id: DEFAULT_CAMERA_FRAME.to_string(),
            object_frame_id: DEFAULT_OBJECT_FRAME.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────────────────

/// Diagnostic view of one learned edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSummary {
    pub from: MarkerId,
    pub to: MarkerId,
    pub updates: u64,
    pub transform: PoseRecord,
}

/// What [`Tracker::process_batch`] did with a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// The sequence number was already processed.
    Duplicate,
    /// Learning mode: the number of marker pairs updated.
    Learned { pairs: usize },
    /// Resolved mode: a fresh fused pose stamped with this frame.
    Fused(StampedPose),
    /// Resolved mode: nothing resolvable was visible; the previous pose is
    /// still current and was not re-stamped.
    Held,
    /// Resolved mode: nothing resolvable was visible and no pose exists yet.
    NoPose,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracker
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the estimator, the resolved table and the fuser.
#[derive(Debug)]
pub struct Tracker {
    config: TrackerConfig,
    mode: TrackingMode,
    estimator: PairwiseEstimator,
    table: Option<ReferenceTransformTable>,
    fuser: PoseFuser,
    last_sequence: Option<u64>,
    last_pose: Option<StampedPose>,
}

impl Tracker {
    /// Start a tracker in learning mode.
    ///
    /// Fails when `config.update_rate` is outside `(0, 1]`.
    pub fn new(config: TrackerConfig) -> Result<Self, FusionError> {
        let fuser = PoseFuser::new(config.update_rate)?;
        Ok(Self {
            estimator: PairwiseEstimator::new(config.smoothing),
            config,
            mode: TrackingMode::Learning,
            table: None,
            fuser,
            last_sequence: None,
            last_pose: None,
        })
    }

    /// Start directly in resolved mode with a previously saved table.
    ///
    /// The table's own reference marker wins over `config.reference_id`.
    pub fn from_table(
        mut config: TrackerConfig,
        table: ReferenceTransformTable,
    ) -> Result<Self, FusionError> {
        if table.reference_id() != config.reference_id {
            warn!(
                configured = config.reference_id,
                table = table.reference_id(),
                "Loaded table uses a different reference marker; using the table's"
            );
            config.reference_id = table.reference_id();
        }
        let mut tracker = Self::new(config)?;
        info!(
            reference = table.reference_id(),
            markers = table.len(),
            calibration = %table.calibration_id(),
            "Tracker starting from saved table"
        );
        tracker.table = Some(table);
        tracker.mode = TrackingMode::Resolved;
        Ok(tracker)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    pub fn estimator(&self) -> &PairwiseEstimator {
        &self.estimator
    }

    /// The resolved table, once in resolved mode.
    pub fn table(&self) -> Option<&ReferenceTransformTable> {
        self.table.as_ref()
    }

    /// The most recently published fused pose.
    pub fn fused_stamped_pose(&self) -> Option<&StampedPose> {
        self.last_pose.as_ref()
    }

    /// Feed one frame, skipping sequence numbers that were already seen.
    pub fn process_batch(&mut self, batch: &ObservationBatch) -> Result<FrameOutcome, FusionError> {
        if self.last_sequence.is_some_and(|last| batch.sequence <= last) {
            debug!(sequence = batch.sequence, "Skipping already processed frame");
            return Ok(FrameOutcome::Duplicate);
        }
        let outcome = match self.mode {
            TrackingMode::Learning => FrameOutcome::Learned {
                pairs: self.learn(batch)?,
            },
            TrackingMode::Resolved => match self.fuse(batch)? {
                Some(pose) => FrameOutcome::Fused(pose),
                None if self.last_pose.is_some() => FrameOutcome::Held,
                None => FrameOutcome::NoPose,
            },
        };
        self.last_sequence = Some(batch.sequence);
        Ok(outcome)
    }

    /// Sequence number of the last frame accepted by [`process_batch`](Self::process_batch).
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Forget the last sequence number so a new recording, numbered from
    /// the start again, is accepted.  Learned edges and the pose are kept.
    pub fn restart_sequence(&mut self) {
        debug!(last = ?self.last_sequence, "Sequence numbering restarted");
        self.last_sequence = None;
    }

    /// Learning mode only: update pairwise edges from one frame.
    pub fn learn(&mut self, batch: &ObservationBatch) -> Result<usize, FusionError> {
        self.require(TrackingMode::Learning)?;
        let markers = valid_markers(batch);
        Ok(self.estimator.observe(&markers))
    }

    /// Resolved mode only: fuse one frame into the object pose.
    ///
    /// Returns `None` when no visible marker resolves.  The previous pose is
    /// then kept unchanged and stays readable through
    /// [`fused_stamped_pose`](Self::fused_stamped_pose).
    pub fn fuse(&mut self, batch: &ObservationBatch) -> Result<Option<StampedPose>, FusionError> {
        self.require(TrackingMode::Resolved)?;
        let Some(table) = self.table.as_ref() else {
            return Err(FusionError::Table("resolved tracker has no table".into()));
        };

        let markers = valid_markers(batch);
        let contributing = markers.iter().filter(|(id, _)| table.resolves(*id)).count();
        if contributing == 0 {
            return Ok(None);
        }
        let Some(pose) = self.fuser.update(table, &markers) else {
            return Ok(None);
        };

        let stamped = StampedPose {
            stamp: batch.stamp,
            parent_frame: self.config.camera_frame_id.clone(),
            child_frame: self.config.object_frame_id.clone(),
            contributing_markers: contributing,
            pose: pose.to_record(),
        };
        self.last_pose = Some(stamped.clone());
        Ok(Some(stamped))
    }

    /// Freeze the learned edges into a table anchored at `reference` and
    /// switch to resolved mode.
    pub fn resolve(&mut self, reference: MarkerId) -> Result<&ReferenceTransformTable, FusionError> {
        self.require(TrackingMode::Learning)?;
        let table = resolve_reference_table(&self.estimator, reference);
        info!(
            reference,
            edges = self.estimator.len(),
            resolved = table.len(),
            "Calibration resolved; switching to tracking"
        );
        self.config.reference_id = reference;
        self.mode = TrackingMode::Resolved;
        self.fuser.reset();
        Ok(&*self.table.insert(table))
    }

    /// Learned edges in canonical order.
    pub fn edge_report(&self) -> Vec<EdgeSummary> {
        self.estimator
            .edges()
            .into_iter()
            .map(|edge| EdgeSummary {
                from: edge.pair.0,
                to: edge.pair.1,
                updates: edge.updates,
                transform: edge.transform.to_record(),
            })
            .collect()
    }

    fn require(&self, expected: TrackingMode) -> Result<(), FusionError> {
        if self.mode == expected {
            Ok(())
        } else {
            Err(FusionError::WrongMode {
                expected,
                actual: self.mode,
            })
        }
    }
}

/// Convert a batch to transforms, dropping markers with unusable poses.
fn valid_markers(batch: &ObservationBatch) -> Vec<(MarkerId, Transform3D)> {
    batch
        .markers
        .iter()
        .filter_map(|m| match Transform3D::from_record(&m.pose) {
            Some(t) => Some((m.id, t)),
            None => {
                warn!(marker = m.id, sequence = batch.sequence, "Ignoring invalid marker pose");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use markerfuse_types::MarkerObservation;

    fn at(x: f64) -> PoseRecord {
        PoseRecord {
            translation: [x, 0.0, 1.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
        }
    }

    fn frame(sequence: u64, markers: &[(MarkerId, PoseRecord)]) -> ObservationBatch {
        ObservationBatch::new(
            sequence,
            markers
                .iter()
                .map(|&(id, pose)| MarkerObservation { id, pose })
                .collect(),
        )
    }

    fn config(update_rate: f64) -> TrackerConfig {
        TrackerConfig {
            reference_id: 1,
            update_rate,
            ..TrackerConfig::default()
        }
    }

    /// Learn markers 1 and 2, 0.1 m apart along X, and resolve against 1.
    fn resolved(update_rate: f64) -> Tracker {
        let mut tracker = Tracker::new(config(update_rate)).unwrap();
        tracker.process_batch(&frame(1, &[(1, at(0.0)), (2, at(0.1))])).unwrap();
        tracker.resolve(1).unwrap();
        tracker
    }

    #[test]
    fn invalid_update_rate_fails_at_construction() {
        assert_eq!(
            Tracker::new(config(0.0)).unwrap_err(),
            FusionError::InvalidUpdateRate(0.0)
        );
        assert!(Tracker::new(config(1.5)).is_err());
    }

    #[test]
    fn starts_in_learning_mode() {
        let tracker = Tracker::new(TrackerConfig::default()).unwrap();
        assert_eq!(tracker.mode(), TrackingMode::Learning);
        assert!(tracker.table().is_none());
        assert_eq!(tracker.config().reference_id, DEFAULT_REFERENCE_ID);
    }

    #[test]
    fn fusing_before_resolution_is_rejected() {
        let mut tracker = Tracker::new(config(1.0)).unwrap();
        let err = tracker.fuse(&frame(1, &[(1, at(0.0))])).unwrap_err();
        assert_eq!(
            err,
            FusionError::WrongMode {
                expected: TrackingMode::Resolved,
                actual: TrackingMode::Learning,
            }
        );
    }

    #[test]
    fn learning_after_resolution_is_rejected() {
        let mut tracker = resolved(1.0);
        assert!(matches!(
            tracker.learn(&frame(5, &[(1, at(0.0)), (2, at(0.1))])),
            Err(FusionError::WrongMode { .. })
        ));
        assert!(matches!(tracker.resolve(1), Err(FusionError::WrongMode { .. })));
    }

    #[test]
    fn duplicate_sequences_are_skipped() {
        let mut tracker = Tracker::new(config(1.0)).unwrap();
        let batch = frame(3, &[(1, at(0.0)), (2, at(0.1))]);
        assert_eq!(tracker.process_batch(&batch).unwrap(), FrameOutcome::Learned { pairs: 1 });
        assert_eq!(tracker.process_batch(&batch).unwrap(), FrameOutcome::Duplicate);
        assert_eq!(
            tracker.process_batch(&frame(2, &[(1, at(0.0))])).unwrap(),
            FrameOutcome::Duplicate
        );
        assert_eq!(tracker.estimator().get(1, 2).unwrap().updates, 1);
    }

    #[test]
    fn invalid_poses_are_dropped() {
        let mut tracker = Tracker::new(config(1.0)).unwrap();
        let bad = PoseRecord {
            translation: [f64::NAN, 0.0, 0.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
        };
        let zero = PoseRecord {
            translation: [0.0; 3],
            rotation: [0.0; 4],
        };
        let outcome = tracker
            .process_batch(&frame(1, &[(1, at(0.0)), (2, bad), (3, zero)]))
            .unwrap();
        assert_eq!(outcome, FrameOutcome::Learned { pairs: 0 });
        assert!(tracker.estimator().is_empty());
    }

    #[test]
    fn edge_report_lists_learned_pairs() {
        let mut tracker = Tracker::new(config(1.0)).unwrap();
        tracker
            .process_batch(&frame(1, &[(3, at(0.2)), (1, at(0.0)), (2, at(0.1))]))
            .unwrap();
        let report = tracker.edge_report();
        let pairs: Vec<_> = report.iter().map(|e| (e.from, e.to)).collect();
        assert_eq!(pairs, vec![(1, 2), (1, 3), (2, 3)]);
        assert_relative_eq!(report[0].transform.translation[0], 0.1, epsilon = 1e-12);
        assert!(report.iter().all(|e| e.updates == 1));
    }

    #[test]
    fn resolved_tracker_fuses_and_stamps_pose() {
        let mut tracker = resolved(1.0);
        assert_eq!(tracker.mode(), TrackingMode::Resolved);
        assert_eq!(tracker.table().unwrap().len(), 1);

        // Only marker 2 visible at x = 0.6: the reference sits at x = 0.5.
        let batch = frame(2, &[(2, at(0.6))]);
        let FrameOutcome::Fused(pose) = tracker.process_batch(&batch).unwrap() else {
            panic!("expected a fused pose");
        };
        assert_eq!(pose.parent_frame, DEFAULT_CAMERA_FRAME);
        assert_eq!(pose.child_frame, DEFAULT_OBJECT_FRAME);
        assert_eq!(pose.contributing_markers, 1);
        assert_eq!(pose.stamp, batch.stamp);
        assert_relative_eq!(pose.pose.translation[0], 0.5, epsilon = 1e-12);
        assert_eq!(tracker.fused_stamped_pose(), Some(&pose));
    }

    #[test]
    fn occluded_frame_keeps_previous_pose() {
        let mut tracker = resolved(0.5);
        assert_eq!(
            tracker.process_batch(&frame(2, &[(9, at(3.0))])).unwrap(),
            FrameOutcome::NoPose
        );

        let FrameOutcome::Fused(first) = tracker.process_batch(&frame(3, &[(1, at(0.0))])).unwrap()
        else {
            panic!("expected a fused pose");
        };
        assert_eq!(
            tracker.process_batch(&frame(4, &[(9, at(3.0))])).unwrap(),
            FrameOutcome::Held
        );
        assert_eq!(tracker.fuse(&frame(5, &[])).unwrap(), None);
        assert_eq!(tracker.fused_stamped_pose(), Some(&first));
    }

    #[test]
    fn restarted_sequence_is_learned_again() {
        let mut tracker = Tracker::new(config(1.0)).unwrap();
        let pair = [(1, at(0.0)), (2, at(0.1))];
        tracker.process_batch(&frame(7, &pair)).unwrap();
        assert_eq!(tracker.last_sequence(), Some(7));
        assert_eq!(tracker.process_batch(&frame(1, &pair)).unwrap(), FrameOutcome::Duplicate);

        tracker.restart_sequence();
        assert_eq!(tracker.last_sequence(), None);
        assert_eq!(
            tracker.process_batch(&frame(1, &pair)).unwrap(),
            FrameOutcome::Learned { pairs: 1 }
        );
        assert_eq!(tracker.estimator().get(1, 2).unwrap().updates, 2);
    }

    #[test]
    fn from_table_starts_resolved_with_table_reference() {
        let mut table = ReferenceTransformTable::new(7);
        table.insert(8, Transform3D::identity());
        let tracker = Tracker::from_table(TrackerConfig::default(), table).unwrap();
        assert_eq!(tracker.mode(), TrackingMode::Resolved);
        assert_eq!(tracker.config().reference_id, 7);
        assert!(tracker.table().unwrap().resolves(8));
    }
}
