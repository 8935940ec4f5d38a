use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier printed on a fiducial marker (e.g. an ArUco dictionary index).
pub type MarkerId = u32;

/// Wire-level rigid pose: translation in metres plus a unit quaternion stored
/// as `[x, y, z, w]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseRecord {
    pub translation: [f64; 3],
    pub rotation: [f64; 4],
}

impl PoseRecord {
    /// The identity pose.
    pub fn identity() -> Self {
        Self {
            translation: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
        }
    }

    /// `true` when every component is finite.
    pub fn is_finite(&self) -> bool {
        self.translation.iter().chain(self.rotation.iter()).all(|v| v.is_finite())
    }
}

/// One marker detected by the external detector, posed in the camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkerObservation {
    pub id: MarkerId,
    pub pose: PoseRecord,
}

/// All markers detected in a single camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationBatch {
    /// Monotonic frame counter assigned by the producer.
    pub sequence: u64,
    pub stamp: DateTime<Utc>,
    #[serde(default)]
    pub markers: Vec<MarkerObservation>,
}

impl ObservationBatch {
    pub fn new(sequence: u64, markers: Vec<MarkerObservation>) -> Self {
        Self {
            sequence,
            stamp: Utc::now(),
            markers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Ids in detection order.
    pub fn ids(&self) -> Vec<MarkerId> {
        self.markers.iter().map(|m| m.id).collect()
    }
}

/// The fused object pose as handed to downstream consumers (e.g. a transform
/// broadcaster).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedPose {
    pub stamp: DateTime<Utc>,
    /// Frame the pose is expressed in, e.g. `"rgb_camera_link"`.
    pub parent_frame: String,
    /// Frame of the tracked object, e.g. `"aruco_obj"`.
    pub child_frame: String,
    /// Number of markers that contributed to this estimate.
    pub contributing_markers: usize,
    pub pose: PoseRecord,
}

/// Calibration / fusion mode of the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    /// Pairwise edges are being accumulated.
    Learning,
    /// The reference table is fixed and observations are fused.
    Resolved,
}

impl std::fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackingMode::Learning => write!(f, "learning"),
            TrackingMode::Resolved => write!(f, "resolved"),
        }
    }
}

/// Errors shared across the marker fusion crates.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FusionError {
    #[error("Invalid update rate {0}: must lie in (0, 1]")]
    InvalidUpdateRate(f64),

    #[error("Invalid {name} smoothing factor {value}: must lie in [0, 1)")]
    InvalidSmoothing { name: String, value: f64 },

    #[error("Operation requires {expected} mode but tracker is {actual}")]
    WrongMode {
        expected: TrackingMode,
        actual: TrackingMode,
    },

    #[error("Reference table error: {0}")]
    Table(String),
}
