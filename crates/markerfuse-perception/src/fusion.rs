//! Runtime pose fusion.
//!
//! Every visible marker that the [`ReferenceTransformTable`] can resolve
//! yields one candidate pose of the reference frame in the camera frame:
//!
//! ```text
//! candidate = T_cam_marker ∘ T_marker_ref
//! ```
//!
//! Candidates are fused (translation by arithmetic mean, rotation by
//! quaternion average) and the result is blended with the previous output:
//!
//! ```text
//! t_out = (1 − r) · t_prev + r · t_fused
//! q_out = avg({q_prev, q_fused}, weights = {1 − r, r})
//! ```
//!
//! With `r == 1` the fused candidate replaces the previous output outright.
//!
//! # Example
//!
//! ```rust
//! use markerfuse_perception::fusion::PoseFuser;
//! use markerfuse_perception::table::ReferenceTransformTable;
//! use markerfuse_perception::transform::Transform3D;
//! use nalgebra::{UnitQuaternion, Vector3};
//!
//! let table = ReferenceTransformTable::new(45);
//! let mut fuser = PoseFuser::new(1.0).unwrap();
//!
//! let observed = Transform3D::new(Vector3::new(0.0, 0.0, 1.0), UnitQuaternion::identity());
//! let pose = fuser.update(&table, &[(45, observed)]).unwrap();
//! assert!((pose.translation.z - 1.0).abs() < 1e-12);
//! ```

use markerfuse_types::{FusionError, MarkerId};
use nalgebra::{UnitQuaternion, Vector3};
use tracing::trace;

use crate::averaging::average_quaternions;
use crate::table::ReferenceTransformTable;
use crate::transform::Transform3D;

/// Default blend rate applied to each new fused candidate.
pub const DEFAULT_UPDATE_RATE: f64 = 0.1;

/// Reference-frame candidates for the markers in one frame that `table`
/// can resolve, in detection order.
pub fn candidates(
    table: &ReferenceTransformTable,
    markers: &[(MarkerId, Transform3D)],
) -> Vec<(MarkerId, Transform3D)> {
    markers
        .iter()
        .filter_map(|(id, observed)| {
            let to_reference = table.get(*id)?;
            Some((*id, observed.compose(&to_reference)))
        })
        .collect()
}

/// Unweighted fusion of candidate poses.  `None` for an empty slice.
pub fn fuse_candidates(poses: &[Transform3D]) -> Option<Transform3D> {
    if poses.is_empty() {
        return None;
    }
    let sum: Vector3<f64> = poses.iter().map(|p| p.translation).sum();
    let translation = sum / poses.len() as f64;
    let rotations: Vec<UnitQuaternion<f64>> = poses.iter().map(|p| p.rotation).collect();
    Some(Transform3D::new(translation, average_quaternions(&rotations, None)))
}

/// Fuses per-frame marker observations into one smoothed object pose.
#[derive(Debug, Clone)]
pub struct PoseFuser {
    update_rate: f64,
    current: Option<Transform3D>,
    frames_fused: u64,
}

impl PoseFuser {
    /// Create a fuser with blend rate `update_rate`.
    ///
    /// The rate must lie in `(0, 1]`; anything else is rejected here so that
    /// a misconfiguration fails at startup rather than on every frame.
    pub fn new(update_rate: f64) -> Result<Self, FusionError> {
        if !(update_rate.is_finite() && update_rate > 0.0 && update_rate <= 1.0) {
            return Err(FusionError::InvalidUpdateRate(update_rate));
        }
        Ok(Self {
            update_rate,
            current: None,
            frames_fused: 0,
        })
    }

    pub fn update_rate(&self) -> f64 {
        self.update_rate
    }

    /// The current fused pose, `None` until the first resolvable frame.
    pub fn current(&self) -> Option<Transform3D> {
        self.current
    }

    /// Number of frames that changed the fused pose.
    pub fn frames_fused(&self) -> u64 {
        self.frames_fused
    }

    /// Fuse one frame of observations (each T_cam_marker).
    ///
    /// Markers the table cannot resolve are ignored.  If none remain the
    /// previous pose is kept unchanged, which is the expected behaviour
    /// during a transient occlusion.  Returns the (possibly unchanged)
    /// current pose.
    pub fn update(
        &mut self,
        table: &ReferenceTransformTable,
        markers: &[(MarkerId, Transform3D)],
    ) -> Option<Transform3D> {
        let frame = candidates(table, markers);
        let poses: Vec<Transform3D> = frame.iter().map(|(_, p)| *p).collect();
        let Some(fused) = fuse_candidates(&poses) else {
            trace!(detected = markers.len(), "No resolvable markers in frame");
            return self.current;
        };
        self.current = Some(self.blend(fused));
        self.frames_fused += 1;
        self.current
    }

    fn blend(&self, fused: Transform3D) -> Transform3D {
        let r = self.update_rate;
        match self.current {
            Some(previous) if r < 1.0 => {
                let translation = (1.0 - r) * previous.translation + r * fused.translation;
                let rotation = average_quaternions(
                    &[previous.rotation, fused.rotation],
                    Some(&[1.0 - r, r]),
                );
                Transform3D::new(translation, rotation)
            }
            _ => fused,
        }
    }

    /// Forget the fused pose, e.g. after the table is replaced.
    pub fn reset(&mut self) {
        self.current = None;
        self.frames_fused = 0;
    }
}
