//! Pairwise marker-to-marker transform estimation.
//!
//! Every frame in which two or more markers are visible yields one noisy
//! measurement of the rigid offset between each pair of them.  The
//! [`PairwiseEstimator`] keeps one [`PairwiseEdge`] per unordered pair and
//! folds each new measurement in with heavy exponential smoothing so that a
//! long-running estimate converges instead of chasing detection noise:
//!
//! ```text
//! t_new = α · t_old + (1 − α) · t_observed
//! q_new = avg({q_old, q_observed}, weights = {α_rot, 1 − α_rot})
//! ```
//!
//! Edges are stored once, under the canonical `(lower id, higher id)` key.
//! [`PairwiseEstimator::edge`] inverts the stored transform on demand when
//! asked for the reverse direction.

use std::collections::HashMap;

use markerfuse_types::{FusionError, MarkerId};
use tracing::debug;

use crate::averaging::average_quaternions;
use crate::transform::Transform3D;

/// Default translation smoothing factor (weight kept on the old estimate).
pub const DEFAULT_TRANSLATION_SMOOTHING: f64 = 0.99;
/// Default rotation smoothing factor (weight kept on the old estimate).
pub const DEFAULT_ROTATION_SMOOTHING: f64 = 0.7;

/// Smoothing factors for the pairwise running averages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothingConfig {
    translation: f64,
    rotation: f64,
}

impl SmoothingConfig {
    /// Validate and build a smoothing configuration.
    ///
    /// Both factors must lie in `[0, 1)`: a factor of 1 would freeze an edge
    /// at its first observation forever.
    pub fn new(translation: f64, rotation: f64) -> Result<Self, FusionError> {
        check_factor("translation", translation)?;
        check_factor("rotation", rotation)?;
        Ok(Self {
            translation,
            rotation,
        })
    }

    pub fn translation(&self) -> f64 {
        self.translation
    }

    pub fn rotation(&self) -> f64 {
        self.rotation
    }
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            translation: DEFAULT_TRANSLATION_SMOOTHING,
            rotation: DEFAULT_ROTATION_SMOOTHING,
        }
    }
}

fn check_factor(name: &str, value: f64) -> Result<(), FusionError> {
    if value.is_finite() && (0.0..1.0).contains(&value) {
        Ok(())
    } else {
        Err(FusionError::InvalidSmoothing {
            name: name.to_string(),
            value,
        })
    }
}

/// Canonical key for an unordered marker pair.
pub fn canonical_pair(a: MarkerId, b: MarkerId) -> (MarkerId, MarkerId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Running estimate of the transform between two markers.
#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseEdge {
    /// `(a, b)` with `a < b`.
    pub pair: (MarkerId, MarkerId),
    /// T_a_b: pose of marker b expressed in marker a's frame.
    pub transform: Transform3D,
    /// Number of co-observations folded into this edge.
    pub updates: u64,
}

impl PairwiseEdge {
    fn new(pair: (MarkerId, MarkerId), transform: Transform3D) -> Self {
        Self {
            pair,
            transform,
            updates: 1,
        }
    }

    fn update(&mut self, observed: &Transform3D, smoothing: &SmoothingConfig) {
        let alpha = smoothing.translation;
        self.transform.translation =
            alpha * self.transform.translation + (1.0 - alpha) * observed.translation;

        let alpha_rot = smoothing.rotation;
        self.transform.rotation = average_quaternions(
            &[self.transform.rotation, observed.rotation],
            Some(&[alpha_rot, 1.0 - alpha_rot]),
        );
        self.updates += 1;
    }
}

/// Accumulates [`PairwiseEdge`]s from simultaneous marker observations.
#[derive(Debug, Default)]
pub struct PairwiseEstimator {
    smoothing: SmoothingConfig,
    edges: HashMap<(MarkerId, MarkerId), PairwiseEdge>,
}

impl PairwiseEstimator {
    pub fn new(smoothing: SmoothingConfig) -> Self {
        Self {
            smoothing,
            edges: HashMap::new(),
        }
    }

    pub fn smoothing(&self) -> SmoothingConfig {
        self.smoothing
    }

    /// Fold one frame of marker poses (each T_cam_marker) into the edge set.
    ///
    /// Every unordered pair in the frame contributes one measurement.  If an
    /// id appears more than once only its first pose is used.  Returns the
    /// number of edges touched.
    pub fn observe(&mut self, markers: &[(MarkerId, Transform3D)]) -> usize {
        let mut seen: Vec<(MarkerId, Transform3D)> = Vec::with_capacity(markers.len());
        for (id, pose) in markers {
            if seen.iter().any(|(s, _)| s == id) {
                debug!(marker = id, "Duplicate marker id in frame; keeping first pose");
                continue;
            }
            seen.push((*id, *pose));
        }

        let mut touched = 0;
        for (i, (id_i, pose_i)) in seen.iter().enumerate() {
            for (id_j, pose_j) in &seen[i + 1..] {
                self.observe_pair(*id_i, pose_i, *id_j, pose_j);
                touched += 1;
            }
        }
        touched
    }

    /// Fold a single co-observation of markers `i` and `j` into the edge set.
    pub fn observe_pair(
        &mut self,
        id_i: MarkerId,
        pose_i: &Transform3D,
        id_j: MarkerId,
        pose_j: &Transform3D,
    ) {
        if id_i == id_j {
            return;
        }
        let pair = canonical_pair(id_i, id_j);
        let (pose_a, pose_b) = if pair.0 == id_i {
            (pose_i, pose_j)
        } else {
            (pose_j, pose_i)
        };
        // T_a_b = inverse(T_cam_a) · T_cam_b
        let observed = pose_a.inverse().compose(pose_b);

        match self.edges.get_mut(&pair) {
            Some(edge) => {
                edge.update(&observed, &self.smoothing);
                debug!(
                    a = pair.0,
                    b = pair.1,
                    updates = edge.updates,
                    "Updated pairwise edge"
                );
            }
            None => {
                debug!(a = pair.0, b = pair.1, "Created pairwise edge");
                self.edges.insert(pair, PairwiseEdge::new(pair, observed));
            }
        }
    }

    /// Transform from marker `from`'s frame to marker `to`'s frame (T_from_to),
    /// inverting the stored edge when traversed against its canonical
    /// direction.  `None` when the pair was never seen together.
    pub fn edge(&self, from: MarkerId, to: MarkerId) -> Option<Transform3D> {
        if from == to {
            return Some(Transform3D::identity());
        }
        let stored = self.edges.get(&canonical_pair(from, to))?;
        if from < to {
            Some(stored.transform)
        } else {
            Some(stored.transform.inverse())
        }
    }

    /// Stored edge for the unordered pair, in canonical direction.
    pub fn get(&self, a: MarkerId, b: MarkerId) -> Option<&PairwiseEdge> {
        self.edges.get(&canonical_pair(a, b))
    }

    /// All edges, sorted by pair for stable diagnostics.
    pub fn edges(&self) -> Vec<&PairwiseEdge> {
        let mut edges: Vec<_> = self.edges.values().collect();
        edges.sort_by_key(|e| e.pair);
        edges
    }

    /// Canonical pairs of every edge.
    pub fn pairs(&self) -> impl Iterator<Item = (MarkerId, MarkerId)> + '_ {
        self.edges.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Unit-norm check used by tests and diagnostics.
    pub fn all_rotations_unit(&self, tolerance: f64) -> bool {
        self.edges
            .values()
            .all(|e| (e.transform.rotation.quaternion().norm() - 1.0).abs() <= tolerance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn pose(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Transform3D {
        Transform3D::new(
            Vector3::new(x, y, z),
            UnitQuaternion::from_euler_angles(roll, pitch, yaw),
        )
    }

    #[test]
    fn smoothing_rejects_out_of_range() {
        assert!(SmoothingConfig::new(1.0, 0.5).is_err());
        assert!(SmoothingConfig::new(0.5, -0.1).is_err());
        assert!(SmoothingConfig::new(f64::NAN, 0.5).is_err());
        assert!(SmoothingConfig::new(0.0, 0.0).is_ok());
    }

    #[test]
    fn first_observation_creates_edge() {
        let mut est = PairwiseEstimator::default();
        let p1 = pose(0.0, 0.0, 1.0, 0.0, 0.0, 0.0);
        let p2 = pose(0.1, 0.0, 1.0, 0.0, 0.0, 0.3);
        assert_eq!(est.observe(&[(1, p1), (2, p2)]), 1);

        let edge = est.get(1, 2).unwrap();
        assert_eq!(edge.updates, 1);
        assert_eq!(edge.pair, (1, 2));
        let expected = p1.inverse().compose(&p2);
        assert_relative_eq!(edge.transform.translation, expected.translation, epsilon = 1e-12);
    }

    #[test]
    fn detection_order_does_not_change_edge() {
        let p1 = pose(0.0, 0.0, 1.0, 0.1, 0.0, 0.0);
        let p2 = pose(0.1, 0.05, 1.1, 0.0, 0.2, 0.3);

        let mut forward = PairwiseEstimator::default();
        forward.observe(&[(1, p1), (2, p2)]);
        let mut backward = PairwiseEstimator::default();
        backward.observe(&[(2, p2), (1, p1)]);

        let f = forward.get(1, 2).unwrap().transform;
        let b = backward.get(2, 1).unwrap().transform;
        assert_relative_eq!(f.translation, b.translation, epsilon = 1e-12);
        assert_relative_eq!(f.rotation_distance(&b), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn reverse_edge_is_exact_inverse() {
        let mut est = PairwiseEstimator::default();
        est.observe(&[
            (3, pose(0.2, 0.1, 0.9, 0.3, -0.2, 0.5)),
            (8, pose(-0.1, 0.2, 1.2, -0.4, 0.1, 1.0)),
        ]);
        let ab = est.edge(3, 8).unwrap();
        let ba = est.edge(8, 3).unwrap();
        let id = ab.compose(&ba);
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(id.rotation.angle(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn repeated_observation_increments_count_and_smooths() {
        let mut est = PairwiseEstimator::new(SmoothingConfig::new(0.9, 0.7).unwrap());
        let p1 = Transform3D::identity();
        est.observe(&[(1, p1), (2, pose(1.0, 0.0, 0.0, 0.0, 0.0, 0.0))]);
        est.observe(&[(1, p1), (2, pose(2.0, 0.0, 0.0, 0.0, 0.0, 0.0))]);

        let edge = est.get(1, 2).unwrap();
        assert_eq!(edge.updates, 2);
        // 0.9 * 1.0 + 0.1 * 2.0
        assert_relative_eq!(edge.transform.translation.x, 1.1, epsilon = 1e-12);
    }

    #[test]
    fn single_outlier_barely_moves_converged_edge() {
        let mut est = PairwiseEstimator::default();
        let p1 = Transform3D::identity();
        let truth = pose(0.2, 0.0, 0.0, 0.0, 0.0, 0.4);
        for _ in 0..50 {
            est.observe(&[(1, p1), (2, truth)]);
        }
        est.observe(&[(1, p1), (2, pose(5.0, 0.0, 0.0, 0.0, 0.0, 0.4))]);

        let edge = est.get(1, 2).unwrap().transform;
        assert!(edge.translation_distance(&truth) < 0.05 + 1e-12);
        assert_eq!(est.get(1, 2).unwrap().updates, 51);
    }

    #[test]
    fn three_markers_produce_three_edges() {
        let mut est = PairwiseEstimator::default();
        let touched = est.observe(&[
            (1, pose(0.0, 0.0, 1.0, 0.0, 0.0, 0.0)),
            (2, pose(0.1, 0.0, 1.0, 0.0, 0.0, 0.0)),
            (3, pose(0.0, 0.1, 1.0, 0.0, 0.0, 0.0)),
        ]);
        assert_eq!(touched, 3);
        assert_eq!(est.len(), 3);
        let pairs: Vec<_> = est.edges().iter().map(|e| e.pair).collect();
        assert_eq!(pairs, vec![(1, 2), (1, 3), (2, 3)]);
    }

    #[test]
    fn duplicate_ids_in_frame_are_ignored() {
        let mut est = PairwiseEstimator::default();
        let touched = est.observe(&[
            (1, pose(0.0, 0.0, 1.0, 0.0, 0.0, 0.0)),
            (1, pose(9.0, 0.0, 1.0, 0.0, 0.0, 0.0)),
            (2, pose(0.1, 0.0, 1.0, 0.0, 0.0, 0.0)),
        ]);
        assert_eq!(touched, 1);
        assert_relative_eq!(est.edge(1, 2).unwrap().translation.x, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn single_marker_frame_is_noop() {
        let mut est = PairwiseEstimator::default();
        assert_eq!(est.observe(&[(1, Transform3D::identity())]), 0);
        assert!(est.is_empty());
        assert!(est.edge(1, 2).is_none());
        assert_eq!(est.edge(4, 4), Some(Transform3D::identity()));
    }

    #[test]
    fn rotations_stay_unit_norm() {
        let mut est = PairwiseEstimator::default();
        for k in 0..200 {
            let jitter = (k as f64 * 0.37).sin() * 0.05;
            est.observe(&[
                (1, pose(0.0, 0.0, 1.0, jitter, 0.0, 0.0)),
                (2, pose(0.1, 0.0, 1.0, 0.0, jitter, 1.2)),
            ]);
        }
        assert!(est.all_rotations_unit(1e-12));
    }
}
