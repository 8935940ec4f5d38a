//! Rigid-body transforms between marker frames.
//!
//! [`Transform3D`] follows the tf convention: `T_a_b` is the pose of frame b
//! expressed in frame a, and maps points given in b into a.  Chains compose
//! left to right:
//!
//! ```rust
//! use markerfuse_perception::transform::Transform3D;
//! use nalgebra::{UnitQuaternion, Vector3};
//!
//! // marker 2 sits 10 cm along marker 1's +X axis.
//! let t_1_2 = Transform3D::new(Vector3::new(0.1, 0.0, 0.0), UnitQuaternion::identity());
//! // marker 3 sits 5 cm along marker 2's +X axis.
//! let t_2_3 = Transform3D::new(Vector3::new(0.05, 0.0, 0.0), UnitQuaternion::identity());
//!
//! let t_1_3 = t_1_2.compose(&t_2_3);
//! assert!((t_1_3.translation.x - 0.15).abs() < 1e-12);
//! ```

use markerfuse_types::PoseRecord;
use nalgebra::{Quaternion, UnitQuaternion, Vector3};

/// Unit-norm tolerance under which stored quaternion components are trusted
/// as-is instead of being renormalised.
const UNIT_NORM_TOLERANCE: f64 = 1e-9;

/// A rigid-body 3-D transform: rotation followed by translation.
///
/// To convert a point expressed in the child frame into the parent frame,
/// rotate it by `rotation` then add `translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform3D {
    pub translation: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
}

impl Transform3D {
    pub fn new(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    /// The identity transform (no translation, no rotation).
    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity())
    }

    /// Compose two transforms: `self` applied first, then `other`.
    ///
    /// If `self` = T_A_B and `other` = T_B_C, the result is T_A_C.  In matrix
    /// form this is the product `self · other`.
    pub fn compose(&self, other: &Self) -> Self {
        Self::new(
            self.translation + self.rotation * other.translation,
            self.rotation * other.rotation,
        )
    }

    /// The inverse transform: T_A_B becomes T_B_A.
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self::new(-(rotation * self.translation), rotation)
    }

    /// Map a point from the child frame into the parent frame.
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// Angle in radians of the relative rotation between `self` and `other`.
    pub fn rotation_distance(&self, other: &Self) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }

    /// Euclidean distance between the two translations.
    pub fn translation_distance(&self, other: &Self) -> f64 {
        (self.translation - other.translation).norm()
    }

    /// Build a transform from its wire form.
    ///
    /// Returns `None` when a component is non-finite or the quaternion has
    /// zero norm.  Quaternions already within 1e-9 of unit norm are used
    /// verbatim so that persisted tables reload bit-identically.
    pub fn from_record(record: &PoseRecord) -> Option<Self> {
        if !record.is_finite() {
            return None;
        }
        let [x, y, z, w] = record.rotation;
        let q = Quaternion::new(w, x, y, z);
        let norm = q.norm();
        if norm <= f64::EPSILON {
            return None;
        }
        let rotation = if (norm - 1.0).abs() <= UNIT_NORM_TOLERANCE {
            UnitQuaternion::new_unchecked(q)
        } else {
            UnitQuaternion::new_normalize(q)
        };
        let [tx, ty, tz] = record.translation;
        Some(Self::new(Vector3::new(tx, ty, tz), rotation))
    }

    /// Wire form, quaternion stored as `[x, y, z, w]`.
    pub fn to_record(&self) -> PoseRecord {
        let q = self.rotation.quaternion();
        PoseRecord {
            translation: [self.translation.x, self.translation.y, self.translation.z],
            rotation: [q.i, q.j, q.k, q.w],
        }
    }
}

impl Default for Transform3D {
    fn default() -> Self {
        Self::identity()
    }
}
