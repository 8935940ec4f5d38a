//! Weighted quaternion averaging.
//!
//! Computes the rotation that minimises the weighted sum of squared chordal
//! distances to the inputs: the eigenvector belonging to the largest
//! eigenvalue of `M = Σ wᵢ qᵢ qᵢᵀ`.  Because every term is an outer product
//! of a quaternion with itself, flipping the sign of any input (q and −q are
//! the same rotation) leaves `M` unchanged.
//!
//! # Fallbacks
//!
//! The function never panics:
//!
//! | input | result |
//! |---|---|
//! | empty slice | identity |
//! | single input | that input, unchanged |
//! | `weights == None`, length mismatch, or weights summing to ≤ 0 | uniform weights |
//! | negative or non-finite weight | treated as 0 |
//! | degenerate eigen-decomposition | the heaviest input |

use nalgebra::{Matrix4, Quaternion, SymmetricEigen, UnitQuaternion, Vector4};

/// Average `quats` with optional per-input `weights`.
///
/// The sign of the result is chosen so that it lies in the same hemisphere
/// as the heaviest input, which keeps successive blends continuous.
pub fn average_quaternions(
    quats: &[UnitQuaternion<f64>],
    weights: Option<&[f64]>,
) -> UnitQuaternion<f64> {
    match quats {
        [] => return UnitQuaternion::identity(),
        [only] => return *only,
        _ => {}
    }
    let weights = normalised_weights(quats.len(), weights);

    let mut m = Matrix4::<f64>::zeros();
    for (q, w) in quats.iter().zip(&weights) {
        let v = as_vector(q);
        m += *w * v * v.transpose();
    }

    let heaviest = weights
        .iter()
        .enumerate()
        .fold(0, |best, (i, w)| if *w > weights[best] { i } else { best });
    let anchor = as_vector(&quats[heaviest]);

    let eigen = SymmetricEigen::new(m);
    let dominant = eigen.eigenvalues.imax();
    let mut v: Vector4<f64> = eigen.eigenvectors.column(dominant).into_owned();

    let norm = v.norm();
    if !norm.is_finite() || norm <= f64::EPSILON {
        return quats[heaviest];
    }
    v /= norm;
    if v.dot(&anchor) < 0.0 {
        v = -v;
    }
    UnitQuaternion::new_normalize(Quaternion::new(v[0], v[1], v[2], v[3]))
}

/// `(w, x, y, z)` components as a column vector.
fn as_vector(q: &UnitQuaternion<f64>) -> Vector4<f64> {
    let q = q.quaternion();
    Vector4::new(q.w, q.i, q.j, q.k)
}

fn normalised_weights(n: usize, weights: Option<&[f64]>) -> Vec<f64> {
    let uniform = || vec![1.0 / n as f64; n];
    let Some(weights) = weights else {
        return uniform();
    };
    if weights.len() != n {
        return uniform();
    }
    let cleaned: Vec<f64> = weights
        .iter()
        .map(|w| if w.is_finite() && *w > 0.0 { *w } else { 0.0 })
        .collect();
    let total: f64 = cleaned.iter().sum();
    if total <= 0.0 {
        return uniform();
    }
    cleaned.into_iter().map(|w| w / total).collect()
}
