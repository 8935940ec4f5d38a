//! Reference-frame transform resolver.
//!
//! Turns the pairwise edge set learned during calibration into a
//! [`ReferenceTransformTable`]: for every marker, a shortest path to the
//! reference marker is found in the [`MarkerGraph`] and the edge transforms
//! along it are chained.
//!
//! For a path `s → n₁ → … → ref` the result is
//!
//! ```text
//! T_s_ref = T_s_n1 ∘ T_n1_n2 ∘ … ∘ T_nk_ref
//! ```
//!
//! where each step is applied after the previous one
//! (`acc = acc.compose(edge)`).  Left-multiplying instead
//! (`acc = edge.compose(acc)`) agrees for one hop but places the reference
//! wrongly on any path of two or more hops.  Edges traversed against their
//! canonical direction are inverted by [`PairwiseEstimator::edge`].
//!
//! Resolution is best-effort: markers with no path to the reference are left
//! out of the table and logged.  Among several shortest paths the first one
//! found by the breadth-first search is used; which one that is depends only
//! on marker ids, not on geometry, and is not considered significant.

use markerfuse_types::MarkerId;
use tracing::{debug, info, trace, warn};

use crate::graph::MarkerGraph;
use crate::pairwise::PairwiseEstimator;
use crate::table::ReferenceTransformTable;
use crate::transform::Transform3D;

/// Chain the edge transforms along `path` (first id → last id).
///
/// Returns `None` if two consecutive ids were never observed together.
pub fn compose_path(estimator: &PairwiseEstimator, path: &[MarkerId]) -> Option<Transform3D> {
    let mut acc = Transform3D::identity();
    for step in path.windows(2) {
        let edge = estimator.edge(step[0], step[1])?;
        acc = acc.compose(&edge);
    }
    Some(acc)
}

/// Build the marker→reference table from everything the estimator learned.
///
/// The reference marker is always resolvable (identity), even if it never
/// appeared in an edge.
pub fn resolve_reference_table(
    estimator: &PairwiseEstimator,
    reference_id: MarkerId,
) -> ReferenceTransformTable {
    let graph = MarkerGraph::from_edges(estimator.pairs());
    resolve_with_graph(estimator, &graph, reference_id)
}

/// Same as [`resolve_reference_table`] with a prebuilt graph.
pub fn resolve_with_graph(
    estimator: &PairwiseEstimator,
    graph: &MarkerGraph,
    reference_id: MarkerId,
) -> ReferenceTransformTable {
    let mut table = ReferenceTransformTable::new(reference_id);
    let mut unreachable = Vec::new();

    for start in graph.nodes() {
        if start == reference_id {
            trace!(marker = start, "Skipping reference marker");
            continue;
        }
        let Some(path) = graph.shortest_path(start, reference_id) else {
            warn!(
                marker = start,
                reference = reference_id,
                "No co-observation path to reference marker; marker will not be fused"
            );
            unreachable.push(start);
            continue;
        };
        match compose_path(estimator, &path) {
            Some(transform) => {
                debug!(marker = start, hops = path.len() - 1, ?path, "Resolved marker");
                table.insert(start, transform);
            }
            None => {
                warn!(marker = start, ?path, "Path references a missing edge; skipping");
                unreachable.push(start);
            }
        }
    }

    info!(
        reference = reference_id,
        resolved = table.len(),
        unreachable = unreachable.len(),
        "Resolved reference transform table"
    );
    table
}
