//! `markerfuse-perception` – marker-pair transform graph and pose fusion.
//!
//! Turns per-frame fiducial marker poses into one stable pose of the rigid
//! object the markers are mounted on.
//!
//! # Modules
//!
//! - [`transform`] – [`Transform3D`][transform::Transform3D]: rigid transform
//!   with tf-style composition and inversion.
//! - [`averaging`] – [`average_quaternions`][averaging::average_quaternions]:
//!   sign-invariant weighted rotation averaging.
//! - [`pairwise`] – [`PairwiseEstimator`][pairwise::PairwiseEstimator]:
//!   running marker-to-marker transform estimates learned from
//!   co-observations.
//! - [`graph`] – [`MarkerGraph`][graph::MarkerGraph]: undirected
//!   co-observation graph with breadth-first shortest paths.
//! - [`resolver`] – [`resolve_reference_table`][resolver::resolve_reference_table]:
//!   chains edges along shortest paths into a marker→reference table.
//! - [`table`] – [`ReferenceTransformTable`][table::ReferenceTransformTable]:
//!   the resolved table and its JSON persistence.
//! - [`fusion`] – [`PoseFuser`][fusion::PoseFuser]: per-frame candidate
//!   fusion and temporal blending.

pub mod averaging;
pub mod fusion;
pub mod graph;
pub mod pairwise;
pub mod resolver;
pub mod table;
pub mod transform;

pub use averaging::average_quaternions;
pub use fusion::PoseFuser;
pub use graph::MarkerGraph;
pub use pairwise::{PairwiseEdge, PairwiseEstimator, SmoothingConfig};
pub use resolver::resolve_reference_table;
pub use table::{ReferenceTransformTable, TableError};
pub use transform::Transform3D;
