//! Initial guesses for pose-graph solves.

mod chordal;

pub use chordal::{RotationEdge, chordal_rotations};
