//! Core types for swarm pose-graph optimization.
//!
//! - \[`math`\]: linear algebra aliases and yaw/tilt helpers.
//! - [`Frame`] and [`LoopEdge`]: the inputs of a pose graph.
//! - [`PoseStore`]: frame arena with per-robot time-ordered trajectories.
//! - \[`synthetic`\]: deterministic trajectories for tests and benchmarks.

mod frame;
mod loop_edge;
/// Linear algebra type aliases and helpers.
mod math;
mod pose_store;
/// Deterministic synthetic data generation helpers.
pub mod synthetic;

pub use frame::*;
pub use loop_edge::*;
pub use math::*;
pub use pose_store::*;
