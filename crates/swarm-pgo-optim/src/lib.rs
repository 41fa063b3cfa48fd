//! Non-linear pose-graph optimization built on tiny-solver.
//!
//! Problems are described by a backend-independent IR ([`ir`]) of pose
//! parameter blocks and relative-pose residuals ([`factors`]). The
//! [`solver`] module drives either a single centralized solve or a
//! distributed consensus solve over a [`solver::ConsensusTransport`].

pub mod backend;
pub mod factors;
pub mod init;
pub mod ir;
pub mod params;
pub mod solver;

pub use crate::backend::{BackendSolveOptions, LinearSolverKind};
pub use crate::params::PoseDof;
pub use crate::solver::{
    PoseGraphSolver, ResidualInfo, SolveMode, SolveReport, SolveState, SolverOutcome,
    build_solver,
};
