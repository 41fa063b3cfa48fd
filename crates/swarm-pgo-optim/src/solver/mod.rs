//! Solver abstraction over centralized and distributed pose-graph backends.
//!
//! A solver is created for one `solve()` call. Residuals are added as
//! [`ResidualInfo`]s naming the frames they touch; the solver creates one
//! parameter block per frame on first use, initialised from the pose store.
//! Before solving, [`PoseGraphSolver::problem_mut`] exposes the IR so the
//! caller can assign manifolds and hold gauge blocks constant.

mod centralized;
mod consensus;
mod graph;
mod transport;

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use swarm_pgo_core::{DroneId, FrameId, Iso3, PoseStore};

use crate::backend::BackendSolveOptions;
use crate::ir::{FactorKind, ProblemIR, RobustLoss};
use crate::params::PoseDof;

pub use centralized::CentralizedSolver;
pub use consensus::{ConsensusMerge, ConsensusOptions, ConsensusSolver};
pub use transport::{ChannelTransport, ConsensusTransport, ConsensusUpdate, SharedPose};

/// One residual to add to the problem.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualInfo {
    /// Frames in the factor's parameter order.
    pub frames: Vec<FrameId>,
    pub factor: FactorKind,
    pub loss: RobustLoss,
}

/// Where a solve ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveState {
    BuildLocal,
    LocalSolve,
    Sync,
    Converged,
    TimedOut,
    /// The optimizer gave up; poses were left at their initial values.
    Failed,
}

/// Quality signals of a solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveReport {
    pub initial_cost: f64,
    pub final_cost: f64,
    pub converged: bool,
    /// Optimizer invocations (one for centralized, consensus rounds otherwise).
    pub rounds: usize,
    pub sync_timeouts: usize,
    pub final_state: SolveState,
}

impl SolveReport {
    pub(crate) fn trivial() -> Self {
        Self {
            initial_cost: 0.0,
            final_cost: 0.0,
            converged: true,
            rounds: 0,
            sync_timeouts: 0,
            final_state: SolveState::Converged,
        }
    }
}

/// Optimized poses of the frames this process owns, plus the report.
#[derive(Debug, Clone)]
pub struct SolverOutcome {
    pub poses: BTreeMap<FrameId, Iso3>,
    pub report: SolveReport,
}

/// Backend-agnostic interface of a pose-graph solver.
pub trait PoseGraphSolver {
    /// Add a residual, creating parameter blocks for new frames.
    ///
    /// Fails if a frame is unknown to the store or the factor does not match
    /// the solver's pose parameterization.
    fn add_residual(&mut self, info: ResidualInfo) -> Result<()>;

    /// The IR for manifold assignment and gauge fixing, if the backend exposes one.
    fn problem_mut(&mut self) -> Option<&mut ProblemIR>;

    fn solve(&mut self) -> Result<SolverOutcome>;
}

/// Backend selection for one solve.
pub enum SolveMode<'t> {
    Centralized,
    Distributed {
        self_id: DroneId,
        /// Shared by every participant of the same solve.
        epoch: u64,
        transport: &'t dyn ConsensusTransport,
        options: ConsensusOptions,
    },
}

impl std::fmt::Debug for SolveMode<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolveMode::Centralized => write!(f, "Centralized"),
            SolveMode::Distributed { self_id, epoch, .. } => {
                write!(f, "Distributed {{ self_id: {self_id}, epoch: {epoch} }}")
            }
        }
    }
}

/// Create the solver for `mode` over a snapshot of `store`.
pub fn build_solver<'a>(
    mode: SolveMode<'a>,
    store: &'a PoseStore,
    dof: PoseDof,
    backend_opts: BackendSolveOptions,
) -> Box<dyn PoseGraphSolver + 'a> {
    match mode {
        SolveMode::Centralized => Box::new(CentralizedSolver::new(store, dof, backend_opts)),
        SolveMode::Distributed {
            self_id,
            epoch,
            transport,
            options,
        } => Box::new(
            ConsensusSolver::new(store, dof, self_id, transport, options, backend_opts)
                .with_epoch(epoch),
        ),
    }
}
