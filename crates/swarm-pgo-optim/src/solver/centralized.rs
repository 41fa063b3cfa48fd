use anyhow::Result;
use log::{debug, info};
use swarm_pgo_core::PoseStore;

use crate::backend::{BackendSolveOptions, OptimBackend, TinySolverBackend};
use crate::ir::ProblemIR;
use crate::params::PoseDof;
use crate::solver::graph::GraphBuilder;
use crate::solver::{PoseGraphSolver, ResidualInfo, SolveReport, SolveState, SolverOutcome};

/// Single-process Levenberg-Marquardt solve of the whole graph.
#[derive(Debug)]
pub struct CentralizedSolver<'a> {
    graph: GraphBuilder<'a>,
    opts: BackendSolveOptions,
}

impl<'a> CentralizedSolver<'a> {
    pub fn new(store: &'a PoseStore, dof: PoseDof, opts: BackendSolveOptions) -> Self {
        Self {
            graph: GraphBuilder::new(store, dof),
            opts,
        }
    }
}

impl PoseGraphSolver for CentralizedSolver<'_> {
    fn add_residual(&mut self, info: ResidualInfo) -> Result<()> {
        self.graph.add_residual(info)
    }

    fn problem_mut(&mut self) -> Option<&mut ProblemIR> {
        Some(&mut self.graph.ir)
    }

    fn solve(&mut self) -> Result<SolverOutcome> {
        if self.graph.ir.residuals.is_empty() || !self.graph.has_free_blocks() {
            debug!("centralized solve: nothing to optimize");
            return Ok(SolverOutcome {
                poses: Default::default(),
                report: SolveReport::trivial(),
            });
        }

        let solution = TinySolverBackend.solve(&self.graph.ir, &self.graph.initial, &self.opts)?;
        let poses = self.graph.collect_poses(&solution.params, |_| true)?;
        let final_state = if solution.converged {
            SolveState::Converged
        } else {
            SolveState::Failed
        };
        info!(
            "centralized solve: {} frames, {} residuals, cost {:.6e} -> {:.6e}",
            poses.len(),
            self.graph.ir.residuals.len(),
            solution.initial_cost,
            solution.final_cost
        );

        Ok(SolverOutcome {
            poses,
            report: SolveReport {
                initial_cost: solution.initial_cost,
                final_cost: solution.final_cost,
                converged: solution.converged,
                rounds: 1,
                sync_timeouts: 0,
                final_state,
            },
        })
    }
}
