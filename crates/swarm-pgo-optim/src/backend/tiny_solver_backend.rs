use crate::backend::{
    BackendSolution, BackendSolveOptions, LinearSolverKind, OptimBackend, PosYawManifold,
};
use crate::factors::factor_residual;
use crate::ir::{FactorKind, ManifoldKind, ProblemIR, RobustLoss};
use anyhow::{Result, anyhow, ensure};
use log::{debug, warn};
use nalgebra::DVector;
use std::collections::HashMap;
use std::sync::Arc;
use tiny_solver::factors::Factor;
use tiny_solver::loss_functions::{ArctanLoss, CauchyLoss, HuberLoss, Loss};
use tiny_solver::manifold::se3::SE3Manifold;
use tiny_solver::optimizer::{Optimizer, OptimizerOptions};
use tiny_solver::problem::Problem;
use tiny_solver::{LevenbergMarquardtOptimizer, linear::sparse::LinearSolverType};

/// tiny-solver backend adapter.
///
/// Blocks whose every coordinate is fixed never become solver variables; their
/// values are baked into the factors that read them. Partially fixed blocks
/// use tiny-solver's per-index fixing.
#[derive(Debug, Clone, Copy)]
pub struct TinySolverBackend;

/// IR lowered to a tiny-solver problem.
struct Compiled {
    problem: Problem,
    /// Initial values of the solver variables.
    variables: HashMap<String, DVector<f64>>,
    /// Constant blocks and free blocks no residual reads.
    passive: HashMap<String, DVector<f64>>,
    residual_blocks: usize,
}

impl TinySolverBackend {
    fn compile(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
    ) -> Result<Compiled> {
        ir.validate()?;

        let mut values = Vec::with_capacity(ir.params.len());
        for param in &ir.params {
            let init = initial.get(&param.name).ok_or_else(|| {
                anyhow!(
                    "initial values missing parameter {} (id {:?})",
                    param.name,
                    param.id
                )
            })?;
            ensure!(
                init.len() == param.dim,
                "initial dimension mismatch for {}: expected {}, got {}",
                param.name,
                param.dim,
                init.len()
            );
            values.push(init.clone());
        }
        let constant: Vec<bool> = ir
            .params
            .iter()
            .map(|p| p.fixed.is_all_fixed(p.dim))
            .collect();

        let mut problem = Problem::new();
        let mut referenced = vec![false; ir.params.len()];
        let mut residual_blocks = 0;
        for residual in &ir.residuals {
            let mut names = Vec::with_capacity(residual.params.len());
            let mut slots = Vec::with_capacity(residual.params.len());
            for id in &residual.params {
                if constant[id.0] {
                    slots.push(Slot::Constant(values[id.0].clone()));
                } else {
                    slots.push(Slot::Variable(names.len()));
                    names.push(ir.params[id.0].name.as_str());
                    referenced[id.0] = true;
                }
            }
            if names.is_empty() {
                continue;
            }
            let loss = compile_loss(residual.loss)?;
            let factor = TinyPoseGraphFactor {
                kind: residual.factor.clone(),
                slots,
            };
            problem.add_residual_block(residual.residual_dim, &names, Box::new(factor), loss);
            residual_blocks += 1;
        }

        let mut variables = HashMap::new();
        let mut passive = HashMap::new();
        for (param, value) in ir.params.iter().zip(values) {
            if !referenced[param.id.0] {
                passive.insert(param.name.clone(), value);
                continue;
            }
            match param.manifold {
                ManifoldKind::Euclidean => {}
                ManifoldKind::SE3 => {
                    problem.set_variable_manifold(&param.name, Arc::new(SE3Manifold));
                }
                ManifoldKind::PosYaw => {
                    problem.set_variable_manifold(&param.name, Arc::new(PosYawManifold));
                }
            }
            for idx in param.fixed.iter() {
                problem.fix_variable(&param.name, idx);
            }
            variables.insert(param.name.clone(), value);
        }

        Ok(Compiled {
            problem,
            variables,
            passive,
            residual_blocks,
        })
    }

    fn cost(problem: &Problem, params: &HashMap<String, DVector<f64>>) -> f64 {
        let blocks = problem.initialize_parameter_blocks(params);
        let residuals = problem.compute_residuals(&blocks, true);
        0.5 * residuals.as_ref().squared_norm_l2()
    }
}

impl OptimBackend for TinySolverBackend {
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
        opts: &BackendSolveOptions,
    ) -> Result<BackendSolution> {
        let Compiled {
            problem,
            variables,
            passive,
            residual_blocks,
        } = self.compile(ir, initial)?;
        let mut params = passive;
        if residual_blocks == 0 {
            debug!("tiny-solver: no residual reads a free block");
            params.extend(variables);
            return Ok(BackendSolution {
                params,
                initial_cost: 0.0,
                final_cost: 0.0,
                converged: true,
            });
        }

        let initial_cost = Self::cost(&problem, &variables);
        debug!(
            "tiny-solver: {} variables, {} residuals, initial cost {initial_cost:.6e}",
            variables.len(),
            residual_blocks
        );

        let optimizer = LevenbergMarquardtOptimizer::default();
        let options = to_optimizer_options(opts);
        let solution = optimizer
            .optimize(&problem, &variables, Some(options))
            .map(|solution| {
                let cost = Self::cost(&problem, &solution);
                (solution, cost)
            });
        match solution {
            Some((solution, final_cost)) if final_cost.is_finite() => {
                params.extend(solution);
                Ok(BackendSolution {
                    params,
                    initial_cost,
                    final_cost,
                    converged: true,
                })
            }
            failed => {
                match failed {
                    Some((_, cost)) => {
                        warn!("tiny-solver diverged (cost {cost}); keeping initial values")
                    }
                    None => warn!("tiny-solver failed to converge; keeping initial values"),
                }
                params.extend(variables);
                Ok(BackendSolution {
                    params,
                    initial_cost,
                    final_cost: initial_cost,
                    converged: false,
                })
            }
        }
    }
}

fn to_optimizer_options(opts: &BackendSolveOptions) -> OptimizerOptions {
    let mut options = OptimizerOptions {
        max_iteration: opts.max_iters,
        verbosity_level: opts.verbosity,
        ..OptimizerOptions::default()
    };
    if let Some(solver) = opts.linear_solver {
        options.linear_solver_type = match solver {
            LinearSolverKind::SparseCholesky => LinearSolverType::SparseCholesky,
            LinearSolverKind::SparseQR => LinearSolverType::SparseQR,
        };
    }
    if let Some(v) = opts.min_abs_decrease {
        options.min_abs_error_decrease_threshold = v;
    }
    if let Some(v) = opts.min_rel_decrease {
        options.min_rel_error_decrease_threshold = v;
    }
    if let Some(v) = opts.min_error {
        options.min_error_threshold = v;
    }
    options
}

fn compile_loss(loss: RobustLoss) -> Result<Option<Box<dyn Loss + Send>>> {
    match loss {
        RobustLoss::None => Ok(None),
        RobustLoss::Huber { scale } => {
            ensure!(scale > 0.0, "Huber scale must be positive");
            Ok(Some(Box::new(HuberLoss::new(scale))))
        }
        RobustLoss::Cauchy { scale } => {
            ensure!(scale > 0.0, "Cauchy scale must be positive");
            Ok(Some(Box::new(CauchyLoss::new(scale))))
        }
        RobustLoss::Arctan { scale } => {
            ensure!(scale > 0.0, "Arctan scale must be positive");
            Ok(Some(Box::new(ArctanLoss::new(scale))))
        }
    }
}

/// Where a factor argument comes from.
#[derive(Debug, Clone)]
enum Slot {
    /// Index into the variables tiny-solver passes in.
    Variable(usize),
    Constant(DVector<f64>),
}

/// Adapter evaluating any pose-graph factor kind through tiny-solver's autodiff.
#[derive(Debug, Clone)]
struct TinyPoseGraphFactor {
    kind: FactorKind,
    slots: Vec<Slot>,
}

impl<T: nalgebra::RealField> Factor<T> for TinyPoseGraphFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        debug_assert_eq!(
            self.slots.len(),
            self.kind.num_params(),
            "unexpected number of parameter blocks"
        );
        let args: Vec<DVector<T>> = self
            .slots
            .iter()
            .map(|slot| match slot {
                Slot::Variable(i) => params[*i].clone(),
                Slot::Constant(v) => v.map(|x| T::from_f64(x).unwrap()),
            })
            .collect();
        factor_residual(&self.kind, &args)
    }
}
