//! Engine configuration.

use serde::{Deserialize, Serialize};
use swarm_pgo_core::DroneId;
use swarm_pgo_optim::ir::RobustLoss;
use swarm_pgo_optim::solver::ConsensusOptions;
use swarm_pgo_optim::{BackendSolveOptions, PoseDof};

use crate::PgoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMode {
    /// All robots' frames solved in this process.
    #[default]
    Centralized,
    /// Local subgraph solved here, agreed with peers by consensus.
    Distributed,
}

/// Configuration of a [`PoseGraphEngine`](crate::PoseGraphEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgoConfig {
    pub mode: OptimizationMode,
    pub pose_dof: PoseDof,
    /// Robot this process runs on.
    pub self_id: DroneId,
    /// Coordinator whose head frame fixes the gauge in distributed mode.
    pub main_id: DroneId,
    /// Position variance growth of odometry per meter travelled.
    pub pos_cov_per_meter: f64,
    /// Rotation variance growth of odometry per meter travelled.
    pub yaw_cov_per_meter: f64,
    /// Loops with a longer relative translation (m) are dropped on insertion.
    pub loop_distance_threshold: f64,
    pub loop_loss: RobustLoss,
    pub backend: BackendSolveOptions,
    pub consensus: ConsensusOptions,
}

impl Default for PgoConfig {
    fn default() -> Self {
        Self {
            mode: OptimizationMode::Centralized,
            pose_dof: PoseDof::FourDof,
            self_id: 0,
            main_id: 0,
            pos_cov_per_meter: 4e-3,
            yaw_cov_per_meter: 4e-5,
            loop_distance_threshold: 2.0,
            loop_loss: RobustLoss::Huber { scale: 1.0 },
            backend: BackendSolveOptions::default(),
            consensus: ConsensusOptions::default(),
        }
    }
}

impl PgoConfig {
    pub fn validate(&self) -> Result<(), PgoError> {
        let invalid = |msg: String| Err(PgoError::InvalidConfig(msg));
        if !(self.pos_cov_per_meter > 0.0 && self.yaw_cov_per_meter > 0.0) {
            return invalid(format!(
                "covariance rates must be positive, got pos {} yaw {}",
                self.pos_cov_per_meter, self.yaw_cov_per_meter
            ));
        }
        if !(self.loop_distance_threshold > 0.0) {
            return invalid(format!(
                "loop_distance_threshold must be positive, got {}",
                self.loop_distance_threshold
            ));
        }
        match self.loop_loss {
            RobustLoss::Huber { scale }
            | RobustLoss::Cauchy { scale }
            | RobustLoss::Arctan { scale }
                if !(scale > 0.0) =>
            {
                return invalid(format!("loop loss scale must be positive, got {scale}"));
            }
            _ => {}
        }
        if self.backend.max_iters == 0 {
            return invalid("backend.max_iters must be positive".to_string());
        }
        if self.mode == OptimizationMode::Distributed {
            self.consensus
                .validate()
                .map_err(|e| PgoError::InvalidConfig(format!("{e:#}")))?;
        }
        Ok(())
    }
}
