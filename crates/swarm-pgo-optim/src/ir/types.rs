use anyhow::{Result, anyhow, ensure};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Identifier for a parameter block in the IR.
///
/// This is stable within a `ProblemIR` instance and is used by residual blocks
/// to reference their parameter dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(pub usize);

/// Supported manifold types for parameter blocks.
///
/// Each variant implies an expected ambient parameter dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifoldKind {
    /// Standard Euclidean vector space.
    Euclidean,
    /// SE(3) pose stored as `[qx, qy, qz, qw, tx, ty, tz]`.
    SE3,
    /// Position and heading stored as `[x, y, z, yaw]`, yaw wrapped to `(-pi, pi]`.
    PosYaw,
}

impl ManifoldKind {
    /// Returns `true` if the given ambient dimension matches the manifold storage.
    pub fn compatible_dim(self, dim: usize) -> bool {
        match self {
            ManifoldKind::Euclidean => true,
            ManifoldKind::SE3 => dim == 7,
            ManifoldKind::PosYaw => dim == 4,
        }
    }
}

/// Fixed parameter mask for a block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FixedMask {
    fixed_indices: HashSet<usize>,
}

impl FixedMask {
    pub fn all_free() -> Self {
        Self::default()
    }

    pub fn all_fixed(dim: usize) -> Self {
        Self {
            fixed_indices: (0..dim).collect(),
        }
    }

    pub fn is_fixed(&self, idx: usize) -> bool {
        self.fixed_indices.contains(&idx)
    }

    /// Returns `true` if all indices `[0, dim)` are fixed.
    pub fn is_all_fixed(&self, dim: usize) -> bool {
        dim > 0 && (0..dim).all(|i| self.fixed_indices.contains(&i))
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.fixed_indices.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.fixed_indices.is_empty()
    }
}

/// Robust loss applied to a residual block.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RobustLoss {
    #[default]
    None,
    Huber {
        scale: f64,
    },
    Cauchy {
        scale: f64,
    },
    Arctan {
        scale: f64,
    },
}

impl RobustLoss {
    /// Loss to pair with a residual scaled by `c`, such that the robustified
    /// cost is `c^2` times the original.
    ///
    /// Huber and Cauchy scales live in residual units, the Arctan scale in
    /// squared-norm units.
    pub fn scaled(self, c: f64) -> RobustLoss {
        match self {
            RobustLoss::None => RobustLoss::None,
            RobustLoss::Huber { scale } => RobustLoss::Huber { scale: scale * c },
            RobustLoss::Cauchy { scale } => RobustLoss::Cauchy { scale: scale * c },
            RobustLoss::Arctan { scale } => RobustLoss::Arctan {
                scale: scale * c * c,
            },
        }
    }
}

/// Backend-agnostic factor kinds.
///
/// Each factor kind implies its parameter layout and residual dimension.
/// Square-root information matrices are stored column-major.
#[derive(Debug, Clone, PartialEq)]
pub enum FactorKind {
    /// Relative SE(3) constraint between two 7D pose blocks `[a, b]`.
    ///
    /// Residual: `sqrt_info * [t_err; rot_err]` with the measured pose of b in a.
    RelPose6D {
        delta_se3: [f64; 7],
        sqrt_info: [f64; 36],
    },
    /// Relative position+yaw constraint between two 4D blocks `[a, b]`.
    ///
    /// `delta_pos` is expressed in the yaw-only frame of a.
    RelPose4D {
        delta_pos: [f64; 3],
        delta_yaw: f64,
        sqrt_info_pos: [f64; 9],
        sqrt_info_yaw: f64,
    },
    /// Pull of a 7D pose block toward a consensus target.
    ConsensusPrior6D {
        target_se3: [f64; 7],
        w_pos: f64,
        w_rot: f64,
    },
    /// Pull of a 4D pose block toward a consensus target `[x, y, z, yaw]`.
    ConsensusPrior4D {
        target: [f64; 4],
        w_pos: f64,
        w_rot: f64,
    },
}

impl FactorKind {
    /// Residual dimension implied by the factor.
    pub fn residual_dim(&self) -> usize {
        match self {
            FactorKind::RelPose6D { .. } => 6,
            FactorKind::RelPose4D { .. } => 4,
            FactorKind::ConsensusPrior6D { .. } => 6,
            FactorKind::ConsensusPrior4D { .. } => 4,
        }
    }

    /// Number of parameter blocks the factor reads.
    pub fn num_params(&self) -> usize {
        match self {
            FactorKind::RelPose6D { .. } | FactorKind::RelPose4D { .. } => 2,
            FactorKind::ConsensusPrior6D { .. } | FactorKind::ConsensusPrior4D { .. } => 1,
        }
    }

    /// Ambient dimension every parameter block of this factor must have.
    pub fn param_dim(&self) -> usize {
        match self {
            FactorKind::RelPose6D { .. } | FactorKind::ConsensusPrior6D { .. } => 7,
            FactorKind::RelPose4D { .. } | FactorKind::ConsensusPrior4D { .. } => 4,
        }
    }

    /// Manifold a free parameter block of this factor must use.
    pub fn param_manifold(&self) -> ManifoldKind {
        match self {
            FactorKind::RelPose6D { .. } | FactorKind::ConsensusPrior6D { .. } => ManifoldKind::SE3,
            FactorKind::RelPose4D { .. } | FactorKind::ConsensusPrior4D { .. } => {
                ManifoldKind::PosYaw
            }
        }
    }

    /// Same factor with its whitened residual multiplied by `c`.
    pub fn scaled(&self, c: f64) -> FactorKind {
        let mut out = self.clone();
        match &mut out {
            FactorKind::RelPose6D { sqrt_info, .. } => {
                sqrt_info.iter_mut().for_each(|v| *v *= c);
            }
            FactorKind::RelPose4D {
                sqrt_info_pos,
                sqrt_info_yaw,
                ..
            } => {
                sqrt_info_pos.iter_mut().for_each(|v| *v *= c);
                *sqrt_info_yaw *= c;
            }
            FactorKind::ConsensusPrior6D { w_pos, w_rot, .. }
            | FactorKind::ConsensusPrior4D { w_pos, w_rot, .. } => {
                *w_pos *= c;
                *w_rot *= c;
            }
        }
        out
    }
}

/// Parameter block definition in the IR.
#[derive(Debug, Clone)]
pub struct ParamBlock {
    pub id: ParamId,
    pub name: String,
    pub dim: usize,
    pub manifold: ManifoldKind,
    pub fixed: FixedMask,
}

/// Residual block definition in the IR.
///
/// The order of `params` must match the factor's expected parameter order.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub params: Vec<ParamId>,
    pub loss: RobustLoss,
    pub factor: FactorKind,
    pub residual_dim: usize,
}

/// Backend-agnostic optimization problem representation.
#[derive(Debug, Default, Clone)]
pub struct ProblemIR {
    pub params: Vec<ParamBlock>,
    pub residuals: Vec<ResidualBlock>,
    by_name: HashMap<String, ParamId>,
}

impl ProblemIR {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter block and returns its `ParamId`.
    ///
    /// Adding a name twice returns the existing id.
    pub fn add_param_block(
        &mut self,
        name: impl Into<String>,
        dim: usize,
        manifold: ManifoldKind,
        fixed: FixedMask,
    ) -> ParamId {
        let name = name.into();
        if let Some(id) = self.by_name.get(&name) {
            return *id;
        }
        let id = ParamId(self.params.len());
        self.by_name.insert(name.clone(), id);
        self.params.push(ParamBlock {
            id,
            name,
            dim,
            manifold,
            fixed,
        });
        id
    }

    pub fn add_residual_block(&mut self, residual: ResidualBlock) {
        self.residuals.push(residual);
    }

    /// Convenience for a residual whose dimension is implied by the factor.
    pub fn add_factor(&mut self, params: Vec<ParamId>, factor: FactorKind, loss: RobustLoss) {
        let residual_dim = factor.residual_dim();
        self.add_residual_block(ResidualBlock {
            params,
            loss,
            factor,
            residual_dim,
        });
    }

    pub fn param_by_name(&self, name: &str) -> Option<ParamId> {
        self.by_name.get(name).copied()
    }

    pub fn param(&self, id: ParamId) -> &ParamBlock {
        &self.params[id.0]
    }

    pub fn set_manifold(&mut self, id: ParamId, manifold: ManifoldKind) {
        self.params[id.0].manifold = manifold;
    }

    /// Hold every coordinate of a block constant.
    pub fn fix_all(&mut self, id: ParamId) {
        let dim = self.params[id.0].dim;
        self.params[id.0].fixed = FixedMask::all_fixed(dim);
    }

    pub fn is_constant(&self, id: ParamId) -> bool {
        let p = &self.params[id.0];
        p.fixed.is_all_fixed(p.dim)
    }

    /// Validates internal consistency and factor expectations.
    pub fn validate(&self) -> Result<()> {
        for (idx, param) in self.params.iter().enumerate() {
            ensure!(
                param.id.0 == idx,
                "param id mismatch: expected {}, got {:?}",
                idx,
                param.id
            );
            ensure!(
                param.manifold.compatible_dim(param.dim),
                "param {} manifold {:?} incompatible with dim {}",
                param.name,
                param.manifold,
                param.dim
            );
            for fixed_idx in param.fixed.iter() {
                ensure!(
                    fixed_idx < param.dim,
                    "param {} fixed index {} out of range",
                    param.name,
                    fixed_idx
                );
            }
            if !param.fixed.is_empty() && !param.fixed.is_all_fixed(param.dim) {
                ensure!(
                    param.manifold == ManifoldKind::Euclidean,
                    "param {} cannot partially fix a {:?} manifold",
                    param.name,
                    param.manifold
                );
            }
        }

        for (r_idx, residual) in self.residuals.iter().enumerate() {
            let factor = &residual.factor;
            ensure!(
                residual.residual_dim == factor.residual_dim(),
                "residual {} dim {} does not match factor expectation {}",
                r_idx,
                residual.residual_dim,
                factor.residual_dim()
            );
            ensure!(
                residual.params.len() == factor.num_params(),
                "residual {} has {} params, factor expects {}",
                r_idx,
                residual.params.len(),
                factor.num_params()
            );
            for param in &residual.params {
                let block = self
                    .params
                    .get(param.0)
                    .ok_or_else(|| {
                        anyhow!("residual {} references missing param {:?}", r_idx, param)
                    })?;
                ensure!(
                    block.dim == factor.param_dim(),
                    "residual {} expects {}D pose blocks, {} has dim {}",
                    r_idx,
                    factor.param_dim(),
                    block.name,
                    block.dim
                );
                let constant = block.fixed.is_all_fixed(block.dim);
                ensure!(
                    constant || block.manifold == factor.param_manifold(),
                    "residual {} expects {:?} manifold on {}, got {:?}",
                    r_idx,
                    factor.param_manifold(),
                    block.name,
                    block.manifold
                );
            }
            if let RobustLoss::Huber { scale }
            | RobustLoss::Cauchy { scale }
            | RobustLoss::Arctan { scale } = residual.loss
            {
                ensure!(scale > 0.0, "residual {} has non-positive loss scale", r_idx);
            }
        }

        Ok(())
    }
}
