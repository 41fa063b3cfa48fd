//! Parameter-block bookkeeping shared by the solvers.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, anyhow, ensure};
use nalgebra::DVector;
use swarm_pgo_core::{FrameId, Iso3, PoseStore};

use crate::ir::{FixedMask, ManifoldKind, ParamId, ProblemIR};
use crate::params::{PoseDof, pack_pose, param_name, unpack_pose};
use crate::solver::ResidualInfo;

/// IR under construction plus the initial value of every block.
///
/// Blocks are created on first use from the store snapshot. New blocks are
/// Euclidean until a gauge pass assigns their manifold.
#[derive(Debug)]
pub(crate) struct GraphBuilder<'a> {
    pub(crate) store: &'a PoseStore,
    pub(crate) dof: PoseDof,
    pub(crate) ir: ProblemIR,
    pub(crate) initial: HashMap<String, DVector<f64>>,
    pub(crate) frames: BTreeMap<FrameId, ParamId>,
    pub(crate) residual_frames: Vec<Vec<FrameId>>,
}

impl<'a> GraphBuilder<'a> {
    pub(crate) fn new(store: &'a PoseStore, dof: PoseDof) -> Self {
        Self {
            store,
            dof,
            ir: ProblemIR::new(),
            initial: HashMap::new(),
            frames: BTreeMap::new(),
            residual_frames: Vec::new(),
        }
    }

    pub(crate) fn add_residual(&mut self, info: ResidualInfo) -> Result<()> {
        ensure!(
            info.frames.len() == info.factor.num_params(),
            "factor {:?} expects {} frames, got {}",
            info.factor,
            info.factor.num_params(),
            info.frames.len()
        );
        ensure!(
            info.factor.param_dim() == self.dof.param_dim(),
            "factor {:?} does not match {:?} pose blocks",
            info.factor,
            self.dof
        );

        let mut params = Vec::with_capacity(info.frames.len());
        for &frame_id in &info.frames {
            params.push(self.block_for(frame_id)?);
        }
        self.ir.add_factor(params, info.factor, info.loss);
        self.residual_frames.push(info.frames);
        Ok(())
    }

    fn block_for(&mut self, frame_id: FrameId) -> Result<ParamId> {
        if let Some(id) = self.frames.get(&frame_id) {
            return Ok(*id);
        }
        let handle = self
            .store
            .pose_state(frame_id)
            .ok_or_else(|| anyhow!("residual references unknown frame {frame_id}"))?;
        let name = param_name(frame_id);
        let id = self.ir.add_param_block(
            name.clone(),
            self.dof.param_dim(),
            ManifoldKind::Euclidean,
            FixedMask::all_free(),
        );
        self.initial
            .insert(name, pack_pose(self.dof, self.store.pose(handle)));
        self.frames.insert(frame_id, id);
        Ok(id)
    }

    pub(crate) fn is_constant(&self, frame_id: FrameId) -> bool {
        self.frames
            .get(&frame_id)
            .is_some_and(|id| self.ir.is_constant(*id))
    }

    /// Current stored pose of a frame; roll/pitch reference for four-DOF blocks.
    pub(crate) fn reference(&self, frame_id: FrameId) -> Result<&Iso3> {
        let handle = self
            .store
            .pose_state(frame_id)
            .ok_or_else(|| anyhow!("unknown frame {frame_id}"))?;
        Ok(self.store.pose(handle))
    }

    pub(crate) fn unpack(&self, frame_id: FrameId, v: &DVector<f64>) -> Result<Iso3> {
        unpack_pose(self.dof, v.as_view(), self.reference(frame_id)?)
    }

    /// Unpack every non-constant block of `params` whose frame passes `keep`.
    pub(crate) fn collect_poses(
        &self,
        params: &HashMap<String, DVector<f64>>,
        keep: impl Fn(FrameId) -> bool,
    ) -> Result<BTreeMap<FrameId, Iso3>> {
        let mut out = BTreeMap::new();
        for &frame_id in self.frames.keys() {
            if self.is_constant(frame_id) || !keep(frame_id) {
                continue;
            }
            let name = param_name(frame_id);
            let v = params
                .get(&name)
                .ok_or_else(|| anyhow!("solution is missing {name}"))?;
            out.insert(frame_id, self.unpack(frame_id, v)?);
        }
        Ok(out)
    }

    pub(crate) fn has_free_blocks(&self) -> bool {
        self.frames.values().any(|id| !self.ir.is_constant(*id))
    }
}
