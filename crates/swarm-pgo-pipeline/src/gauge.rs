//! Manifold assignment and gauge anchoring.
//!
//! A pose graph built only from relative constraints is invariant to a global
//! rigid motion. Exactly one frame is held constant to remove that freedom:
//! the head of the local robot when solving centrally, the head of the
//! coordinator when solving distributed (and only on the coordinator itself).

use std::collections::BTreeSet;

use log::debug;
use serde::{Deserialize, Serialize};
use swarm_pgo_core::{FrameId, PoseStore};
use swarm_pgo_optim::PoseDof;
use swarm_pgo_optim::ir::{ManifoldKind, ProblemIR};
use swarm_pgo_optim::params::param_name;

use crate::{OptimizationMode, PgoConfig};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GaugeReport {
    /// Used frames that received a manifold, ascending.
    pub parameterized: Vec<FrameId>,
    /// Frame held constant, if any.
    pub anchor: Option<FrameId>,
}

pub fn manifold_for(dof: PoseDof) -> ManifoldKind {
    match dof {
        PoseDof::FourDof => ManifoldKind::PosYaw,
        PoseDof::SixDof => ManifoldKind::SE3,
    }
}

/// Frame to hold constant under `config`, before checking it is in the problem.
pub fn anchor_frame(store: &PoseStore, config: &PgoConfig) -> Option<FrameId> {
    match config.mode {
        OptimizationMode::Centralized => store.head_id(config.self_id),
        OptimizationMode::Distributed if config.self_id == config.main_id => {
            store.head_id(config.main_id)
        }
        OptimizationMode::Distributed => None,
    }
}

/// Assign manifolds to the used frames and anchor the gauge.
///
/// Frames without a parameter block are skipped.
pub fn fix_gauge(
    ir: &mut ProblemIR,
    store: &PoseStore,
    used_frames: &BTreeSet<FrameId>,
    config: &PgoConfig,
) -> GaugeReport {
    let manifold = manifold_for(config.pose_dof);
    let mut report = GaugeReport::default();

    for &frame_id in used_frames {
        match ir.param_by_name(&param_name(frame_id)) {
            Some(id) => {
                ir.set_manifold(id, manifold);
                report.parameterized.push(frame_id);
            }
            None => debug!("gauge: frame {frame_id} has no parameter block"),
        }
    }

    if let Some(frame_id) = anchor_frame(store, config) {
        match ir.param_by_name(&param_name(frame_id)) {
            Some(id) => {
                ir.fix_all(id);
                report.anchor = Some(frame_id);
            }
            None => debug!("gauge: anchor frame {frame_id} is not in the problem"),
        }
    }

    debug!(
        "gauge: {} frames on {manifold:?}, anchor {:?}",
        report.parameterized.len(),
        report.anchor
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_pgo_core::{Frame, Iso3};
    use swarm_pgo_optim::ir::FixedMask;

    fn store() -> PoseStore {
        let mut store = PoseStore::new();
        for (id, drone, t) in [(1, 0, 0.0), (2, 0, 1.0), (10, 1, 0.0), (11, 1, 1.0)] {
            store.add_frame(Frame::new(id, drone, t, Iso3::identity())).unwrap();
        }
        store
    }

    fn ir_with(frames: &[FrameId], dof: PoseDof) -> ProblemIR {
        let mut ir = ProblemIR::new();
        for f in frames {
            ir.add_param_block(
                param_name(*f),
                dof.param_dim(),
                ManifoldKind::Euclidean,
                FixedMask::all_free(),
            );
        }
        ir
    }

    #[test]
    fn centralized_anchors_own_head() {
        let store = store();
        let mut ir = ir_with(&[1, 2, 10, 11], PoseDof::FourDof);
        let used: BTreeSet<_> = [1, 2, 10, 11, 42].into_iter().collect();
        let cfg = PgoConfig {
            self_id: 1,
            ..Default::default()
        };
        let report = fix_gauge(&mut ir, &store, &used, &cfg);
        assert_eq!(report.anchor, Some(10));
        assert_eq!(report.parameterized, vec![1, 2, 10, 11]);
        let anchored = ir.param_by_name("frame_10").unwrap();
        assert!(ir.is_constant(anchored));
        let constants = ir.params.iter().filter(|p| ir.is_constant(p.id)).count();
        assert_eq!(constants, 1);
        assert!(ir.params.iter().all(|p| p.manifold == ManifoldKind::PosYaw));
    }

    #[test]
    fn distributed_anchors_only_on_coordinator() {
        let store = store();
        let used: BTreeSet<_> = [1, 2, 10].into_iter().collect();
        let mut cfg = PgoConfig {
            mode: OptimizationMode::Distributed,
            pose_dof: PoseDof::SixDof,
            self_id: 1,
            main_id: 0,
            ..Default::default()
        };

        let mut ir = ir_with(&[1, 2, 10], PoseDof::SixDof);
        assert_eq!(fix_gauge(&mut ir, &store, &used, &cfg).anchor, None);
        assert!(ir.params.iter().all(|p| !ir.is_constant(p.id)));

        cfg.self_id = 0;
        let mut ir = ir_with(&[1, 2, 10], PoseDof::SixDof);
        assert_eq!(fix_gauge(&mut ir, &store, &used, &cfg).anchor, Some(1));
        assert!(ir.params.iter().all(|p| p.manifold == ManifoldKind::SE3));
    }

    #[test]
    fn missing_anchor_block_is_skipped() {
        let store = store();
        let mut ir = ir_with(&[2], PoseDof::FourDof);
        let used: BTreeSet<_> = [2].into_iter().collect();
        let report = fix_gauge(&mut ir, &store, &used, &PgoConfig::default());
        assert_eq!(report.anchor, None);
        assert_eq!(report.parameterized, vec![2]);
    }
}
