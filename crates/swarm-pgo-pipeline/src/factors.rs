//! Construction of the residual set for one solve.
//!
//! Loop closures become robustified relative-pose residuals. Consecutive
//! keyframes of a trajectory become ego-motion residuals whose uncertainty
//! grows with the distance travelled between them.

use std::collections::BTreeSet;

use log::debug;
use nalgebra::Matrix3;
use swarm_pgo_core::{
    Frame, FrameId, Iso3, LoopEdge, Mat6, PoseStore, Real, delta_pose, tilt_of, wrap_angle, yaw_of,
};
use swarm_pgo_optim::ir::{FactorKind, RobustLoss};
use swarm_pgo_optim::params::iso3_to_se3_dvec;
use swarm_pgo_optim::{PoseDof, ResidualInfo};

use crate::{OptimizationMode, PgoConfig, PgoError};

/// Below this travelled distance (m) the ego-motion covariance is singular;
/// its square-root information is evaluated at this length instead.
pub const MIN_EGO_MOTION_LENGTH: Real = 1e-3;

/// Residuals for one solve and the frames they touch.
#[derive(Debug, Clone, Default)]
pub struct FactorSet {
    pub residuals: Vec<ResidualInfo>,
    pub used_frames: BTreeSet<FrameId>,
    pub loop_factors: usize,
    pub ego_motion_factors: usize,
}

impl FactorSet {
    fn push(&mut self, info: ResidualInfo) {
        self.used_frames.extend(info.frames.iter().copied());
        self.residuals.push(info);
    }
}

/// Odometry covariance after travelling `len` meters (position block first).
pub fn ego_motion_covariance(len: Real, pos_cov_per_meter: Real, yaw_cov_per_meter: Real) -> Mat6 {
    let mut cov = Mat6::zeros();
    let pos = Matrix3::<Real>::identity() * pos_cov_per_meter * len
        + Matrix3::<Real>::identity() * 0.5 * yaw_cov_per_meter * len * len;
    cov.fixed_view_mut::<3, 3>(0, 0).copy_from(&pos);
    cov.fixed_view_mut::<3, 3>(3, 3)
        .copy_from(&(Matrix3::<Real>::identity() * yaw_cov_per_meter * len));
    cov
}

/// Elementwise `sqrt(|cov^-1|)` of the ego-motion covariance.
pub fn ego_motion_sqrt_info(len: Real, pos_cov_per_meter: Real, yaw_cov_per_meter: Real) -> Mat6 {
    let cov = ego_motion_covariance(
        len.max(MIN_EGO_MOTION_LENGTH),
        pos_cov_per_meter,
        yaw_cov_per_meter,
    );
    // Block diagonal with positive diagonal blocks for any len > 0.
    let inv = cov.try_inverse().unwrap_or_else(Mat6::zeros);
    inv.map(|v| v.abs().sqrt())
}

fn column_major_6(m: &Mat6) -> [f64; 36] {
    let mut out = [0.0; 36];
    out.copy_from_slice(m.as_slice());
    out
}

fn column_major_3(m: &Mat6) -> [f64; 9] {
    let block: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
    let mut out = [0.0; 9];
    out.copy_from_slice(block.as_slice());
    out
}

/// Relative-pose factor for `measurement` (pose of b in a), matched to `dof`.
///
/// In four-DOF mode the measurement is reduced with `reference_a`, the current
/// pose of frame a: the translation is rotated by its tilt and the yaw change
/// is taken between `reference_a` and `reference_a * measurement`.
pub fn relative_pose_factor(
    dof: PoseDof,
    measurement: &Iso3,
    reference_a: &Iso3,
    sqrt_info: &Mat6,
) -> FactorKind {
    match dof {
        PoseDof::SixDof => {
            let mut delta_se3 = [0.0; 7];
            delta_se3.copy_from_slice(iso3_to_se3_dvec(measurement).as_slice());
            FactorKind::RelPose6D {
                delta_se3,
                sqrt_info: column_major_6(sqrt_info),
            }
        }
        PoseDof::FourDof => {
            let dp = tilt_of(&reference_a.rotation) * measurement.translation.vector;
            let yaw_a = yaw_of(&reference_a.rotation);
            let yaw_b = yaw_of(&(reference_a.rotation * measurement.rotation));
            FactorKind::RelPose4D {
                delta_pos: [dp.x, dp.y, dp.z],
                delta_yaw: wrap_angle(yaw_b - yaw_a),
                sqrt_info_pos: column_major_3(sqrt_info),
                sqrt_info_yaw: sqrt_info[(5, 5)],
            }
        }
    }
}

/// Loop-closure residual, reduced with frame a's current pose.
pub fn loop_factor(
    store: &PoseStore,
    edge: &LoopEdge,
    dof: PoseDof,
    loss: RobustLoss,
) -> Result<ResidualInfo, PgoError> {
    let a = store
        .frame(edge.frame_id_a)
        .ok_or(PgoError::UnknownFrame(edge.frame_id_a))?;
    if !store.contains(edge.frame_id_b) {
        return Err(PgoError::UnknownFrame(edge.frame_id_b));
    }
    let sqrt_info = edge.sqrt_information()?;
    Ok(ResidualInfo {
        frames: vec![edge.frame_id_a, edge.frame_id_b],
        factor: relative_pose_factor(dof, &edge.relative_pose, &a.pose, &sqrt_info),
        loss,
    })
}

/// Odometry residual between consecutive keyframes, measured on `odom`.
pub fn ego_motion_factor(a: &Frame, b: &Frame, config: &PgoConfig) -> ResidualInfo {
    let measurement = delta_pose(&a.odom, &b.odom);
    let len = measurement.translation.vector.norm();
    let sqrt_info = ego_motion_sqrt_info(len, config.pos_cov_per_meter, config.yaw_cov_per_meter);
    ResidualInfo {
        frames: vec![a.frame_id, b.frame_id],
        factor: relative_pose_factor(config.pose_dof, &measurement, &a.odom, &sqrt_info),
        loss: RobustLoss::None,
    }
}

/// All residuals of one solve.
///
/// Loops are added in every mode; ego-motion covers every robot in
/// centralized mode and only `self_id` in distributed mode.
pub fn build_factors(
    store: &PoseStore,
    loops: &[LoopEdge],
    config: &PgoConfig,
) -> Result<FactorSet, PgoError> {
    let mut set = FactorSet::default();

    for edge in loops {
        set.push(loop_factor(store, edge, config.pose_dof, config.loop_loss)?);
        set.loop_factors += 1;
    }

    let drones = match config.mode {
        OptimizationMode::Centralized => store.available_drones(),
        OptimizationMode::Distributed => vec![config.self_id],
    };
    for drone in drones {
        let keyframes: Vec<&Frame> = store.trajectory(drone).keyframes().collect();
        for pair in keyframes.windows(2) {
            set.push(ego_motion_factor(pair[0], pair[1], config));
            set.ego_motion_factors += 1;
        }
    }

    debug!(
        "factor builder: {} loop, {} ego-motion residuals over {} frames",
        set.loop_factors,
        set.ego_motion_factors,
        set.used_frames.len()
    );
    Ok(set)
}
