//! Pose parameter packing for solver backends.
//!
//! Six-DOF poses are stored as `[qx, qy, qz, qw, tx, ty, tz]`, four-DOF poses
//! as `[x, y, z, yaw]`. A four-DOF block does not carry roll and pitch; they are
//! taken from a reference pose when unpacking.

use anyhow::{Result, ensure};
use nalgebra::{DVector, DVectorView, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use swarm_pgo_core::{FrameId, Iso3, make_iso, with_yaw, yaw_of};

/// Degrees of freedom optimized per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PoseDof {
    /// Position and yaw; roll and pitch stay at their current values.
    #[default]
    FourDof,
    /// Full SE(3).
    SixDof,
}

impl PoseDof {
    /// Ambient size of a pose parameter block.
    pub fn param_dim(self) -> usize {
        match self {
            PoseDof::FourDof => 4,
            PoseDof::SixDof => 7,
        }
    }

    /// Residual size of a relative-pose factor.
    pub fn residual_dim(self) -> usize {
        match self {
            PoseDof::FourDof => 4,
            PoseDof::SixDof => 6,
        }
    }
}

/// Parameter block name of a frame.
pub fn param_name(frame_id: FrameId) -> String {
    format!("frame_{frame_id}")
}

/// Inverse of [`param_name`].
pub fn frame_id_from_param(name: &str) -> Option<FrameId> {
    name.strip_prefix("frame_")?.parse().ok()
}

/// Convert an `Iso3` into a 7D SE(3) parameter vector `[qx, qy, qz, qw, tx, ty, tz]`.
///
/// The quaternion is stored in `(x, y, z, w)` order to match tiny-solver.
pub fn iso3_to_se3_dvec(pose: &Iso3) -> DVector<f64> {
    let q = pose.rotation.into_inner();
    let t = pose.translation.vector;
    nalgebra::dvector![
        q.coords[0],
        q.coords[1],
        q.coords[2],
        q.coords[3],
        t.x,
        t.y,
        t.z
    ]
}

/// Convert a 7D SE(3) vector `[qx, qy, qz, qw, tx, ty, tz]` into an `Iso3`.
///
/// The quaternion is renormalized.
pub fn se3_dvec_to_iso3(v: DVectorView<'_, f64>) -> Result<Iso3> {
    ensure!(
        v.len() == 7,
        "expected se3 vector of length 7, got {}",
        v.len()
    );
    let quat = Quaternion::new(v[3], v[0], v[1], v[2]);
    ensure!(quat.norm() > 1e-12, "degenerate quaternion in se3 vector");
    let rot = UnitQuaternion::from_quaternion(quat);
    let trans = Vector3::new(v[4], v[5], v[6]);
    Ok(Iso3::from_parts(trans.into(), rot))
}

/// `[x, y, z, yaw]` of a pose.
pub fn iso3_to_pos_yaw_dvec(pose: &Iso3) -> DVector<f64> {
    let t = pose.translation.vector;
    nalgebra::dvector![t.x, t.y, t.z, yaw_of(&pose.rotation)]
}

/// Rebuild a pose from `[x, y, z, yaw]`, keeping the roll and pitch of `reference`.
pub fn pos_yaw_dvec_to_iso3(v: DVectorView<'_, f64>, reference: &Iso3) -> Result<Iso3> {
    ensure!(
        v.len() == 4,
        "expected position+yaw vector of length 4, got {}",
        v.len()
    );
    let rot = with_yaw(&reference.rotation, v[3]);
    Ok(make_iso(rot, Vector3::new(v[0], v[1], v[2])))
}

pub fn pack_pose(dof: PoseDof, pose: &Iso3) -> DVector<f64> {
    match dof {
        PoseDof::FourDof => iso3_to_pos_yaw_dvec(pose),
        PoseDof::SixDof => iso3_to_se3_dvec(pose),
    }
}

/// Unpack a pose block. `reference` supplies roll and pitch in four-DOF mode.
pub fn unpack_pose(dof: PoseDof, v: DVectorView<'_, f64>, reference: &Iso3) -> Result<Iso3> {
    match dof {
        PoseDof::FourDof => pos_yaw_dvec_to_iso3(v, reference),
        PoseDof::SixDof => se3_dvec_to_iso3(v),
    }
}
