//! Residual factor implementations with automatic differentiation support.
//!
//! All residuals are generic over [`nalgebra::RealField`] so the same code is
//! evaluated with `f64` and with the dual numbers of the backend's autodiff.
//!
//! - [`relative_pose`]: relative-pose constraints (loops, ego-motion) and
//!   consensus priors, in six- and four-DOF variants.

pub mod relative_pose;

use nalgebra::{DVector, RealField};

use crate::ir::FactorKind;

/// Evaluate the residual of any factor kind.
///
/// `params` must follow the factor's parameter order.
pub fn factor_residual<T: RealField>(kind: &FactorKind, params: &[DVector<T>]) -> DVector<T> {
    use relative_pose::*;
    match kind {
        FactorKind::RelPose6D {
            delta_se3,
            sqrt_info,
        } => {
            let r = rel_pose_6d_residual_generic(
                params[0].as_view(),
                params[1].as_view(),
                delta_se3,
                sqrt_info,
            );
            DVector::from_row_slice(r.as_slice())
        }
        FactorKind::RelPose4D {
            delta_pos,
            delta_yaw,
            sqrt_info_pos,
            sqrt_info_yaw,
        } => {
            let r = rel_pose_4d_residual_generic(
                params[0].as_view(),
                params[1].as_view(),
                delta_pos,
                *delta_yaw,
                sqrt_info_pos,
                *sqrt_info_yaw,
            );
            DVector::from_row_slice(r.as_slice())
        }
        FactorKind::ConsensusPrior6D {
            target_se3,
            w_pos,
            w_rot,
        } => {
            let r = consensus_prior_6d_residual_generic(
                params[0].as_view(),
                target_se3,
                *w_pos,
                *w_rot,
            );
            DVector::from_row_slice(r.as_slice())
        }
        FactorKind::ConsensusPrior4D {
            target,
            w_pos,
            w_rot,
        } => {
            let r =
                consensus_prior_4d_residual_generic(params[0].as_view(), target, *w_pos, *w_rot);
            DVector::from_row_slice(r.as_slice())
        }
    }
}
