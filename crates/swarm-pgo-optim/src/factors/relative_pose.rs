//! Relative-pose residual models.
//!
//! Six-DOF blocks are `[qx, qy, qz, qw, tx, ty, tz]`; four-DOF blocks are
//! `[x, y, z, yaw]`. Rotation errors use twice the vector part of the error
//! quaternion, which matches the rotation vector to first order.

use nalgebra::{
    DVector, DVectorView, Matrix3, Matrix6, Quaternion, RealField, SVector, UnitQuaternion,
    Vector3,
};

#[inline]
fn lit<T: RealField>(v: f64) -> T {
    T::from_f64(v).unwrap()
}

fn se3_parts<T: RealField>(pose: DVectorView<'_, T>) -> (UnitQuaternion<T>, Vector3<T>) {
    debug_assert!(pose.len() == 7, "pose must have 7 params");
    let quat = Quaternion::new(
        pose[3].clone(),
        pose[0].clone(),
        pose[1].clone(),
        pose[2].clone(),
    );
    let t = Vector3::new(pose[4].clone(), pose[5].clone(), pose[6].clone());
    (UnitQuaternion::from_quaternion(quat), t)
}

fn se3_parts_const<T: RealField>(se3: &[f64; 7]) -> (UnitQuaternion<T>, Vector3<T>) {
    let quat = Quaternion::new(lit(se3[3]), lit(se3[0]), lit(se3[1]), lit(se3[2]));
    let t = Vector3::new(lit(se3[4]), lit(se3[5]), lit(se3[6]));
    (UnitQuaternion::from_quaternion(quat), t)
}

/// `2 * vec(q)` with the sign chosen so that `w >= 0`.
fn rotation_error<T: RealField>(q: &UnitQuaternion<T>) -> Vector3<T> {
    let two = lit::<T>(2.0);
    let v = q.as_ref().imag();
    if q.as_ref().w < T::zero() {
        -v * two
    } else {
        v * two
    }
}

/// Wrap an angle to `(-pi, pi]`.
#[inline]
fn wrap<T: RealField>(a: T) -> T {
    a.clone().sin().atan2(a.cos())
}

/// Six-DOF relative-pose residual between poses `a` and `b`.
///
/// The prediction is `a^-1 * b`; the error is `[t_pred - t_meas; rot(q_meas^-1 q_pred)]`
/// whitened by the column-major `sqrt_info`.
pub fn rel_pose_6d_residual(
    a: &DVector<f64>,
    b: &DVector<f64>,
    delta_se3: &[f64; 7],
    sqrt_info: &[f64; 36],
) -> SVector<f64, 6> {
    rel_pose_6d_residual_generic(a.as_view(), b.as_view(), delta_se3, sqrt_info)
}

pub(crate) fn rel_pose_6d_residual_generic<T: RealField>(
    a: DVectorView<'_, T>,
    b: DVectorView<'_, T>,
    delta_se3: &[f64; 7],
    sqrt_info: &[f64; 36],
) -> SVector<T, 6> {
    let (qa, ta) = se3_parts(a);
    let (qb, tb) = se3_parts(b);
    let (qm, tm) = se3_parts_const::<T>(delta_se3);

    let qa_inv = qa.inverse();
    let q_ab = qa_inv.clone() * qb;
    let t_ab = qa_inv.transform_vector(&(tb - ta));

    let dt = t_ab - tm;
    let dr = rotation_error(&(qm.inverse() * q_ab));

    let err = SVector::<T, 6>::new(
        dt.x.clone(),
        dt.y.clone(),
        dt.z.clone(),
        dr.x.clone(),
        dr.y.clone(),
        dr.z.clone(),
    );
    let s = Matrix6::<T>::from_iterator(sqrt_info.iter().map(|v| lit::<T>(*v)));
    s * err
}

/// Four-DOF relative-pose residual between `[x, y, z, yaw]` blocks.
///
/// Position error is `Rz(yaw_a)^T (p_b - p_a) - delta_pos` whitened by the
/// column-major 3x3 `sqrt_info_pos`; yaw error is the wrapped heading difference
/// scaled by `sqrt_info_yaw`.
pub fn rel_pose_4d_residual(
    a: &DVector<f64>,
    b: &DVector<f64>,
    delta_pos: &[f64; 3],
    delta_yaw: f64,
    sqrt_info_pos: &[f64; 9],
    sqrt_info_yaw: f64,
) -> SVector<f64, 4> {
    rel_pose_4d_residual_generic(
        a.as_view(),
        b.as_view(),
        delta_pos,
        delta_yaw,
        sqrt_info_pos,
        sqrt_info_yaw,
    )
}

pub(crate) fn rel_pose_4d_residual_generic<T: RealField>(
    a: DVectorView<'_, T>,
    b: DVectorView<'_, T>,
    delta_pos: &[f64; 3],
    delta_yaw: f64,
    sqrt_info_pos: &[f64; 9],
    sqrt_info_yaw: f64,
) -> SVector<T, 4> {
    debug_assert!(a.len() == 4 && b.len() == 4, "pose blocks must have 4 params");

    let dx = b[0].clone() - a[0].clone();
    let dy = b[1].clone() - a[1].clone();
    let dz = b[2].clone() - a[2].clone();
    let (s, c) = a[3].clone().sin_cos();

    // Rz(yaw_a)^T * d
    let local = Vector3::new(
        c.clone() * dx.clone() + s.clone() * dy.clone(),
        -s * dx + c * dy,
        dz,
    );
    let meas = Vector3::new(lit::<T>(delta_pos[0]), lit(delta_pos[1]), lit(delta_pos[2]));
    let sp = Matrix3::<T>::from_iterator(sqrt_info_pos.iter().map(|v| lit::<T>(*v)));
    let rp = sp * (local - meas);

    let dyaw = wrap(b[3].clone() - a[3].clone() - lit(delta_yaw));
    SVector::<T, 4>::new(
        rp.x.clone(),
        rp.y.clone(),
        rp.z.clone(),
        dyaw * lit(sqrt_info_yaw),
    )
}

pub(crate) fn consensus_prior_6d_residual_generic<T: RealField>(
    x: DVectorView<'_, T>,
    target_se3: &[f64; 7],
    w_pos: f64,
    w_rot: f64,
) -> SVector<T, 6> {
    let (q, t) = se3_parts(x);
    let (qz, tz) = se3_parts_const::<T>(target_se3);
    let dt = (t - tz) * lit::<T>(w_pos);
    let dr = rotation_error(&(qz.inverse() * q)) * lit::<T>(w_rot);
    SVector::<T, 6>::new(
        dt.x.clone(),
        dt.y.clone(),
        dt.z.clone(),
        dr.x.clone(),
        dr.y.clone(),
        dr.z.clone(),
    )
}

pub(crate) fn consensus_prior_4d_residual_generic<T: RealField>(
    x: DVectorView<'_, T>,
    target: &[f64; 4],
    w_pos: f64,
    w_rot: f64,
) -> SVector<T, 4> {
    debug_assert!(x.len() == 4, "pose block must have 4 params");
    let wp = lit::<T>(w_pos);
    SVector::<T, 4>::new(
        (x[0].clone() - lit(target[0])) * wp.clone(),
        (x[1].clone() - lit(target[1])) * wp.clone(),
        (x[2].clone() - lit(target[2])) * wp,
        wrap(x[3].clone() - lit(target[3])) * lit(w_rot),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{iso3_to_pos_yaw_dvec, iso3_to_se3_dvec};
    use approx::assert_relative_eq;
    use swarm_pgo_core::{delta_pose, iso_from_xyz_rpy, yaw_of};

    fn identity_sqrt6() -> [f64; 36] {
        let mut s = [0.0; 36];
        for i in 0..6 {
            s[i * 6 + i] = 1.0;
        }
        s
    }

    #[test]
    fn six_dof_residual_vanishes_at_measurement() {
        let a = iso_from_xyz_rpy(Vector3::new(1.0, -2.0, 0.5), 0.1, 0.2, -0.3);
        let b = iso_from_xyz_rpy(Vector3::new(2.0, 0.0, 1.0), -0.2, 0.05, 1.2);
        let m = iso3_to_se3_dvec(&delta_pose(&a, &b));
        let mut meas = [0.0; 7];
        meas.copy_from_slice(m.as_slice());

        let r = rel_pose_6d_residual(
            &iso3_to_se3_dvec(&a),
            &iso3_to_se3_dvec(&b),
            &meas,
            &identity_sqrt6(),
        );
        assert!(r.norm() < 1e-12, "residual {r}");
    }

    #[test]
    fn six_dof_residual_is_sign_invariant_in_quaternion() {
        let a = iso_from_xyz_rpy(Vector3::zeros(), 0.0, 0.0, 0.0);
        let b = iso_from_xyz_rpy(Vector3::x(), 0.0, 0.0, 0.1);
        let mut meas = [0.0; 7];
        meas.copy_from_slice(iso3_to_se3_dvec(&b).as_slice());
        let mut flipped = iso3_to_se3_dvec(&b);
        for i in 0..4 {
            flipped[i] = -flipped[i];
        }
        let r = rel_pose_6d_residual(&iso3_to_se3_dvec(&a), &flipped, &meas, &identity_sqrt6());
        assert!(r.norm() < 1e-12);
    }

    #[test]
    fn six_dof_rotation_error_is_small_angle() {
        let a = iso_from_xyz_rpy(Vector3::zeros(), 0.0, 0.0, 0.0);
        let b = iso_from_xyz_rpy(Vector3::zeros(), 0.0, 0.0, 0.01);
        let mut meas = [0.0; 7];
        meas.copy_from_slice(iso3_to_se3_dvec(&a).as_slice());
        let r = rel_pose_6d_residual(
            &iso3_to_se3_dvec(&a),
            &iso3_to_se3_dvec(&b),
            &meas,
            &identity_sqrt6(),
        );
        assert_relative_eq!(r[5], 0.01, epsilon = 1e-6);
    }

    #[test]
    fn four_dof_residual_vanishes_in_yaw_frame() {
        let a = iso_from_xyz_rpy(
            Vector3::new(1.0, 1.0, 0.0),
            0.0,
            0.0,
            std::f64::consts::FRAC_PI_2,
        );
        let b = iso_from_xyz_rpy(Vector3::new(1.0, 3.0, 0.5), 0.0, 0.0, 3.0);
        // b is 2 m ahead of a along a's heading, 0.5 m up.
        let delta_yaw = yaw_of(&b.rotation) - yaw_of(&a.rotation);
        let mut sp = [0.0; 9];
        sp[0] = 1.0;
        sp[4] = 1.0;
        sp[8] = 1.0;
        let r = rel_pose_4d_residual(
            &iso3_to_pos_yaw_dvec(&a),
            &iso3_to_pos_yaw_dvec(&b),
            &[2.0, 0.0, 0.5],
            delta_yaw,
            &sp,
            1.0,
        );
        assert!(r.norm() < 1e-12, "residual {r}");
    }

    #[test]
    fn four_dof_yaw_error_wraps() {
        let a = nalgebra::dvector![0.0, 0.0, 0.0, 3.1];
        let b = nalgebra::dvector![0.0, 0.0, 0.0, -3.1];
        let sp = [0.0; 9];
        let r = rel_pose_4d_residual(&a, &b, &[0.0; 3], 0.0, &sp, 1.0);
        assert_relative_eq!(r[3], 2.0 * std::f64::consts::PI - 6.2, epsilon = 1e-12);
    }

    #[test]
    fn consensus_priors_are_zero_at_target() {
        let pose = iso_from_xyz_rpy(Vector3::new(0.3, 0.2, 0.1), 0.1, 0.0, 0.5);
        let se3 = iso3_to_se3_dvec(&pose);
        let mut target = [0.0; 7];
        target.copy_from_slice(se3.as_slice());
        let r = consensus_prior_6d_residual_generic(se3.as_view(), &target, 3.0, 5.0);
        assert!(r.norm() < 1e-12);

        let py = iso3_to_pos_yaw_dvec(&pose);
        let r = consensus_prior_4d_residual_generic(
            py.as_view(),
            &[0.3, 0.2, 0.0, 0.5],
            2.0,
            1.0,
        );
        assert_relative_eq!(r[2], 0.2, epsilon = 1e-12);
        assert_relative_eq!(r[3], 0.0, epsilon = 1e-12);
    }
}
