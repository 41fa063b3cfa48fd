use nalgebra::{Isometry3, Matrix3, Matrix6, Rotation3, Translation3, UnitQuaternion, Vector3};

pub type Real = f64;

pub type Vec3 = Vector3<Real>;
pub type Mat3 = Matrix3<Real>;
pub type Mat6 = Matrix6<Real>;
pub type Iso3 = Isometry3<Real>;
pub type Quat = UnitQuaternion<Real>;

/// Wrap an angle to `(-pi, pi]`.
#[inline]
pub fn wrap_angle(angle: Real) -> Real {
    angle.sin().atan2(angle.cos())
}

/// Heading (rotation about world z) of an orientation, ZYX convention.
#[inline]
pub fn yaw_of(rot: &Quat) -> Real {
    rot.euler_angles().2
}

/// Pure rotation about the world z axis.
#[inline]
pub fn yaw_rotation(yaw: Real) -> Quat {
    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), yaw)
}

/// Roll/pitch part of an orientation: `Rz(-yaw) * R`.
#[inline]
pub fn tilt_of(rot: &Quat) -> Quat {
    yaw_rotation(-yaw_of(rot)) * rot
}

/// Replace the heading of `reference` by `yaw`, keeping its roll and pitch.
pub fn with_yaw(reference: &Quat, yaw: Real) -> Quat {
    yaw_rotation(yaw) * tilt_of(reference)
}

/// Relative pose `a^-1 * b`.
#[inline]
pub fn delta_pose(a: &Iso3, b: &Iso3) -> Iso3 {
    a.inverse() * b
}

pub fn make_iso(rot: Quat, t: Vec3) -> Iso3 {
    Isometry3::from_parts(Translation3::from(t), rot)
}

/// Build a pose from a position and ZYX euler angles.
pub fn iso_from_xyz_rpy(t: Vec3, roll: Real, pitch: Real, yaw: Real) -> Iso3 {
    make_iso(UnitQuaternion::from_euler_angles(roll, pitch, yaw), t)
}

/// Project an arbitrary 3x3 matrix to the closest rotation (Frobenius norm).
pub fn project_to_so3(m: &Mat3) -> Quat {
    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Quat::identity();
    };
    let mut d = Mat3::identity();
    if (u * v_t).determinant() < 0.0 {
        d[(2, 2)] = -1.0;
    }
    let r = u * d * v_t;
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r))
}
