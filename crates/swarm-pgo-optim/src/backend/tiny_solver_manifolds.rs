use std::num::NonZero;

use nalgebra as na;

use tiny_solver::manifold::{AutoDiffManifold, Manifold};

/// Position plus heading: R³ × SO(2).
///
/// State (ambient): 4 `[x, y, z, yaw]`
/// Tangent: 4
///
/// Position is Euclidean; yaw is kept in `(-pi, pi]` after every update, and
/// `minus` returns the shortest signed heading difference.
#[derive(Debug, Clone, Copy, Default)]
pub struct PosYawManifold;

impl PosYawManifold {
    #[inline]
    fn wrap<T: na::RealField>(a: T) -> T {
        a.clone().sin().atan2(a.cos())
    }
}

impl<T: na::RealField> AutoDiffManifold<T> for PosYawManifold {
    fn plus(&self, x: na::DVectorView<T>, delta: na::DVectorView<T>) -> na::DVector<T> {
        debug_assert_eq!(x.len(), 4);
        debug_assert_eq!(delta.len(), 4);

        na::dvector![
            x[0].clone() + delta[0].clone(),
            x[1].clone() + delta[1].clone(),
            x[2].clone() + delta[2].clone(),
            Self::wrap(x[3].clone() + delta[3].clone())
        ]
    }

    fn minus(&self, y: na::DVectorView<T>, x: na::DVectorView<T>) -> na::DVector<T> {
        debug_assert_eq!(y.len(), 4);
        debug_assert_eq!(x.len(), 4);

        na::dvector![
            y[0].clone() - x[0].clone(),
            y[1].clone() - x[1].clone(),
            y[2].clone() - x[2].clone(),
            Self::wrap(y[3].clone() - x[3].clone())
        ]
    }
}

impl Manifold for PosYawManifold {
    fn tangent_size(&self) -> NonZero<usize> {
        NonZero::new(4).unwrap()
    }
}
