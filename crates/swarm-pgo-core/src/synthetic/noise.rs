//! Deterministic noise helpers for synthetic pose graphs.
//!
//! The functions here avoid `thread_rng` and any RNG crate internals, so
//! synthetic trajectories are stable across versions and platforms.

use crate::{Iso3, Real, Vec3, make_iso};
use nalgebra::UnitQuaternion;

/// Deterministic uniform pose noise: each position axis in
/// `[-max_abs_pos, +max_abs_pos]`, each rotation axis in
/// `[-max_abs_rot, +max_abs_rot]` radians.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UniformPoseNoise {
    /// Base seed controlling the pseudo-random sequence.
    pub seed: u64,
    pub max_abs_pos: Real,
    pub max_abs_rot: Real,
}

impl UniformPoseNoise {
    /// Sample a `(translation, rotation vector)` pair for a `(stream, index)` key.
    pub fn sample(&self, stream: usize, index: usize) -> (Vec3, Vec3) {
        let key = mix_key(self.seed, stream, index);
        let t = unit_vec(key, self.max_abs_pos.abs());
        let r = unit_vec(key ^ 0xD6E8_FEB8_6659_FD93, self.max_abs_rot.abs());
        (t, r)
    }

    /// Right-perturb a pose: `pose * exp(noise)`.
    pub fn apply(&self, stream: usize, index: usize, pose: &Iso3) -> Iso3 {
        let (t, r) = self.sample(stream, index);
        pose * make_iso(UnitQuaternion::from_scaled_axis(r), t)
    }
}

fn unit_vec(key: u64, max_abs: Real) -> Vec3 {
    if max_abs == 0.0 {
        return Vec3::zeros();
    }
    let mut out = Vec3::zeros();
    for (i, salt) in [0u64, 0x94D0_49BB_1331_11EB, 0xBF58_476D_1CE4_E5B9]
        .into_iter()
        .enumerate()
    {
        let u = u64_to_unit_f64(splitmix64(key ^ salt));
        // Map [0, 1) -> [-max_abs, +max_abs].
        out[i] = (u - 0.5) * 2.0 * max_abs;
    }
    out
}

#[inline]
fn mix_key(seed: u64, stream: usize, index: usize) -> u64 {
    seed ^ (stream as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[inline]
fn u64_to_unit_f64(x: u64) -> Real {
    // Top 53 bits -> [0, 1).
    let mantissa = x >> 11;
    (mantissa as Real) * (1.0 / ((1u64 << 53) as Real))
}
