//! Synthetic trajectories and loop closures for tests and benchmarks.

mod noise;

pub use noise::UniformPoseNoise;

use crate::{DroneId, Frame, FrameId, Iso3, LoopEdge, Real, Vec3, delta_pose, iso_from_xyz_rpy};

/// Ground truth and odometry of one synthetic robot.
#[derive(Debug, Clone)]
pub struct SyntheticTrajectory {
    pub drone_id: DroneId,
    pub ground_truth: Vec<Iso3>,
    /// Frames whose odometry accumulates the configured drift.
    pub frames: Vec<Frame>,
}

/// Poses evenly spaced along a straight line.
pub fn straight_line(start: Vec3, step: Vec3, yaw: Real, count: usize) -> Vec<Iso3> {
    (0..count)
        .map(|i| iso_from_xyz_rpy(start + step * i as Real, 0.0, 0.0, yaw))
        .collect()
}

/// Poses on a horizontal circle, heading tangent to the circle.
pub fn circle(center: Vec3, radius: Real, count: usize) -> Vec<Iso3> {
    let n = count.max(1) as Real;
    (0..count)
        .map(|i| {
            let theta = std::f64::consts::TAU * i as Real / n;
            let p = center + Vec3::new(radius * theta.cos(), radius * theta.sin(), 0.0);
            iso_from_xyz_rpy(p, 0.0, 0.0, theta + std::f64::consts::FRAC_PI_2)
        })
        .collect()
}

/// Build frames whose odometry chains noisy relative motions of `ground_truth`.
///
/// Frame ids are `first_id..first_id + n`, stamps `0, dt, 2 dt, ...`.
/// The first odometry pose equals the first ground-truth pose.
pub fn drifting_trajectory(
    drone_id: DroneId,
    first_id: FrameId,
    ground_truth: Vec<Iso3>,
    dt: Real,
    noise: &UniformPoseNoise,
) -> SyntheticTrajectory {
    let mut frames = Vec::with_capacity(ground_truth.len());
    let mut odom = ground_truth.first().copied().unwrap_or_else(Iso3::identity);
    for (i, gt) in ground_truth.iter().enumerate() {
        if i > 0 {
            let step = delta_pose(&ground_truth[i - 1], gt);
            odom *= noise.apply(drone_id as usize, i, &step);
        }
        frames.push(Frame::new(first_id + i as FrameId, drone_id, i as Real * dt, odom));
    }
    SyntheticTrajectory {
        drone_id,
        ground_truth,
        frames,
    }
}

/// Exact loop closure between two ground-truth poses.
pub fn exact_loop(a: (FrameId, &Iso3), b: (FrameId, &Iso3)) -> LoopEdge {
    LoopEdge::new(a.0, b.0, delta_pose(a.1, b.1))
}
