use serde::{Deserialize, Serialize};

use crate::Iso3;

pub type FrameId = u64;
pub type DroneId = u32;

/// A (key)frame of one robot's trajectory.
///
/// `odom` is the pose reported by the front-end and never changes after
/// insertion. `pose` starts equal to `odom` and is the only field the
/// optimizer writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: FrameId,
    pub drone_id: DroneId,
    /// Timestamp in seconds.
    pub stamp: f64,
    #[serde(default = "default_keyframe")]
    pub is_keyframe: bool,
    pub odom: Iso3,
    pub pose: Iso3,
}

fn default_keyframe() -> bool {
    true
}

impl Frame {
    /// New keyframe whose optimized pose starts at the odometry pose.
    pub fn new(frame_id: FrameId, drone_id: DroneId, stamp: f64, odom: Iso3) -> Self {
        Self {
            frame_id,
            drone_id,
            stamp,
            is_keyframe: true,
            odom,
            pose: odom,
        }
    }

    pub fn non_keyframe(mut self) -> Self {
        self.is_keyframe = false;
        self
    }
}
