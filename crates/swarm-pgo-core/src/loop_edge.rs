use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{FrameId, Iso3, Mat6, Real};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LoopEdgeError {
    #[error("information matrix of loop {a} -> {b} is not positive definite")]
    NotPositiveDefinite { a: FrameId, b: FrameId },
    #[error("information matrix of loop {a} -> {b} contains non-finite values")]
    NonFinite { a: FrameId, b: FrameId },
}

/// Relative-pose constraint between two frames, possibly of different robots.
///
/// Information matrix order is position first, orientation second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopEdge {
    pub frame_id_a: FrameId,
    pub frame_id_b: FrameId,
    /// Pose of frame b expressed in frame a.
    pub relative_pose: Iso3,
    pub information: Mat6,
}

impl LoopEdge {
    pub fn new(frame_id_a: FrameId, frame_id_b: FrameId, relative_pose: Iso3) -> Self {
        Self {
            frame_id_a,
            frame_id_b,
            relative_pose,
            information: Mat6::identity(),
        }
    }

    pub fn with_information(mut self, information: Mat6) -> Self {
        self.information = information;
        self
    }

    /// Isotropic information from position and rotation standard deviations.
    pub fn with_std(self, sigma_pos: Real, sigma_rot: Real) -> Self {
        let mut info = Mat6::zeros();
        for i in 0..3 {
            info[(i, i)] = 1.0 / (sigma_pos * sigma_pos);
            info[(i + 3, i + 3)] = 1.0 / (sigma_rot * sigma_rot);
        }
        self.with_information(info)
    }

    pub fn translation_norm(&self) -> Real {
        self.relative_pose.translation.vector.norm()
    }

    /// Upper Cholesky factor `L^T` of the information matrix, so that
    /// `|L^T r|^2 = r^T * info * r`.
    pub fn sqrt_information(&self) -> Result<Mat6, LoopEdgeError> {
        let (a, b) = (self.frame_id_a, self.frame_id_b);
        if self.information.iter().any(|v| !v.is_finite()) {
            return Err(LoopEdgeError::NonFinite { a, b });
        }
        let sym = (self.information + self.information.transpose()) * 0.5;
        let chol = sym
            .cholesky()
            .ok_or(LoopEdgeError::NotPositiveDefinite { a, b })?;
        Ok(chol.l().transpose())
    }
}
