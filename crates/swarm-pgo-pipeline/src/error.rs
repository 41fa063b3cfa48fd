use swarm_pgo_core::{FrameId, LoopEdgeError, PoseStoreError};
use thiserror::Error;

/// Errors reported by [`PoseGraphEngine`](crate::PoseGraphEngine).
///
/// Every error leaves the pose store untouched.
#[derive(Debug, Error)]
pub enum PgoError {
    #[error(transparent)]
    PoseStore(#[from] PoseStoreError),
    #[error(transparent)]
    LoopEdge(#[from] LoopEdgeError),
    /// A loop edge names a frame the store does not know.
    #[error("loop edge references unknown frame {0}")]
    UnknownFrame(FrameId),
    #[error("distributed mode requires a consensus transport")]
    MissingTransport,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("solver failed: {0:#}")]
    Solver(#[from] anyhow::Error),
}
