//! Message exchange between consensus participants.

use std::time::Duration;

use anyhow::{Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::debug;
use serde::{Deserialize, Serialize};
use swarm_pgo_core::{DroneId, FrameId};

/// Estimate of one shared frame, packed in the sender's pose parameterization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedPose {
    pub frame_id: FrameId,
    pub param: Vec<f64>,
}

/// What a robot publishes at the end of a consensus round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusUpdate {
    pub drone_id: DroneId,
    /// Solve this update belongs to. Receivers drop updates of other epochs.
    pub epoch: u64,
    pub round: usize,
    /// Sender's local change and shared-frame disagreement are below tolerance.
    pub converged: bool,
    /// Sender has left the solve; `poses` are its final messages.
    #[serde(default)]
    pub finished: bool,
    pub poses: Vec<SharedPose>,
}

/// Delivery of [`ConsensusUpdate`]s between robots.
///
/// Implementations own serialization and addressing. `recv_timeout` returns
/// `Ok(None)` when nothing arrived in time; errors mean the link is gone.
pub trait ConsensusTransport: Send + Sync {
    fn broadcast(&self, update: &ConsensusUpdate) -> Result<()>;
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<ConsensusUpdate>>;
}

/// In-process transport over crossbeam channels.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    drone_id: DroneId,
    peers: Vec<(DroneId, Sender<ConsensusUpdate>)>,
    inbox: Receiver<ConsensusUpdate>,
    // Held so the inbox never reports disconnection while this endpoint lives.
    inbox_tx: Sender<ConsensusUpdate>,
}

impl ChannelTransport {
    /// Endpoint with no peers.
    pub fn isolated(drone_id: DroneId) -> Self {
        let (inbox_tx, inbox) = crossbeam_channel::unbounded();
        Self {
            drone_id,
            peers: Vec::new(),
            inbox,
            inbox_tx,
        }
    }

    /// Fully connected endpoints, one per id, in the order given.
    pub fn mesh(ids: &[DroneId]) -> Vec<Self> {
        let mut nodes: Vec<Self> = ids.iter().map(|id| Self::isolated(*id)).collect();
        let senders: Vec<(DroneId, Sender<ConsensusUpdate>)> = nodes
            .iter()
            .map(|n| (n.drone_id, n.inbox_tx.clone()))
            .collect();
        for node in &mut nodes {
            node.peers = senders
                .iter()
                .filter(|(id, _)| *id != node.drone_id)
                .cloned()
                .collect();
        }
        nodes
    }

    pub fn drone_id(&self) -> DroneId {
        self.drone_id
    }

    /// Sender into this endpoint's inbox, e.g. for injecting updates.
    pub fn sender(&self) -> Sender<ConsensusUpdate> {
        self.inbox_tx.clone()
    }
}

impl ConsensusTransport for ChannelTransport {
    fn broadcast(&self, update: &ConsensusUpdate) -> Result<()> {
        for (peer, tx) in &self.peers {
            tx.send(update.clone())
                .map_err(|_| anyhow!("peer {peer} hung up"))?;
        }
        debug!(
            "drone {}: broadcast epoch {} round {} ({} poses) to {} peers",
            self.drone_id,
            update.epoch,
            update.round,
            update.poses.len(),
            self.peers.len()
        );
        Ok(())
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<ConsensusUpdate>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(update) => Ok(Some(update)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("inbox of drone {} disconnected", self.drone_id))
            }
        }
    }
}
