//! The pose-graph engine: frames and loops in, optimized poses out.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use swarm_pgo_core::{
    DroneId, Frame, FrameId, LoopEdge, PoseHandle, PoseStore, Quat, Trajectory, delta_pose,
    make_iso, with_yaw, yaw_of,
};
use swarm_pgo_optim::init::{RotationEdge, chordal_rotations};
use swarm_pgo_optim::solver::ConsensusTransport;
use swarm_pgo_optim::{PoseDof, SolveMode, SolveReport, SolveState, build_solver};

use crate::factors::build_factors;
use crate::gauge::{GaugeReport, anchor_frame, fix_gauge};
use crate::{OptimizationMode, PgoConfig, PgoError};

/// Summary of one [`PoseGraphEngine::solve`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgoReport {
    /// Frames touched by at least one residual, ascending.
    pub used_frames: Vec<FrameId>,
    pub anchor: Option<FrameId>,
    pub loop_factors: usize,
    pub ego_motion_factors: usize,
    /// Frames whose pose was written back.
    pub updated_frames: usize,
    pub solve: SolveReport,
}

#[derive(Debug, Default)]
struct GraphState {
    store: PoseStore,
    loops: Vec<LoopEdge>,
    /// Epoch of the last distributed solve.
    epoch: u64,
}

/// Thread-safe pose-graph optimizer for one robot or a whole swarm.
///
/// All mutations and solves are serialized by one lock; a solve holds it for
/// its whole duration.
pub struct PoseGraphEngine {
    config: PgoConfig,
    state: Mutex<GraphState>,
    transport: Option<Arc<dyn ConsensusTransport>>,
}

impl std::fmt::Debug for PoseGraphEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoseGraphEngine")
            .field("config", &self.config)
            .field("has_transport", &self.transport.is_some())
            .finish()
    }
}

impl PoseGraphEngine {
    pub fn new(config: PgoConfig) -> Result<Self, PgoError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(GraphState::default()),
            transport: None,
        })
    }

    /// Attach the transport used in distributed mode.
    pub fn with_transport(mut self, transport: Arc<dyn ConsensusTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn config(&self) -> &PgoConfig {
        &self.config
    }

    pub fn add_frame(&self, frame: Frame) -> Result<PoseHandle, PgoError> {
        Ok(self.state.lock().store.add_frame(frame)?)
    }

    /// Record a loop closure. Returns `false` if its relative translation
    /// exceeds the configured distance threshold and it was dropped.
    pub fn add_loop(&self, edge: LoopEdge) -> bool {
        let dist = edge.translation_norm();
        if !(dist <= self.config.loop_distance_threshold) {
            info!(
                "dropping loop {} -> {}: distance {dist:.3} m over threshold {:.3} m",
                edge.frame_id_a, edge.frame_id_b, self.config.loop_distance_threshold
            );
            return false;
        }
        self.state.lock().loops.push(edge);
        true
    }

    pub fn loop_count(&self) -> usize {
        self.state.lock().loops.len()
    }

    pub fn loops(&self) -> Vec<LoopEdge> {
        self.state.lock().loops.clone()
    }

    pub fn frame(&self, frame_id: FrameId) -> Option<Frame> {
        self.state.lock().store.frame(frame_id).cloned()
    }

    /// Time-ordered copy of a robot's frames.
    pub fn frames(&self, drone_id: DroneId) -> Vec<Frame> {
        self.state
            .lock()
            .store
            .trajectory(drone_id)
            .frames()
            .cloned()
            .collect()
    }

    pub fn available_drones(&self) -> Vec<DroneId> {
        self.state.lock().store.available_drones()
    }

    /// Run `f` on a robot's trajectory under the engine lock.
    pub fn with_trajectory<R>(&self, drone_id: DroneId, f: impl FnOnce(Trajectory<'_>) -> R) -> R {
        let state = self.state.lock();
        f(state.store.trajectory(drone_id))
    }

    /// Epoch of the last distributed solve; 0 before the first one.
    pub fn consensus_epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Resynchronize with the swarm: the next distributed solve runs as
    /// epoch `epoch + 1`. Peers only exchange updates within one epoch.
    pub fn set_consensus_epoch(&self, epoch: u64) {
        self.state.lock().epoch = epoch;
    }

    /// Copy of the whole pose store.
    pub fn snapshot(&self) -> PoseStore {
        self.state.lock().store.clone()
    }

    /// Build the factor graph, solve it and write the optimized poses back.
    ///
    /// On error nothing is written.
    pub fn solve(&self) -> Result<PgoReport, PgoError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let config = &self.config;

        let factors = build_factors(&state.store, &state.loops, config)?;
        let mode = match config.mode {
            OptimizationMode::Centralized => SolveMode::Centralized,
            OptimizationMode::Distributed => {
                let transport = self.transport.as_deref().ok_or(PgoError::MissingTransport)?;
                state.epoch += 1;
                SolveMode::Distributed {
                    self_id: config.self_id,
                    epoch: state.epoch,
                    transport,
                    options: config.consensus.clone(),
                }
            }
        };
        debug!("solve: {mode:?}, {:?}", config.pose_dof);

        let (gauge, outcome) = {
            let mut solver =
                build_solver(mode, &state.store, config.pose_dof, config.backend.clone());
            for info in factors.residuals {
                solver.add_residual(info)?;
            }
            let gauge = match solver.problem_mut() {
                Some(ir) => fix_gauge(ir, &state.store, &factors.used_frames, config),
                None => GaugeReport::default(),
            };
            (gauge, solver.solve()?)
        };

        let mut updated_frames = 0;
        if outcome.report.final_state == SolveState::Failed {
            warn!("solve did not converge; poses left unchanged");
        } else {
            for (frame_id, pose) in &outcome.poses {
                if let Some(handle) = state.store.pose_state(*frame_id) {
                    state.store.set_pose(handle, *pose);
                    updated_frames += 1;
                }
            }
        }

        info!(
            "solve: {} used frames, anchor {:?}, {} updated, {:?}",
            factors.used_frames.len(),
            gauge.anchor,
            updated_frames,
            outcome.report.final_state
        );
        Ok(PgoReport {
            used_frames: factors.used_frames.into_iter().collect(),
            anchor: gauge.anchor,
            loop_factors: factors.loop_factors,
            ego_motion_factors: factors.ego_motion_factors,
            updated_frames,
            solve: outcome.report,
        })
    }

    /// Re-estimate orientations by chordal relaxation over loops and
    /// consecutive keyframes. Positions are untouched; in four-DOF mode only
    /// the heading changes. Returns the number of frames updated.
    pub fn initialize_rotations(&self) -> Result<usize, PgoError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let config = &self.config;
        let store = &state.store;

        let mut edges = Vec::new();
        for edge in &state.loops {
            for id in [edge.frame_id_a, edge.frame_id_b] {
                if !store.contains(id) {
                    return Err(PgoError::UnknownFrame(id));
                }
            }
            edges.push(RotationEdge {
                from: edge.frame_id_a,
                to: edge.frame_id_b,
                rotation: edge.relative_pose.rotation,
            });
        }
        for drone in store.available_drones() {
            let keyframes: Vec<&Frame> = store.trajectory(drone).keyframes().collect();
            for pair in keyframes.windows(2) {
                edges.push(RotationEdge {
                    from: pair[0].frame_id,
                    to: pair[1].frame_id,
                    rotation: delta_pose(&pair[0].odom, &pair[1].odom).rotation,
                });
            }
        }

        let touched: BTreeSet<FrameId> = edges.iter().flat_map(|e| [e.from, e.to]).collect();
        let anchor = anchor_frame(store, config)
            .or_else(|| store.head_id(config.self_id))
            .filter(|id| touched.contains(id));
        let Some(anchor) = anchor else {
            debug!("rotation init: no anchor frame among {} constrained frames", touched.len());
            return Ok(0);
        };

        let initial: BTreeMap<FrameId, Quat> = touched
            .iter()
            .filter_map(|id| store.frame(*id).map(|f| (*id, f.pose.rotation)))
            .collect();
        let rotations = chordal_rotations(&initial, &edges, anchor)?;

        let mut updated = 0;
        for (frame_id, rot) in rotations {
            if frame_id == anchor {
                continue;
            }
            let Some(handle) = state.store.pose_state(frame_id) else {
                continue;
            };
            let frame = state.store.frame_at(handle);
            if config.mode == OptimizationMode::Distributed && frame.drone_id != config.self_id {
                continue;
            }
            let current = frame.pose;
            let rotation = match config.pose_dof {
                PoseDof::FourDof => with_yaw(&current.rotation, yaw_of(&rot)),
                PoseDof::SixDof => rot,
            };
            state
                .store
                .set_pose(handle, make_iso(rotation, current.translation.vector));
            updated += 1;
        }
        info!("rotation init: {updated} frames re-oriented, anchor {anchor}");
        Ok(updated)
    }
}
