//! Distributed consensus solve.
//!
//! Scaled consensus ADMM over the shared frames. For every shared frame a
//! robot keeps a consensus estimate `z` and a scaled dual `u`. One round
//! solves the local subgraph with priors pulling shared frames toward
//! `z - u`, publishes `x + u`, averages its own and its peers' messages into
//! the next `z` and accumulates the disagreement `x - z` into `u`. Rounds
//! follow `BuildLocal -> LocalSolve -> Sync` until every participant reports
//! a small local change and agreement on the shared frames, or `max_steps`
//! rounds have run. A robot leaving the solve says so in a last update; its
//! peers keep using that update instead of waiting for it.
//!
//! A residual touching frames of several robots is held by each of them.
//! It enters every local problem scaled by `1 / sqrt(owners)`, so the local
//! objectives sum to the centralized one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, ensure};
use log::{debug, info, trace, warn};
use nalgebra::{DVector, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use swarm_pgo_core::{DroneId, FrameId, PoseStore, wrap_angle};

use crate::backend::{BackendSolveOptions, OptimBackend, TinySolverBackend};
use crate::ir::{FactorKind, ProblemIR, RobustLoss};
use crate::params::{PoseDof, param_name};
use crate::solver::graph::GraphBuilder;
use crate::solver::{
    ConsensusTransport, ConsensusUpdate, PoseGraphSolver, ResidualInfo, SharedPose, SolveReport,
    SolveState, SolverOutcome,
};

/// How a fresh local estimate enters the consensus update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsensusMerge {
    /// The local estimate is used as is.
    #[default]
    Overwrite,
    /// Move from the consensus estimate toward the local one by `weight` in
    /// `(0, 1]`. Smaller weights damp oscillation between robots.
    Blend { weight: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusOptions {
    /// LM iterations per local solve.
    pub local_substeps: usize,
    pub max_steps: usize,
    /// Seconds to wait for peer updates each round.
    pub timeout_wait_sync: f64,
    /// Bound on the tangent-space change of own frames, the disagreement
    /// with the consensus estimate and the penalty-weighted consensus step.
    pub convergence_tolerance: f64,
    /// Penalty on position disagreement (1/m^2).
    pub rho_position: f64,
    /// Penalty on rotation disagreement (1/rad^2).
    pub rho_rotation: f64,
    pub merge: ConsensusMerge,
}

impl Default for ConsensusOptions {
    fn default() -> Self {
        Self {
            local_substeps: 4,
            max_steps: 100,
            timeout_wait_sync: 0.1,
            convergence_tolerance: 1e-4,
            rho_position: 30.0,
            rho_rotation: 1000.0,
            merge: ConsensusMerge::default(),
        }
    }
}

impl ConsensusOptions {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.local_substeps > 0, "local_substeps must be positive");
        ensure!(self.max_steps > 0, "max_steps must be positive");
        ensure!(
            self.timeout_wait_sync.is_finite() && self.timeout_wait_sync >= 0.0,
            "timeout_wait_sync must be a non-negative number of seconds"
        );
        ensure!(
            self.convergence_tolerance > 0.0,
            "convergence_tolerance must be positive"
        );
        ensure!(
            self.rho_position > 0.0 && self.rho_rotation > 0.0,
            "consensus weights must be positive"
        );
        if let ConsensusMerge::Blend { weight } = self.merge {
            ensure!(
                weight > 0.0 && weight <= 1.0,
                "blend weight must lie in (0, 1], got {weight}"
            );
        }
        Ok(())
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_wait_sync)
    }
}

fn quat_of(v: &DVector<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(v[3], v[0], v[1], v[2]))
}

/// Move a packed pose by a tangent step.
///
/// Four-DOF steps are `[dx, dy, dz, dyaw]`; six-DOF steps are
/// `[dt; dr]` with the rotation applied on the right.
pub(crate) fn retract(dof: PoseDof, x: &DVector<f64>, delta: &DVector<f64>) -> DVector<f64> {
    match dof {
        PoseDof::FourDof => {
            let mut out = x + delta;
            out[3] = wrap_angle(out[3]);
            out
        }
        PoseDof::SixDof => {
            let dr = Vector3::new(delta[3], delta[4], delta[5]);
            let q = quat_of(x) * UnitQuaternion::from_scaled_axis(dr);
            DVector::from_column_slice(&[
                q.i,
                q.j,
                q.k,
                q.w,
                x[4] + delta[0],
                x[5] + delta[1],
                x[6] + delta[2],
            ])
        }
    }
}

/// Tangent step from `a` to `b`, the inverse of [`retract`].
pub(crate) fn local(dof: PoseDof, a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
    match dof {
        PoseDof::FourDof => {
            let mut out = b - a;
            out[3] = wrap_angle(out[3]);
            out
        }
        PoseDof::SixDof => {
            let dr = (quat_of(a).inverse() * quat_of(b)).scaled_axis();
            DVector::from_column_slice(&[
                b[4] - a[4],
                b[5] - a[5],
                b[6] - a[6],
                dr.x,
                dr.y,
                dr.z,
            ])
        }
    }
}

fn tangent_dim(dof: PoseDof) -> usize {
    match dof {
        PoseDof::FourDof => 4,
        PoseDof::SixDof => 6,
    }
}

/// Relaxed local estimate of a shared frame, both packed in `dof` layout.
pub(crate) fn merge_param(
    dof: PoseDof,
    merge: ConsensusMerge,
    consensus: &DVector<f64>,
    estimate: &DVector<f64>,
) -> DVector<f64> {
    match merge {
        ConsensusMerge::Overwrite => estimate.clone(),
        ConsensusMerge::Blend { weight } => {
            retract(dof, consensus, &(local(dof, consensus, estimate) * weight))
        }
    }
}

/// Tangent-space mean of packed poses, linearized at the first one.
pub(crate) fn average(dof: PoseDof, poses: &[&DVector<f64>]) -> Option<DVector<f64>> {
    let (first, rest) = poses.split_first()?;
    let mut sum = DVector::zeros(tangent_dim(dof));
    for p in rest {
        sum += local(dof, first, p);
    }
    Some(retract(dof, first, &(sum / poses.len() as f64)))
}

/// Sort a same-epoch peer update into this round's set, the buffer of later
/// rounds or the record of finished peers.
fn file_update(
    round: usize,
    update: ConsensusUpdate,
    received: &mut BTreeMap<DroneId, ConsensusUpdate>,
    early: &mut Vec<ConsensusUpdate>,
    finished: &mut BTreeMap<DroneId, ConsensusUpdate>,
) {
    if update.round > round {
        early.push(update);
    } else if update.finished {
        finished.insert(update.drone_id, update.clone());
        received.insert(update.drone_id, update);
    } else if update.round == round {
        received.insert(update.drone_id, update);
    } else {
        trace!(
            "dropping round {} update from drone {} in round {round}",
            update.round, update.drone_id
        );
    }
}

/// Consensus estimate and scaled dual of one shared frame.
#[derive(Debug, Clone)]
struct SharedFrame {
    z: DVector<f64>,
    u: DVector<f64>,
}

/// Participant in a distributed consensus solve.
pub struct ConsensusSolver<'a> {
    graph: GraphBuilder<'a>,
    self_id: DroneId,
    epoch: u64,
    transport: &'a dyn ConsensusTransport,
    opts: ConsensusOptions,
    backend_opts: BackendSolveOptions,
}

impl std::fmt::Debug for ConsensusSolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusSolver")
            .field("self_id", &self.self_id)
            .field("epoch", &self.epoch)
            .field("opts", &self.opts)
            .field("residuals", &self.graph.ir.residuals.len())
            .finish()
    }
}

impl<'a> ConsensusSolver<'a> {
    pub fn new(
        store: &'a PoseStore,
        dof: PoseDof,
        self_id: DroneId,
        transport: &'a dyn ConsensusTransport,
        opts: ConsensusOptions,
        backend_opts: BackendSolveOptions,
    ) -> Self {
        Self {
            graph: GraphBuilder::new(store, dof),
            self_id,
            epoch: 0,
            transport,
            opts,
            backend_opts,
        }
    }

    /// Tag this solve's updates with `epoch`.
    ///
    /// Every participant of one solve must use the same epoch; updates from
    /// other epochs are discarded.
    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    fn owner(&self, frame_id: FrameId) -> Option<DroneId> {
        self.graph.store.frame(frame_id).map(|f| f.drone_id)
    }

    fn owns(&self, frame_id: FrameId) -> bool {
        self.owner(frame_id) == Some(self.self_id)
    }

    /// Remote frames, and own frames sharing a residual with a remote frame.
    fn shared_frames(&self) -> BTreeSet<FrameId> {
        let mut shared = BTreeSet::new();
        for frames in &self.graph.residual_frames {
            if frames.iter().all(|f| self.owns(*f)) {
                continue;
            }
            shared.extend(frames.iter().copied());
        }
        shared
    }

    /// Robots owning a frame of the local problem, other than this one.
    fn peers(&self) -> BTreeSet<DroneId> {
        self.graph
            .frames
            .keys()
            .filter_map(|f| self.owner(*f))
            .filter(|d| *d != self.self_id)
            .collect()
    }

    fn local_problem(&self, targets: &BTreeMap<FrameId, DVector<f64>>) -> ProblemIR {
        let mut ir = self.graph.ir.clone();
        let w_pos = self.opts.rho_position.sqrt();
        let w_rot = self.opts.rho_rotation.sqrt();
        for (&frame_id, z) in targets {
            if self.graph.is_constant(frame_id) {
                continue;
            }
            let Some(id) = self.graph.frames.get(&frame_id) else {
                continue;
            };
            let factor = match self.graph.dof {
                PoseDof::FourDof => FactorKind::ConsensusPrior4D {
                    target: [z[0], z[1], z[2], z[3]],
                    w_pos,
                    w_rot,
                },
                PoseDof::SixDof => {
                    let mut target = [0.0; 7];
                    target.copy_from_slice(z.as_slice());
                    FactorKind::ConsensusPrior6D {
                        target_se3: target,
                        w_pos,
                        w_rot,
                    }
                }
            };
            ir.add_factor(vec![*id], factor, RobustLoss::None);
        }
        ir
    }

    /// Largest tangent-space change of an own, non-constant frame.
    fn local_change(
        &self,
        before: &HashMap<String, DVector<f64>>,
        after: &HashMap<String, DVector<f64>>,
    ) -> f64 {
        let mut change: f64 = 0.0;
        for &frame_id in self.graph.frames.keys() {
            if !self.owns(frame_id) || self.graph.is_constant(frame_id) {
                continue;
            }
            let name = param_name(frame_id);
            if let (Some(b), Some(a)) = (before.get(&name), after.get(&name)) {
                change = change.max(local(self.graph.dof, b, a).norm());
            }
        }
        change
    }

    /// Tangent step with position and rotation parts scaled by their penalties.
    fn weighted_step(&self, step: &DVector<f64>) -> f64 {
        let pos = step.rows(0, 3).norm() * self.opts.rho_position;
        let rot = step.rows(3, step.len() - 3).norm() * self.opts.rho_rotation;
        pos.hypot(rot)
    }

    /// Collect this round's update from every peer.
    ///
    /// Updates of another epoch or an earlier round are dropped; updates of
    /// later rounds are kept in `early` for the round they belong to. Peers
    /// that announced they finished count with their final update from then
    /// on. The flag is `false` if the deadline passed with peers missing.
    fn sync(
        &self,
        round: usize,
        peers: &BTreeSet<DroneId>,
        early: &mut Vec<ConsensusUpdate>,
        finished: &mut BTreeMap<DroneId, ConsensusUpdate>,
    ) -> (BTreeMap<DroneId, ConsensusUpdate>, bool) {
        let mut received = finished.clone();
        for update in std::mem::take(early) {
            file_update(round, update, &mut received, early, finished);
        }

        let deadline = Instant::now() + self.opts.sync_timeout();
        while received.len() < peers.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return (received, false);
            }
            let update = match self.transport.recv_timeout(remaining) {
                Ok(Some(update)) => update,
                Ok(None) => return (received, false),
                Err(err) => {
                    warn!("drone {}: receive failed: {err:#}", self.self_id);
                    return (received, false);
                }
            };
            if !peers.contains(&update.drone_id) {
                debug!(
                    "drone {}: ignoring update from unrelated drone {}",
                    self.self_id, update.drone_id
                );
            } else if update.epoch != self.epoch {
                debug!(
                    "drone {}: dropping epoch {} update from drone {} (current epoch {})",
                    self.self_id, update.epoch, update.drone_id, self.epoch
                );
            } else {
                file_update(round, update, &mut received, early, finished);
            }
        }
        (received, true)
    }

    /// Packed estimates of `frame_id` sent by peers this round.
    fn received_params(
        &self,
        frame_id: FrameId,
        updates: &BTreeMap<DroneId, ConsensusUpdate>,
    ) -> Vec<DVector<f64>> {
        let dim = self.graph.dof.param_dim();
        let mut out = Vec::new();
        for update in updates.values() {
            for pose in update.poses.iter().filter(|p| p.frame_id == frame_id) {
                if pose.param.len() != dim {
                    warn!(
                        "drone {}: frame {} from drone {} has {} params, expected {dim}",
                        self.self_id,
                        frame_id,
                        update.drone_id,
                        pose.param.len()
                    );
                    continue;
                }
                out.push(DVector::from_column_slice(&pose.param));
            }
        }
        out
    }
}

impl PoseGraphSolver for ConsensusSolver<'_> {
    /// Residuals touching none of this robot's frames are skipped; residuals
    /// spanning several robots are down-weighted by `1 / sqrt(owners)`.
    fn add_residual(&mut self, info: ResidualInfo) -> Result<()> {
        let mut owners = BTreeSet::new();
        for &frame_id in &info.frames {
            let owner = self
                .owner(frame_id)
                .ok_or_else(|| anyhow!("residual references unknown frame {frame_id}"))?;
            owners.insert(owner);
        }
        if !owners.contains(&self.self_id) {
            trace!(
                "drone {}: skipping residual over {:?} held by {:?}",
                self.self_id, info.frames, owners
            );
            return Ok(());
        }
        if owners.len() == 1 {
            return self.graph.add_residual(info);
        }
        let c = (owners.len() as f64).sqrt().recip();
        self.graph.add_residual(ResidualInfo {
            frames: info.frames,
            factor: info.factor.scaled(c),
            loss: info.loss.scaled(c),
        })
    }

    fn problem_mut(&mut self) -> Option<&mut ProblemIR> {
        Some(&mut self.graph.ir)
    }

    fn solve(&mut self) -> Result<SolverOutcome> {
        self.opts.validate()?;
        if self.graph.ir.residuals.is_empty() {
            debug!("drone {}: no local residuals", self.self_id);
            return Ok(SolverOutcome {
                poses: Default::default(),
                report: SolveReport::trivial(),
            });
        }

        let dof = self.graph.dof;
        let tol = self.opts.convergence_tolerance;
        let peers = self.peers();
        let mut shared: BTreeMap<FrameId, SharedFrame> = self
            .shared_frames()
            .into_iter()
            .map(|f| {
                let frame = SharedFrame {
                    z: self.graph.initial[&param_name(f)].clone(),
                    u: DVector::zeros(tangent_dim(dof)),
                };
                (f, frame)
            })
            .collect();
        debug!(
            "drone {}: epoch {}, {} shared frames, peers {:?}",
            self.self_id,
            self.epoch,
            shared.len(),
            peers
        );

        let local_opts = BackendSolveOptions {
            max_iters: self.opts.local_substeps,
            ..self.backend_opts.clone()
        };

        let mut current = self.graph.initial.clone();
        let mut early = Vec::new();
        let mut finished = BTreeMap::new();
        let mut last_update: Option<ConsensusUpdate> = None;
        // No consensus step has been taken before the first round.
        let mut dual_residual = f64::INFINITY;
        let mut state = SolveState::BuildLocal;
        let mut report = SolveReport {
            initial_cost: 0.0,
            final_cost: 0.0,
            converged: false,
            rounds: 0,
            sync_timeouts: 0,
            final_state: state,
        };

        for round in 0..self.opts.max_steps {
            state = SolveState::BuildLocal;
            trace!("drone {}: round {round} {state:?}", self.self_id);
            let targets: BTreeMap<FrameId, DVector<f64>> = shared
                .iter()
                .map(|(f, s)| (*f, retract(dof, &s.z, &(-s.u.clone()))))
                .collect();
            let ir = self.local_problem(&targets);

            state = SolveState::LocalSolve;
            trace!("drone {}: round {round} {state:?}", self.self_id);
            let change = if self.graph.has_free_blocks() {
                let solution = TinySolverBackend.solve(&ir, &current, &local_opts)?;
                if round == 0 {
                    report.initial_cost = solution.initial_cost;
                }
                report.final_cost = solution.final_cost;
                if solution.converged {
                    let change = self.local_change(&current, &solution.params);
                    current = solution.params;
                    change
                } else {
                    // Keep the previous estimate; a failed round never counts as converged.
                    f64::INFINITY
                }
            } else {
                0.0
            };
            report.rounds = round + 1;

            let mut relaxed = BTreeMap::new();
            let mut disagreement: f64 = 0.0;
            for (&frame_id, s) in &shared {
                let x = &current[&param_name(frame_id)];
                let x_hat = merge_param(dof, self.opts.merge, &s.z, x);
                disagreement = disagreement.max(local(dof, &s.z, &x_hat).norm());
                relaxed.insert(frame_id, x_hat);
            }
            let local_converged = change < tol && disagreement < tol && dual_residual < tol;

            state = SolveState::Sync;
            trace!("drone {}: round {round} {state:?}", self.self_id);
            let own: BTreeMap<FrameId, DVector<f64>> = relaxed
                .iter()
                .map(|(f, x_hat)| (*f, retract(dof, x_hat, &shared[f].u)))
                .collect();
            let update = ConsensusUpdate {
                drone_id: self.self_id,
                epoch: self.epoch,
                round,
                converged: local_converged,
                finished: false,
                poses: own
                    .iter()
                    .map(|(f, m)| SharedPose {
                        frame_id: *f,
                        param: m.iter().copied().collect(),
                    })
                    .collect(),
            };
            if let Err(err) = self.transport.broadcast(&update) {
                warn!("drone {}: broadcast failed: {err:#}", self.self_id);
            }
            last_update = Some(update);
            let (received, complete) = self.sync(round, &peers, &mut early, &mut finished);
            if !complete {
                report.sync_timeouts += 1;
                warn!(
                    "drone {}: sync timeout in round {round} ({} of {} peers, {} total timeouts)",
                    self.self_id,
                    received.len(),
                    peers.len(),
                    report.sync_timeouts
                );
            }
            let peers_converged = complete && received.values().all(|u| u.converged);

            debug!(
                "drone {}: round {round} change {change:.3e}, disagreement {disagreement:.3e}, \
                 dual {dual_residual:.3e}, peers converged {peers_converged}",
                self.self_id
            );
            if local_converged && peers_converged {
                state = SolveState::Converged;
                break;
            }

            dual_residual = 0.0;
            for (&frame_id, s) in shared.iter_mut() {
                let mut messages = self.received_params(frame_id, &received);
                messages.insert(0, own[&frame_id].clone());
                let refs: Vec<&DVector<f64>> = messages.iter().collect();
                let Some(z) = average(dof, &refs) else {
                    continue;
                };
                dual_residual = dual_residual.max(self.weighted_step(&local(dof, &s.z, &z)));
                s.u += local(dof, &z, &relaxed[&frame_id]);
                s.z = z;
            }
        }
        if state != SolveState::Converged {
            state = SolveState::TimedOut;
        }
        if let Some(update) = last_update {
            let farewell = ConsensusUpdate {
                round: update.round + 1,
                finished: true,
                ..update
            };
            if let Err(err) = self.transport.broadcast(&farewell) {
                warn!("drone {}: broadcast failed: {err:#}", self.self_id);
            }
        }

        report.converged = state == SolveState::Converged;
        report.final_state = state;
        info!(
            "drone {}: consensus {:?} after {} rounds ({} sync timeouts), cost {:.6e} -> {:.6e}",
            self.self_id,
            state,
            report.rounds,
            report.sync_timeouts,
            report.initial_cost,
            report.final_cost
        );

        let poses = self.graph.collect_poses(&current, |f| self.owns(f))?;
        Ok(SolverOutcome { poses, report })
    }
}
