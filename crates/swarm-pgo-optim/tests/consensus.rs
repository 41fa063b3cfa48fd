//! Distributed consensus between in-process robots.

use std::collections::BTreeMap;
use std::thread;

use nalgebra::Vector3;
use swarm_pgo_core::{
    DroneId, Frame, FrameId, Iso3, PoseStore, delta_pose, iso_from_xyz_rpy, tilt_of, yaw_of,
};
use swarm_pgo_optim::ir::{FactorKind, ManifoldKind, RobustLoss};
use swarm_pgo_optim::params::param_name;
use swarm_pgo_optim::solver::{
    CentralizedSolver, ChannelTransport, ConsensusMerge, ConsensusOptions, ConsensusSolver,
    ConsensusTransport,
};
use swarm_pgo_optim::{
    BackendSolveOptions, PoseDof, PoseGraphSolver, ResidualInfo, SolveState, SolverOutcome,
};

const WEIGHT: f64 = 10.0;

fn rel_4d(a: &Iso3, b: &Iso3) -> FactorKind {
    let rel = delta_pose(a, b);
    let dp = tilt_of(&a.rotation) * rel.translation.vector;
    let mut sqrt_info_pos = [0.0; 9];
    sqrt_info_pos[0] = WEIGHT;
    sqrt_info_pos[4] = WEIGHT;
    sqrt_info_pos[8] = WEIGHT;
    FactorKind::RelPose4D {
        delta_pos: [dp.x, dp.y, dp.z],
        delta_yaw: yaw_of(&b.rotation) - yaw_of(&a.rotation),
        sqrt_info_pos,
        sqrt_info_yaw: WEIGHT,
    }
}

struct Scenario {
    truth: BTreeMap<FrameId, Iso3>,
    store: PoseStore,
}

/// Drone 1 flies along y = 0, drone 2 along y = 2. Drone 2's odometry starts
/// offset from the truth; drone 1's starts exact. Drone 3 has frames in the
/// store but no residual touches them.
fn scenario() -> Scenario {
    let mut truth = BTreeMap::new();
    let mut store = PoseStore::new();
    let offset = iso_from_xyz_rpy(Vector3::new(0.4, -0.3, 0.1), 0.0, 0.0, 0.15);
    for (drone, base_id, y) in [(1 as DroneId, 10, 0.0), (2, 20, 2.0), (3, 30, 5.0)] {
        for i in 0..3u64 {
            let gt = iso_from_xyz_rpy(Vector3::new(i as f64, y, 0.0), 0.0, 0.0, 0.0);
            let odom = if drone == 2 { offset * gt } else { gt };
            truth.insert(base_id + i, gt);
            store
                .add_frame(Frame::new(base_id + i, drone, i as f64, odom))
                .unwrap();
        }
    }
    Scenario { truth, store }
}

/// The whole graph: both odometry chains and two inter-robot loops.
fn residuals(s: &Scenario) -> Vec<ResidualInfo> {
    let mut out = Vec::new();
    for base in [10, 20] {
        for i in 0..2 {
            let (a, b) = (base + i, base + i + 1);
            out.push(ResidualInfo {
                frames: vec![a, b],
                factor: rel_4d(&s.truth[&a], &s.truth[&b]),
                loss: RobustLoss::None,
            });
        }
    }
    for (a, b) in [(11, 21), (12, 22)] {
        out.push(ResidualInfo {
            frames: vec![a, b],
            factor: rel_4d(&s.truth[&a], &s.truth[&b]),
            loss: RobustLoss::Huber { scale: 1.0 },
        });
    }
    out
}

fn parameterize(solver: &mut dyn PoseGraphSolver) {
    let ir = solver.problem_mut().unwrap();
    for p in ir.params.clone() {
        ir.set_manifold(p.id, ManifoldKind::PosYaw);
    }
    if let Some(head) = ir.param_by_name(&param_name(10)) {
        ir.fix_all(head);
    }
}

/// Every robot is handed the whole graph and keeps the residuals it holds.
fn prepare<'a>(
    s: &'a Scenario,
    drone: DroneId,
    transport: &'a dyn ConsensusTransport,
    opts: ConsensusOptions,
) -> ConsensusSolver<'a> {
    let mut solver = ConsensusSolver::new(
        &s.store,
        PoseDof::FourDof,
        drone,
        transport,
        opts,
        Default::default(),
    );
    for info in residuals(s) {
        solver.add_residual(info).unwrap();
    }
    parameterize(&mut solver);
    solver
}

fn centralized(s: &Scenario) -> SolverOutcome {
    let opts = BackendSolveOptions {
        min_abs_decrease: Some(1e-20),
        min_rel_decrease: Some(1e-20),
        min_error: Some(1e-24),
        ..Default::default()
    };
    let mut solver = CentralizedSolver::new(&s.store, PoseDof::FourDof, opts);
    for info in residuals(s) {
        solver.add_residual(info).unwrap();
    }
    parameterize(&mut solver);
    solver.solve().unwrap()
}

fn precise() -> ConsensusOptions {
    ConsensusOptions {
        max_steps: 2000,
        timeout_wait_sync: 2.0,
        convergence_tolerance: 1e-6,
        rho_position: 10.0,
        rho_rotation: 10.0,
        merge: ConsensusMerge::Overwrite,
        ..Default::default()
    }
}

/// Run one solve per robot in lockstep, in the order of `transports`.
fn run_swarm(
    s: &Scenario,
    transports: &[ChannelTransport],
    opts: &ConsensusOptions,
    epoch: u64,
) -> Vec<SolverOutcome> {
    thread::scope(|scope| {
        let handles: Vec<_> = transports
            .iter()
            .map(|t| {
                let opts = opts.clone();
                scope.spawn(move || {
                    prepare(s, t.drone_id(), t, opts)
                        .with_epoch(epoch)
                        .solve()
                        .unwrap()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    })
}

fn assert_matches(outcome: &SolverOutcome, reference: &SolverOutcome, tol: f64) {
    for (id, pose) in &outcome.poses {
        let expected = &reference.poses[id];
        let err = (pose.translation.vector - expected.translation.vector).norm();
        let yaw_err = (yaw_of(&pose.rotation) - yaw_of(&expected.rotation)).abs();
        assert!(err < tol, "frame {id} off by {err}");
        assert!(yaw_err < tol, "frame {id} heading off by {yaw_err}");
    }
}

#[test]
fn centralized_reference_recovers_truth() {
    let s = scenario();
    let reference = centralized(&s);
    assert!(reference.report.converged);
    assert_eq!(reference.poses.len(), 5);
    for (id, pose) in &reference.poses {
        let err = (pose.translation.vector - s.truth[id].translation.vector).norm();
        assert!(err < 1e-6, "frame {id} off by {err}");
    }
}

#[test]
fn two_robots_match_the_centralized_solution() {
    let s = scenario();
    let reference = centralized(&s);
    let transports = ChannelTransport::mesh(&[1, 2, 3]);

    // Drone 3 never runs; nobody may wait for it.
    let outcomes = run_swarm(&s, &transports[..2], &precise(), 1);

    for (outcome, drone) in outcomes.iter().zip([1, 2]) {
        assert_eq!(outcome.report.final_state, SolveState::Converged, "drone {drone}");
        assert_eq!(outcome.report.sync_timeouts, 0, "drone {drone}");
        for id in outcome.poses.keys() {
            assert_eq!(s.store.frame(*id).unwrap().drone_id, drone);
        }
        assert_matches(outcome, &reference, 1e-4);
    }
    // Drone 1's head is anchored and never returned.
    assert!(!outcomes[0].poses.contains_key(&10));
    assert_eq!(outcomes[0].poses.len(), 2);
    assert_eq!(outcomes[1].poses.len(), 3);
}

#[test]
fn blended_merge_reaches_the_same_solution() {
    let s = scenario();
    let reference = centralized(&s);
    let transports = ChannelTransport::mesh(&[1, 2]);
    let opts = ConsensusOptions {
        merge: ConsensusMerge::Blend { weight: 0.5 },
        ..precise()
    };

    let outcomes = run_swarm(&s, &transports, &opts, 1);
    for outcome in &outcomes {
        assert_eq!(outcome.report.final_state, SolveState::Converged);
        assert_matches(outcome, &reference, 1e-4);
    }
    // Same convergence criterion, but half-steps take more rounds.
    let overwrite = run_swarm(&s, &ChannelTransport::mesh(&[1, 2]), &precise(), 1);
    assert!(outcomes[0].report.rounds > overwrite[0].report.rounds);
}

#[test]
fn consecutive_solves_each_converge() {
    let s = scenario();
    let reference = centralized(&s);
    let transports = ChannelTransport::mesh(&[1, 2]);

    for epoch in 1..=3 {
        let outcomes = run_swarm(&s, &transports, &precise(), epoch);
        for (outcome, drone) in outcomes.iter().zip([1, 2]) {
            assert_eq!(
                outcome.report.final_state,
                SolveState::Converged,
                "drone {drone} in epoch {epoch}"
            );
            assert_eq!(outcome.report.sync_timeouts, 0);
            assert_matches(outcome, &reference, 1e-4);
        }
    }
}

#[test]
fn updates_from_an_earlier_solve_are_ignored() {
    let s = scenario();
    let quick = ConsensusOptions {
        max_steps: 3,
        timeout_wait_sync: 0.02,
        ..Default::default()
    };

    // Drone 2 runs epoch 1 alone; its updates pile up in drone 1's inbox.
    let transports = ChannelTransport::mesh(&[1, 2]);
    let lone = prepare(&s, 2, &transports[1], quick.clone())
        .with_epoch(1)
        .solve()
        .unwrap();
    assert_eq!(lone.report.sync_timeouts, 3);

    let outcome = prepare(&s, 1, &transports[0], quick.clone())
        .with_epoch(2)
        .solve()
        .unwrap();
    assert_eq!(outcome.report.rounds, 3);
    assert_eq!(outcome.report.sync_timeouts, 3);
    assert_eq!(outcome.report.final_state, SolveState::TimedOut);

    // The same backlog counts when both sides agree on the epoch.
    let transports = ChannelTransport::mesh(&[1, 2]);
    prepare(&s, 2, &transports[1], quick.clone())
        .with_epoch(1)
        .solve()
        .unwrap();
    let outcome = prepare(&s, 1, &transports[0], quick)
        .with_epoch(1)
        .solve()
        .unwrap();
    assert_eq!(outcome.report.sync_timeouts, 0);
}

#[test]
fn silent_peers_time_out_every_round() {
    let s = scenario();
    let transport = ChannelTransport::isolated(1);
    let opts = ConsensusOptions {
        max_steps: 3,
        timeout_wait_sync: 0.01,
        ..Default::default()
    };

    let outcome = prepare(&s, 1, &transport, opts).solve().unwrap();
    assert_eq!(outcome.report.rounds, 3);
    assert_eq!(outcome.report.sync_timeouts, 3);
    assert_eq!(outcome.report.final_state, SolveState::TimedOut);
    assert!(!outcome.report.converged);
    assert!(outcome.poses.keys().all(|id| (11..=12).contains(id)));
}
