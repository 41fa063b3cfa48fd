//! Centralized solves on small synthetic pose graphs.

use approx::assert_relative_eq;
use nalgebra::Vector3;
use swarm_pgo_core::synthetic::{UniformPoseNoise, circle, drifting_trajectory, exact_loop};
use swarm_pgo_core::{Frame, Iso3, LoopEdge, Mat6, PoseStoreError, iso_from_xyz_rpy, yaw_of};
use swarm_pgo_optim::BackendSolveOptions;
use swarm_pgo_pipeline::{OptimizationMode, PgoConfig, PgoError, PoseDof, PoseGraphEngine};

/// Three frames with exact odometry at x = 0, 1, 2 whose optimized poses
/// start perturbed, plus loops 0->1, 1->2, 0->2.
fn three_frame_engine(dof: PoseDof) -> PoseGraphEngine {
    let engine = PoseGraphEngine::new(PgoConfig {
        pose_dof: dof,
        ..Default::default()
    })
    .unwrap();
    let perturbed = [
        iso_from_xyz_rpy(Vector3::zeros(), 0.0, 0.0, 0.0),
        iso_from_xyz_rpy(Vector3::new(1.3, 0.2, -0.1), 0.0, 0.0, 0.1),
        iso_from_xyz_rpy(Vector3::new(1.8, -0.3, 0.2), 0.0, 0.0, -0.1),
    ];
    for (i, pose) in perturbed.iter().enumerate() {
        let mut frame = Frame::new(i as u64, 0, i as f64, Iso3::translation(i as f64, 0.0, 0.0));
        frame.pose = *pose;
        engine.add_frame(frame).unwrap();
    }
    for (a, b) in [(0u64, 1u64), (1, 2), (0, 2)] {
        let rel = Iso3::translation((b - a) as f64, 0.0, 0.0);
        assert!(engine.add_loop(LoopEdge::new(a, b, rel)));
    }
    engine
}

#[test]
fn three_frames_converge_to_measurements() {
    for dof in [PoseDof::FourDof, PoseDof::SixDof] {
        let engine = three_frame_engine(dof);
        let report = engine.solve().unwrap();

        assert!(report.solve.converged, "{dof:?}");
        assert_eq!(report.anchor, Some(0));
        assert_eq!(report.used_frames, vec![0, 1, 2]);
        assert_eq!(report.loop_factors, 3);
        assert_eq!(report.ego_motion_factors, 2);
        assert_eq!(report.updated_frames, 2);
        assert!(report.solve.final_cost < report.solve.initial_cost);

        for (id, x) in [(1, 1.0), (2, 2.0)] {
            let pose = engine.frame(id).unwrap().pose;
            assert_relative_eq!(pose.translation.vector, Vector3::new(x, 0.0, 0.0), epsilon = 1e-3);
            assert_relative_eq!(yaw_of(&pose.rotation), 0.0, epsilon = 1e-3);
        }
        assert_eq!(engine.frame(0).unwrap().pose, Iso3::identity());
    }
}

#[test]
fn anchor_is_head_of_self_robot() {
    let engine = PoseGraphEngine::new(PgoConfig {
        self_id: 7,
        ..Default::default()
    })
    .unwrap();
    for (id, drone, t) in [(1, 3, 0.0), (2, 3, 1.0), (20, 7, 5.0), (21, 7, 6.0)] {
        engine
            .add_frame(Frame::new(id, drone, t, Iso3::translation(t, drone as f64, 0.0)))
            .unwrap();
    }
    engine.add_loop(LoopEdge::new(2, 20, Iso3::translation(1.0, 1.0, 0.0)));
    let before = engine.frame(20).unwrap().pose;

    let report = engine.solve().unwrap();
    assert_eq!(report.anchor, Some(20));
    assert_eq!(engine.frame(20).unwrap().pose, before);
}

#[test]
fn unused_frames_stay_out_of_the_problem() {
    let engine = PoseGraphEngine::new(PgoConfig::default()).unwrap();
    engine.add_frame(Frame::new(0, 0, 0.0, Iso3::identity())).unwrap();
    engine
        .add_frame(Frame::new(1, 0, 0.5, Iso3::translation(0.5, 0.0, 0.0)).non_keyframe())
        .unwrap();
    engine
        .add_frame(Frame::new(2, 0, 1.0, Iso3::translation(1.0, 0.0, 0.0)))
        .unwrap();
    // A robot with a single frame contributes no ego-motion.
    engine
        .add_frame(Frame::new(9, 1, 0.0, Iso3::translation(0.0, 5.0, 0.0)))
        .unwrap();

    let report = engine.solve().unwrap();
    assert_eq!(report.used_frames, vec![0, 2]);
    assert_eq!(report.ego_motion_factors, 1);
    assert_eq!(engine.frame(1).unwrap().pose, Iso3::translation(0.5, 0.0, 0.0));
    assert_eq!(engine.frame(9).unwrap().pose, Iso3::translation(0.0, 5.0, 0.0));
}

#[test]
fn empty_engine_solves_trivially() {
    let engine = PoseGraphEngine::new(PgoConfig::default()).unwrap();
    let report = engine.solve().unwrap();
    assert!(report.used_frames.is_empty());
    assert_eq!(report.anchor, None);
    assert!(report.solve.converged);
}

#[test]
fn second_solve_is_idempotent() {
    let noise = UniformPoseNoise {
        seed: 11,
        max_abs_pos: 0.03,
        max_abs_rot: 0.01,
    };
    let traj = drifting_trajectory(0, 0, circle(Vector3::zeros(), 3.0, 12), 0.5, &noise);
    let engine = PoseGraphEngine::new(PgoConfig {
        loop_distance_threshold: 5.0,
        backend: BackendSolveOptions {
            max_iters: 200,
            min_abs_decrease: Some(1e-14),
            min_rel_decrease: Some(1e-14),
            min_error: Some(1e-16),
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();
    for frame in &traj.frames {
        engine.add_frame(frame.clone()).unwrap();
    }
    let gt = &traj.ground_truth;
    assert!(engine.add_loop(
        exact_loop((11, &gt[11]), (0, &gt[0])).with_std(0.01, 0.005)
    ));

    engine.solve().unwrap();
    let first = engine.frames(0);
    engine.solve().unwrap();
    for (a, b) in first.iter().zip(engine.frames(0)) {
        let dt = (a.pose.translation.vector - b.pose.translation.vector).norm();
        let dr = a.pose.rotation.angle_to(&b.pose.rotation);
        assert!(dt < 1e-6 && dr < 1e-6, "frame {} moved {dt} / {dr}", a.frame_id);
    }
}

#[test]
fn loop_closure_reduces_drift() {
    let noise = UniformPoseNoise {
        seed: 5,
        max_abs_pos: 0.05,
        max_abs_rot: 0.02,
    };
    let traj = drifting_trajectory(0, 100, circle(Vector3::zeros(), 2.0, 16), 0.2, &noise);
    let engine = PoseGraphEngine::new(PgoConfig {
        pose_dof: PoseDof::SixDof,
        loop_distance_threshold: 5.0,
        ..Default::default()
    })
    .unwrap();
    for frame in &traj.frames {
        engine.add_frame(frame.clone()).unwrap();
    }
    let gt = &traj.ground_truth;
    engine.add_loop(exact_loop((115, &gt[15]), (100, &gt[0])).with_std(0.01, 0.005));

    let end_error = |engine: &PoseGraphEngine| {
        let pose = engine.frame(115).unwrap().pose;
        (pose.translation.vector - gt[15].translation.vector).norm()
    };
    let before = end_error(&engine);
    engine.solve().unwrap();
    assert!(end_error(&engine) < before);
}

#[test]
fn loops_beyond_threshold_are_dropped() {
    let engine = PoseGraphEngine::new(PgoConfig {
        loop_distance_threshold: 1.5,
        ..Default::default()
    })
    .unwrap();
    assert!(!engine.add_loop(LoopEdge::new(0, 1, Iso3::translation(2.0, 0.0, 0.0))));
    assert!(engine.add_loop(LoopEdge::new(0, 1, Iso3::translation(1.0, 0.0, 0.0))));
    assert_eq!(engine.loop_count(), 1);
}

#[test]
fn configuration_errors_leave_store_untouched() {
    let engine = three_frame_engine(PoseDof::FourDof);
    let before = engine.frames(0);

    engine.add_loop(LoopEdge::new(2, 77, Iso3::identity()));
    assert!(matches!(engine.solve(), Err(PgoError::UnknownFrame(77))));
    assert_eq!(engine.frames(0), before);

    let engine = three_frame_engine(PoseDof::SixDof);
    let mut info = Mat6::identity();
    info[(3, 3)] = -1.0;
    engine.add_loop(LoopEdge::new(0, 2, Iso3::translation(2.0, 0.0, 0.0)).with_information(info));
    assert!(matches!(engine.solve(), Err(PgoError::LoopEdge(_))));
    assert_eq!(engine.frames(0), before);

    let err = engine
        .add_frame(Frame::new(1, 0, 9.0, Iso3::identity()))
        .unwrap_err();
    assert!(matches!(err, PgoError::PoseStore(PoseStoreError::DuplicateFrame(1))));
}

#[test]
fn distributed_mode_needs_a_transport() {
    let engine = PoseGraphEngine::new(PgoConfig {
        mode: OptimizationMode::Distributed,
        ..Default::default()
    })
    .unwrap();
    assert!(matches!(engine.solve(), Err(PgoError::MissingTransport)));
}

#[test]
fn rotation_init_recovers_headings() {
    for dof in [PoseDof::FourDof, PoseDof::SixDof] {
        let engine = PoseGraphEngine::new(PgoConfig {
            pose_dof: dof,
            ..Default::default()
        })
        .unwrap();
        let truth: Vec<Iso3> = (0..3)
            .map(|i| iso_from_xyz_rpy(Vector3::new(i as f64, 0.0, 0.0), 0.0, 0.0, 0.4 * i as f64))
            .collect();
        for (i, gt) in truth.iter().enumerate() {
            let mut frame = Frame::new(i as u64, 0, i as f64, *gt);
            frame.pose = iso_from_xyz_rpy(gt.translation.vector, 0.0, 0.0, -1.0);
            engine.add_frame(frame).unwrap();
        }
        engine.add_loop(exact_loop((0, &truth[0]), (2, &truth[2])));

        let updated = engine.initialize_rotations().unwrap();
        assert_eq!(updated, 2);
        for (i, gt) in truth.iter().enumerate().skip(1) {
            let pose = engine.frame(i as u64).unwrap().pose;
            let expected = yaw_of(&gt.rotation) - 1.0;
            assert_relative_eq!(yaw_of(&pose.rotation), expected, epsilon = 1e-4);
            assert_eq!(pose.translation.vector, gt.translation.vector);
        }
    }
}
