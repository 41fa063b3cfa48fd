//! Chordal relaxation for rotation initialization.
//!
//! Every edge asks for `R_to = R_from * R_rel`. Dropping the orthogonality
//! constraint turns this into linear least squares over the nine entries of
//! each rotation. Row `r` of every rotation decouples into its own system
//! `x_to = R_rel^T x_from`, and all three systems share one normal matrix.
//! The solution is projected back onto SO(3).

use std::collections::BTreeMap;

use anyhow::{Result, anyhow, ensure};
use log::debug;
use nalgebra::{DMatrix, Matrix3};
use swarm_pgo_core::{FrameId, Quat, project_to_so3};

/// Relative rotation measurement `R_to = R_from * rotation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationEdge {
    pub from: FrameId,
    pub to: FrameId,
    pub rotation: Quat,
}

// Pull toward the current rotation; keeps components not connected to the
// anchor well posed without moving them noticeably.
const REGULARIZATION: f64 = 1e-6;

/// Estimate rotations of all frames in `initial` from relative rotations.
///
/// `anchor` keeps its initial rotation. Edges naming frames outside
/// `initial` are an error; self-loops are ignored.
pub fn chordal_rotations(
    initial: &BTreeMap<FrameId, Quat>,
    edges: &[RotationEdge],
    anchor: FrameId,
) -> Result<BTreeMap<FrameId, Quat>> {
    ensure!(
        initial.contains_key(&anchor),
        "anchor frame {anchor} has no initial rotation"
    );
    for edge in edges {
        ensure!(
            initial.contains_key(&edge.from) && initial.contains_key(&edge.to),
            "rotation edge {} -> {} references an unknown frame",
            edge.from,
            edge.to
        );
    }

    // Column index of each free frame.
    let free: BTreeMap<FrameId, usize> = initial
        .keys()
        .filter(|id| **id != anchor)
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect();
    let n = free.len();
    if n == 0 {
        return Ok(initial.clone());
    }

    let rows_of = |q: &Quat| q.to_rotation_matrix().into_inner();
    let anchor_rot = rows_of(&initial[&anchor]);

    let mut h = DMatrix::<f64>::zeros(3 * n, 3 * n);
    // Column r holds the right-hand side of the system for row r.
    let mut b = DMatrix::<f64>::zeros(3 * n, 3);

    for (id, &k) in &free {
        let cur = rows_of(&initial[id]);
        for i in 0..3 {
            h[(3 * k + i, 3 * k + i)] += REGULARIZATION;
            for r in 0..3 {
                b[(3 * k + i, r)] += REGULARIZATION * cur[(r, i)];
            }
        }
    }

    let mut used = 0usize;
    for edge in edges {
        if edge.from == edge.to {
            continue;
        }
        used += 1;
        // Residual per row: x_to - m * x_from.
        let m: Matrix3<f64> = rows_of(&edge.rotation).transpose();
        match (free.get(&edge.from), free.get(&edge.to)) {
            (Some(&i), Some(&j)) => {
                add_block(&mut h, j, j, &Matrix3::identity());
                add_block(&mut h, i, i, &(m.transpose() * m));
                add_block(&mut h, j, i, &(-m));
                add_block(&mut h, i, j, &(-m.transpose()));
            }
            (None, Some(&j)) => {
                add_block(&mut h, j, j, &Matrix3::identity());
                for r in 0..3 {
                    let known = anchor_rot.row(r).transpose();
                    let rhs = m * known;
                    for c in 0..3 {
                        b[(3 * j + c, r)] += rhs[c];
                    }
                }
            }
            (Some(&i), None) => {
                add_block(&mut h, i, i, &(m.transpose() * m));
                for r in 0..3 {
                    let known = anchor_rot.row(r).transpose();
                    let rhs = m.transpose() * known;
                    for c in 0..3 {
                        b[(3 * i + c, r)] += rhs[c];
                    }
                }
            }
            (None, None) => {}
        }
    }

    let x = h
        .clone()
        .cholesky()
        .map(|chol| chol.solve(&b))
        .or_else(|| h.lu().solve(&b))
        .ok_or_else(|| anyhow!("chordal normal equations are singular"))?;

    let mut out = BTreeMap::new();
    out.insert(anchor, initial[&anchor]);
    for (id, &k) in &free {
        let mut rot = Matrix3::zeros();
        for r in 0..3 {
            for c in 0..3 {
                rot[(r, c)] = x[(3 * k + c, r)];
            }
        }
        out.insert(*id, project_to_so3(&rot));
    }
    debug!("chordal init: {} rotations from {used} edges", out.len());
    Ok(out)
}

fn add_block(h: &mut DMatrix<f64>, bi: usize, bj: usize, m: &Matrix3<f64>) {
    for r in 0..3 {
        for c in 0..3 {
            h[(3 * bi + r, 3 * bj + c)] += m[(r, c)];
        }
    }
}
