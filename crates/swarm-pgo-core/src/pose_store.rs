//! Arena of frames grouped into per-robot trajectories.
//!
//! Frames are stored once in a flat arena. A [`PoseHandle`] is the index of a
//! frame in that arena and stays valid for the lifetime of the store, since
//! frames are never removed.

use std::collections::{BTreeMap, HashMap};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DroneId, Frame, FrameId, Iso3, Real};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PoseStoreError {
    #[error("frame {0} already exists")]
    DuplicateFrame(FrameId),
    #[error("frame {0} has a non-finite timestamp")]
    InvalidStamp(FrameId),
}

/// Stable index of a frame's pose buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoseHandle(usize);

impl PoseHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Default)]
pub struct PoseStore {
    frames: Vec<Frame>,
    by_id: HashMap<FrameId, PoseHandle>,
    /// Per-robot handles ordered by timestamp.
    trajectories: BTreeMap<DroneId, Vec<PoseHandle>>,
}

impl PoseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a frame, keeping its robot's trajectory sorted by time.
    ///
    /// Frames with equal stamps keep insertion order.
    pub fn add_frame(&mut self, frame: Frame) -> Result<PoseHandle, PoseStoreError> {
        if self.by_id.contains_key(&frame.frame_id) {
            return Err(PoseStoreError::DuplicateFrame(frame.frame_id));
        }
        if !frame.stamp.is_finite() {
            return Err(PoseStoreError::InvalidStamp(frame.frame_id));
        }

        let handle = PoseHandle(self.frames.len());
        let stamp = frame.stamp;
        let traj = self.trajectories.entry(frame.drone_id).or_default();
        let pos = traj.partition_point(|h| self.frames[h.0].stamp <= stamp);
        traj.insert(pos, handle);
        self.by_id.insert(frame.frame_id, handle);
        debug!(
            "pose store: frame {} of drone {} at t={stamp:.3}",
            frame.frame_id, frame.drone_id
        );
        self.frames.push(frame);
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn contains(&self, frame_id: FrameId) -> bool {
        self.by_id.contains_key(&frame_id)
    }

    pub fn pose_state(&self, frame_id: FrameId) -> Option<PoseHandle> {
        self.by_id.get(&frame_id).copied()
    }

    pub fn frame(&self, frame_id: FrameId) -> Option<&Frame> {
        self.pose_state(frame_id).map(|h| &self.frames[h.0])
    }

    pub fn frame_at(&self, handle: PoseHandle) -> &Frame {
        &self.frames[handle.0]
    }

    pub fn pose(&self, handle: PoseHandle) -> &Iso3 {
        &self.frames[handle.0].pose
    }

    pub fn set_pose(&mut self, handle: PoseHandle, pose: Iso3) {
        self.frames[handle.0].pose = pose;
    }

    /// Robots with at least one frame, ascending.
    pub fn available_drones(&self) -> Vec<DroneId> {
        self.trajectories.keys().copied().collect()
    }

    pub fn frame_count(&self, drone_id: DroneId) -> usize {
        self.trajectories.get(&drone_id).map_or(0, Vec::len)
    }

    /// Id of the earliest frame of a robot.
    pub fn head_id(&self, drone_id: DroneId) -> Option<FrameId> {
        self.trajectories
            .get(&drone_id)
            .and_then(|t| t.first())
            .map(|h| self.frames[h.0].frame_id)
    }

    pub fn frames(&self, drone_id: DroneId) -> Vec<&Frame> {
        self.trajectory(drone_id).frames().collect()
    }

    pub fn trajectory(&self, drone_id: DroneId) -> Trajectory<'_> {
        Trajectory {
            drone_id,
            store: self,
            handles: self
                .trajectories
                .get(&drone_id)
                .map_or(&[][..], Vec::as_slice),
        }
    }

    /// All frames in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }
}

/// Time-ordered view of one robot's frames.
#[derive(Debug, Clone, Copy)]
pub struct Trajectory<'a> {
    drone_id: DroneId,
    store: &'a PoseStore,
    handles: &'a [PoseHandle],
}

impl<'a> Trajectory<'a> {
    pub fn drone_id(&self) -> DroneId {
        self.drone_id
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &'a [PoseHandle] {
        self.handles
    }

    pub fn frames(self) -> impl Iterator<Item = &'a Frame> {
        let store = self.store;
        self.handles.iter().map(move |h| store.frame_at(*h))
    }

    pub fn keyframes(self) -> impl Iterator<Item = &'a Frame> {
        self.frames().filter(|f| f.is_keyframe)
    }

    pub fn head(&self) -> Option<&'a Frame> {
        self.handles.first().map(|h| self.store.frame_at(*h))
    }

    pub fn tail(&self) -> Option<&'a Frame> {
        self.handles.last().map(|h| self.store.frame_at(*h))
    }

    pub fn frame_by_id(&self, frame_id: FrameId) -> Option<&'a Frame> {
        self.store
            .frame(frame_id)
            .filter(|f| f.drone_id == self.drone_id)
    }

    /// Frame whose timestamp is closest to `stamp`.
    pub fn nearest(&self, stamp: Real) -> Option<&'a Frame> {
        let idx = self.upper_index(stamp);
        let candidates = [idx.checked_sub(1), Some(idx)];
        candidates
            .into_iter()
            .flatten()
            .filter_map(|i| self.handles.get(i))
            .map(|h| self.store.frame_at(*h))
            .min_by(|a, b| {
                (a.stamp - stamp)
                    .abs()
                    .total_cmp(&(b.stamp - stamp).abs())
            })
    }

    /// Optimized pose at `stamp`: linear in position, slerp in orientation.
    ///
    /// Returns `None` outside the trajectory's time span.
    pub fn interpolate(&self, stamp: Real) -> Option<Iso3> {
        let head = self.head()?;
        let tail = self.tail()?;
        if stamp < head.stamp || stamp > tail.stamp {
            return None;
        }
        let idx = self.upper_index(stamp);
        if idx == 0 {
            return Some(head.pose);
        }
        let before = self.store.frame_at(self.handles[idx - 1]);
        let Some(after) = self.handles.get(idx).map(|h| self.store.frame_at(*h)) else {
            return Some(before.pose);
        };
        let span = after.stamp - before.stamp;
        if span <= 0.0 {
            return Some(before.pose);
        }
        let s = (stamp - before.stamp) / span;
        Some(before.pose.lerp_slerp(&after.pose, s))
    }

    /// Index of the first frame with a stamp greater than `stamp`.
    fn upper_index(&self, stamp: Real) -> usize {
        self.handles
            .partition_point(|h| self.store.frame_at(*h).stamp <= stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::make_iso;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn frame_at(id: FrameId, drone: DroneId, stamp: f64, x: f64) -> Frame {
        let pose = make_iso(UnitQuaternion::identity(), Vector3::new(x, 0.0, 0.0));
        Frame::new(id, drone, stamp, pose)
    }

    #[test]
    fn trajectory_is_time_ordered() {
        let mut store = PoseStore::new();
        store.add_frame(frame_at(10, 1, 2.0, 2.0)).unwrap();
        store.add_frame(frame_at(11, 1, 0.0, 0.0)).unwrap();
        store.add_frame(frame_at(12, 1, 1.0, 1.0)).unwrap();
        store.add_frame(frame_at(20, 2, 0.5, 5.0)).unwrap();

        let ids: Vec<_> = store.frames(1).iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, vec![11, 12, 10]);
        assert_eq!(store.head_id(1), Some(11));
        assert_eq!(store.head_id(2), Some(20));
        assert_eq!(store.head_id(3), None);
        assert_eq!(store.available_drones(), vec![1, 2]);
        assert_eq!(store.frame_count(1), 3);
    }

    #[test]
    fn duplicate_frame_leaves_store_unchanged() {
        let mut store = PoseStore::new();
        store.add_frame(frame_at(1, 0, 0.0, 0.0)).unwrap();
        let err = store.add_frame(frame_at(1, 0, 5.0, 9.0)).unwrap_err();
        assert_eq!(err, PoseStoreError::DuplicateFrame(1));
        assert_eq!(store.len(), 1);
        assert_eq!(store.frame(1).unwrap().stamp, 0.0);
    }

    #[test]
    fn handles_are_stable_and_writable() {
        let mut store = PoseStore::new();
        let h = store.add_frame(frame_at(7, 0, 1.0, 1.0)).unwrap();
        store.add_frame(frame_at(3, 0, 0.0, 0.0)).unwrap();
        assert_eq!(store.pose_state(7), Some(h));

        let moved = make_iso(UnitQuaternion::identity(), Vector3::new(4.0, 0.0, 0.0));
        store.set_pose(h, moved);
        assert_eq!(store.pose(h), &moved);
        assert_relative_eq!(store.frame(7).unwrap().odom.translation.x, 1.0);
    }

    #[test]
    fn nearest_and_interpolation() {
        let mut store = PoseStore::new();
        store.add_frame(frame_at(0, 0, 0.0, 0.0)).unwrap();
        store.add_frame(frame_at(1, 0, 1.0, 2.0)).unwrap();
        let traj = store.trajectory(0);

        assert_eq!(traj.nearest(0.4).unwrap().frame_id, 0);
        assert_eq!(traj.nearest(0.6).unwrap().frame_id, 1);
        assert_eq!(traj.nearest(7.0).unwrap().frame_id, 1);

        let mid = traj.interpolate(0.25).unwrap();
        assert_relative_eq!(mid.translation.x, 0.5, epsilon = 1e-12);
        assert_relative_eq!(traj.interpolate(1.0).unwrap().translation.x, 2.0);
        assert!(traj.interpolate(1.5).is_none());
        assert!(traj.frame_by_id(1).is_some());
        assert!(store.trajectory(9).is_empty());
    }
}
