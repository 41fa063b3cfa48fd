//! Parameter block conventions shared by factors, backends and solvers.

pub mod pose;

pub use pose::{
    PoseDof, frame_id_from_param, iso3_to_pos_yaw_dvec, iso3_to_se3_dvec, pack_pose, param_name,
    pos_yaw_dvec_to_iso3, se3_dvec_to_iso3, unpack_pose,
};
