//! Pose-graph optimization engine for single robots and swarms.
//!
//! ```no_run
//! use swarm_pgo_core::{Frame, Iso3, LoopEdge};
//! use swarm_pgo_pipeline::{PgoConfig, PoseGraphEngine};
//! # fn main() -> Result<(), swarm_pgo_pipeline::PgoError> {
//!
//! let engine = PoseGraphEngine::new(PgoConfig::default())?;
//! engine.add_frame(Frame::new(0, 0, 0.0, Iso3::identity()))?;
//! engine.add_frame(Frame::new(1, 0, 1.0, Iso3::translation(1.1, 0.0, 0.0)))?;
//! engine.add_loop(LoopEdge::new(0, 1, Iso3::translation(1.0, 0.0, 0.0)));
//!
//! let report = engine.solve()?;
//! println!("anchor {:?}, cost {}", report.anchor, report.solve.final_cost);
//! # Ok(())
//! # }
//! ```

mod config;
mod engine;
mod error;
pub mod factors;
pub mod gauge;

pub use config::{OptimizationMode, PgoConfig};
pub use engine::{PgoReport, PoseGraphEngine};
pub use error::PgoError;
pub use gauge::GaugeReport;

pub use swarm_pgo_optim::PoseDof;
pub use swarm_pgo_optim::solver::{
    ChannelTransport, ConsensusMerge, ConsensusOptions, ConsensusTransport,
};
