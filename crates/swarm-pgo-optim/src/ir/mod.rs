//! Backend-independent intermediate representation of pose-graph problems.

mod types;

pub use types::{
    FactorKind, FixedMask, ManifoldKind, ParamBlock, ParamId, ProblemIR, ResidualBlock, RobustLoss,
};
