//! QCP-based inverse kinematics solver for articulated skeletons with Kusudama swing/twist
//! constraints.
//!
//! The crate is a library, not a process: a host owns the skeleton and scene graph and drives
//! [`solver::Solver::solve`] once per frame, implementing [`skeleton::SkeletonProvider`] and
//! [`skeleton::GoalSource`] over its own data structures.

pub mod bone;
pub mod effector;
pub mod error;
pub mod kusudama;
pub mod qcp;
pub mod segment;
pub mod skeleton;
pub mod solver;
pub mod transform;

pub use bone::IkBone;
pub use effector::{AxisPriorities, Effector};
pub use error::{IkError, IkResult};
pub use kusudama::{Kusudama, OpenCone};
pub use qcp::{Qcp, QcpPrecision, QcpSolution};
pub use segment::{BoneSegment, SegmentDiagnostic};
pub use skeleton::{GoalSource, InMemorySkeleton, SkeletonProvider, StaticGoals};
pub use solver::{BoneConstraintConfig, ConeConfig, EffectorConfig, Solver, SolverConfig};
pub use transform::{BoneTransform, Rigid};
