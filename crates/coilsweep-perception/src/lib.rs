//! `coilsweep-perception` – where the coils are and what they have swept.
//!
//! # Modules
//!
//! - [`transform`] – [`TfEngine`][transform::TfEngine]: directed graph of
//!   named reference frames with stamped transforms, so a coil's position in
//!   the field frame can be composed from the vehicle pose and the coil
//!   mounting offset.
//! - [`pose_sampler`] – [`PoseSampler`][pose_sampler::PoseSampler]: looks up
//!   each coil's position once per cycle and turns any failure into a
//!   per-sensor, per-cycle [`PoseUnavailable`][coilsweep_types::SweepError::PoseUnavailable].
//! - [`coverage`] – [`CoverageGrid`][coverage::CoverageGrid]: the field map
//!   and its running covered-cell count, stamped with a circular
//!   [`DetectionFootprint`][coverage::DetectionFootprint] per coil position.

pub mod coverage;
pub mod pose_sampler;
pub mod transform;

pub use coverage::{CoverageGrid, DetectionFootprint};
pub use pose_sampler::{PoseSampler, PoseSource, PoseState, TfPoseSource};
pub use transform::{Quaternion, TfEngine, TfError, Transform3D, Vec3};
