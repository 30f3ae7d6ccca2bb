//! Experiment orchestration.
//!
//! [`ExperimentEngine`] reproduces the rig's root-stage logic on top of
//! the core components: device bring-up, per-animal configuration, the
//! trial loop with stimulus scheduling, and full shutdown.

pub mod engine;

pub use engine::{EngineState, ExperimentEngine};
