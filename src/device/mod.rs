//! Lifecycle devices orchestrated by the chain coordinator.
//!
//! Each device here implements the [`crate::core::Device`] contract:
//! the stimulus output box, the video channel, the per-trial frame
//! writers, and the scripted mock used by tests and dry runs.

pub mod daq;
pub mod mock;
pub mod video;
pub mod writer;

pub use daq::{DaqOutDevice, OutputPort, SimPort, StimulusLine};
pub use mock::MockDevice;
pub use video::VideoChannel;
pub use writer::FrameWriter;
