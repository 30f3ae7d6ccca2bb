//! Core traits and data types for the conditioning rig.
//!
//! This module defines the foundational abstractions shared by every other
//! module: the device lifecycle contract, the event/timestamp record kept
//! per trial, and the frame types flowing from the video source to the
//! writers and the display.
//!
//! # Architecture Overview
//!
//! - [`Device`]: base trait for every orchestrated entity (stimulus output
//!   box, video channel, per-trial frame writer). Lifecycle actions are
//!   issued asynchronously; completion is observed on a `watch` channel.
//! - [`TrialStats`]: the six video-time event stamps recorded per trial.
//! - [`VideoFrame`] / [`DisplaySink`]: the frame-delivery boundary.
//!
//! # Thread Safety
//!
//! Devices require `Send + Sync` so they can be driven from async tasks.
//! State is published through Tokio `watch` channels so any number of
//! observers (chain coordinator, tests, GUI) can await a transition.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::error::AppResult;

// =============================================================================
// Device Lifecycle
// =============================================================================

/// Device lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Device is constructed but not running.
    Inactive,
    /// Activation was issued and is in flight.
    Activating,
    /// Device is up and usable.
    Active,
    /// Deactivation was issued and is in flight.
    Deactivating,
    /// Device failed; see the log for details.
    Error,
}

/// Shared, observable holder for a device's lifecycle state.
///
/// Devices embed one of these and hand clones to their worker tasks, so a
/// transition completed on a background task is visible to every observer.
#[derive(Clone, Debug)]
pub struct StateCell {
    tx: Arc<watch::Sender<DeviceState>>,
}

impl StateCell {
    /// Create a cell starting in [`DeviceState::Inactive`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(DeviceState::Inactive);
        Self { tx: Arc::new(tx) }
    }

    /// Current state.
    pub fn get(&self) -> DeviceState {
        *self.tx.borrow()
    }

    /// Publish a new state to all observers.
    pub fn set(&self, state: DeviceState) {
        // send_replace never fails; observers may come and go freely.
        let _ = self.tx.send_replace(state);
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.tx.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Base trait for every orchestrated lifecycle device.
///
/// `activate`/`deactivate` *issue* the transition and return once it is
/// underway (or immediately, for devices that settle inline); arrival at
/// `Active`/`Inactive`/`Error` is observed on [`Device::state_channel`].
/// A device may be activated only from `Inactive` and deactivated only
/// from `Active`; it rejects calls from any other state itself — the
/// chain coordinator never filters on its behalf.
#[async_trait]
pub trait Device: Send + Sync {
    /// Unique device identifier.
    fn id(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> DeviceState;

    /// Subscribe to lifecycle transitions.
    fn state_channel(&self) -> watch::Receiver<DeviceState>;

    /// Begin bringing the device up.
    async fn activate(&mut self) -> AppResult<()>;

    /// Begin taking the device down.
    async fn deactivate(&mut self) -> AppResult<()>;
}

/// A device shared between its owner and a chain coordinator pass.
pub type SharedDevice = Arc<Mutex<dyn Device>>;

/// Wrap a concrete device for shared orchestration.
pub fn share<D: Device + 'static>(device: D) -> SharedDevice {
    Arc::new(Mutex::new(device))
}

// =============================================================================
// Trial Event Stamps
// =============================================================================

/// Discrete events stamped against the video-time cursor during a trial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKey {
    /// Trial window opened.
    TrialStart,
    /// Trial window closed.
    TrialEnd,
    /// Tone turned on.
    ToneStart,
    /// Tone turned off.
    ToneEnd,
    /// Shock turned on.
    ShockStart,
    /// Shock turned off.
    ShockEnd,
}

/// Video-time event stamps for one trial.
///
/// Every field is a video timestamp in seconds; [`TrialStats::UNSET`]
/// means the event has not occurred yet. The record is reset at the start
/// of each trial and read by the log writer when the trial ends.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialStats {
    /// Trial start stamp.
    pub trial_start: f64,
    /// Trial end stamp.
    pub trial_end: f64,
    /// Tone onset stamp.
    pub tone_start: f64,
    /// Tone offset stamp.
    pub tone_end: f64,
    /// Shock onset stamp.
    pub shock_start: f64,
    /// Shock offset stamp.
    pub shock_end: f64,
}

impl TrialStats {
    /// Sentinel for "not yet occurred".
    pub const UNSET: f64 = -1.0;

    /// A record with every stamp unset.
    pub fn new() -> Self {
        Self {
            trial_start: Self::UNSET,
            trial_end: Self::UNSET,
            tone_start: Self::UNSET,
            tone_end: Self::UNSET,
            shock_start: Self::UNSET,
            shock_end: Self::UNSET,
        }
    }

    /// Restore every stamp to [`TrialStats::UNSET`].
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Stamp one event.
    pub fn set(&mut self, key: EventKey, ts: f64) {
        match key {
            EventKey::TrialStart => self.trial_start = ts,
            EventKey::TrialEnd => self.trial_end = ts,
            EventKey::ToneStart => self.tone_start = ts,
            EventKey::ToneEnd => self.tone_end = ts,
            EventKey::ShockStart => self.shock_start = ts,
            EventKey::ShockEnd => self.shock_end = ts,
        }
    }

    /// Read one stamp.
    pub fn get(&self, key: EventKey) -> f64 {
        match key {
            EventKey::TrialStart => self.trial_start,
            EventKey::TrialEnd => self.trial_end,
            EventKey::ToneStart => self.tone_start,
            EventKey::ToneEnd => self.tone_end,
            EventKey::ShockStart => self.shock_start,
            EventKey::ShockEnd => self.shock_end,
        }
    }
}

impl Default for TrialStats {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Frames
// =============================================================================

/// One timestamped video frame.
///
/// The payload is reference-counted so forwarding a frame to the writer
/// queue and the display sink never copies pixel data.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    /// Presentation timestamp in seconds of video time.
    pub pts: f64,
    /// Opaque pixel payload.
    pub data: Bytes,
}

/// Construction parameters for a per-trial frame writer.
#[derive(Clone, Debug, PartialEq)]
pub struct WriterSpec {
    /// Frame rate in Hz.
    pub rate: f64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format delivered by the video source.
    pub input_format: String,
    /// Pixel format written to disk; empty means same as input.
    pub output_format: String,
}

/// Presentation boundary: receives every decoded frame regardless of
/// recording state.
pub trait DisplaySink: Send + Sync {
    /// Present one frame.
    fn present(&self, frame: &VideoFrame);
}

/// A display sink that discards frames (headless operation).
pub struct NullDisplay;

impl DisplaySink for NullDisplay {
    fn present(&self, _frame: &VideoFrame) {}
}
