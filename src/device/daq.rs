//! Digital stimulus output device.
//!
//! Models a Switch & Sense 8/8-style output box: named stimulus lines
//! (shocker, tone, IR illuminator) mapped to output pins. The wire
//! protocol lives behind the [`OutputPort`] seam so the device logic is
//! testable without hardware; [`SimPort`] records pin levels in memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::DaqSettings;
use crate::core::{Device, DeviceState, StateCell};
use crate::error::{AppResult, RigError};

/// The stimulus lines the rig can drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StimulusLine {
    /// Foot-shock grid relay.
    Shocker,
    /// Tone generator.
    Tone,
    /// Infrared illuminator.
    IrLeds,
}

/// Transport seam between the device logic and the physical output box.
#[async_trait]
pub trait OutputPort: Send + Sync {
    /// Open the connection to the box.
    async fn open(&mut self) -> AppResult<()>;

    /// Drive one output pin high or low.
    async fn write_pin(&mut self, pin: u8, high: bool) -> AppResult<()>;

    /// Close the connection.
    async fn close(&mut self) -> AppResult<()>;
}

/// In-memory output port for simulation and tests.
#[derive(Clone, Default)]
pub struct SimPort {
    pins: Arc<Mutex<HashMap<u8, bool>>>,
}

impl SimPort {
    /// A port with all pins low.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current level of one pin.
    pub fn pin(&self, pin: u8) -> bool {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pin)
            .copied()
            .unwrap_or(false)
    }
}

#[async_trait]
impl OutputPort for SimPort {
    async fn open(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn write_pin(&mut self, pin: u8, high: bool) -> AppResult<()> {
        self.pins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pin, high);
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// The digital output device orchestrated during bring-up and teardown.
pub struct DaqOutDevice {
    id: String,
    state: StateCell,
    pin_map: HashMap<StimulusLine, u8>,
    port: Box<dyn OutputPort>,
}

impl DaqOutDevice {
    /// Build the device with a pin map taken from settings.
    pub fn new(id: impl Into<String>, settings: &DaqSettings, port: Box<dyn OutputPort>) -> Self {
        let mut pin_map = HashMap::new();
        pin_map.insert(StimulusLine::Shocker, settings.shocker_pin);
        pin_map.insert(StimulusLine::Tone, settings.tone_pin);
        pin_map.insert(StimulusLine::IrLeds, settings.ir_leds_pin);
        Self {
            id: id.into(),
            state: StateCell::new(),
            pin_map,
            port,
        }
    }

    /// Drive one stimulus line. The device must be active.
    pub async fn set_line(&mut self, line: StimulusLine, high: bool) -> AppResult<()> {
        if self.state.get() != DeviceState::Active {
            return Err(RigError::Device(format!(
                "'{}' cannot drive {:?} while {:?}",
                self.id,
                line,
                self.state.get()
            )));
        }
        let pin = *self.pin_map.get(&line).ok_or_else(|| {
            RigError::Device(format!("'{}' has no pin mapped for {:?}", self.id, line))
        })?;
        debug!("{}: {:?} (pin {}) -> {}", self.id, line, pin, high);
        self.port.write_pin(pin, high).await
    }

    async fn all_lines_low(&mut self) -> AppResult<()> {
        for pin in self.pin_map.values().copied().collect::<Vec<_>>() {
            self.port.write_pin(pin, false).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Device for DaqOutDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> DeviceState {
        self.state.get()
    }

    fn state_channel(&self) -> watch::Receiver<DeviceState> {
        self.state.subscribe()
    }

    async fn activate(&mut self) -> AppResult<()> {
        if self.state.get() != DeviceState::Inactive {
            return Err(RigError::Device(format!(
                "'{}' cannot activate from {:?}",
                self.id,
                self.state.get()
            )));
        }
        self.state.set(DeviceState::Activating);
        if let Err(err) = self.port.open().await {
            self.state.set(DeviceState::Error);
            return Err(err);
        }
        info!("{}: output box online", self.id);
        self.state.set(DeviceState::Active);
        Ok(())
    }

    async fn deactivate(&mut self) -> AppResult<()> {
        if self.state.get() != DeviceState::Active {
            return Err(RigError::Device(format!(
                "'{}' cannot deactivate from {:?}",
                self.id,
                self.state.get()
            )));
        }
        self.state.set(DeviceState::Deactivating);
        // Lines are forced low before the port closes; a dangling shocker
        // relay is not an acceptable shutdown artifact.
        if let Err(err) = self.all_lines_low().await {
            self.state.set(DeviceState::Error);
            return Err(err);
        }
        if let Err(err) = self.port.close().await {
            self.state.set(DeviceState::Error);
            return Err(err);
        }
        info!("{}: output box offline", self.id);
        self.state.set(DeviceState::Inactive);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(port: SimPort) -> DaqOutDevice {
        DaqOutDevice::new("mcdaq", &DaqSettings::default(), Box::new(port))
    }

    #[tokio::test]
    async fn test_set_line_requires_active() {
        let mut daq = device(SimPort::new());
        let err = daq.set_line(StimulusLine::Tone, true).await.unwrap_err();
        assert!(matches!(err, RigError::Device(_)));
    }

    #[tokio::test]
    async fn test_lines_map_to_configured_pins() {
        let port = SimPort::new();
        let mut daq = device(port.clone());
        daq.activate().await.unwrap();

        daq.set_line(StimulusLine::Shocker, true).await.unwrap();
        daq.set_line(StimulusLine::Tone, true).await.unwrap();
        assert!(port.pin(4));
        assert!(port.pin(5));
        assert!(!port.pin(6));
    }

    #[tokio::test]
    async fn test_deactivate_forces_lines_low() {
        let port = SimPort::new();
        let mut daq = device(port.clone());
        daq.activate().await.unwrap();
        daq.set_line(StimulusLine::Shocker, true).await.unwrap();

        daq.deactivate().await.unwrap();
        assert!(!port.pin(4));
        assert!(!port.pin(5));
        assert!(!port.pin(6));
        assert_eq!(daq.state(), DeviceState::Inactive);
    }
}
