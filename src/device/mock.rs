//! A mock lifecycle device with scripted timing.
//!
//! Used by the chain tests and by dry runs without hardware. Transition
//! delay and failure are injectable, and every issued action can be
//! recorded to a shared journal so tests can assert on ordering.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::core::{Device, DeviceState, StateCell};
use crate::error::{AppResult, RigError};

/// Shared record of issued lifecycle actions, in order.
#[derive(Clone, Debug, Default)]
pub struct ActionJournal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ActionJournal {
    /// Append one entry.
    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    /// Snapshot of all entries so far.
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Scripted lifecycle device.
pub struct MockDevice {
    id: String,
    state: StateCell,
    delay: Duration,
    fail: bool,
    journal: Option<ActionJournal>,
}

impl MockDevice {
    /// A device that settles instantly.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: StateCell::new(),
            delay: Duration::ZERO,
            fail: false,
            journal: None,
        }
    }

    /// Delay each transition by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Land in [`DeviceState::Error`] instead of the target state.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Record issued actions to `journal`.
    pub fn journaled(mut self, journal: ActionJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    fn transition(&self, via: DeviceState, to: DeviceState) {
        self.state.set(via);
        let cell = self.state.clone();
        let delay = self.delay;
        let end = if self.fail { DeviceState::Error } else { to };
        tokio::spawn(async move {
            sleep(delay).await;
            cell.set(end);
        });
    }

    fn journal(&self, action: &str) {
        if let Some(journal) = &self.journal {
            journal.record(format!("{}:{}", self.id, action));
        }
    }
}

#[async_trait]
impl Device for MockDevice {
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
        self.journal("activate");
        self.transition(DeviceState::Activating, DeviceState::Active);
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
        self.journal("deactivate");
        self.transition(DeviceState::Deactivating, DeviceState::Inactive);
        Ok(())
    }
}
