//! Sequential device-chain activation and deactivation.
//!
//! Hardware bring-up and teardown must be strictly ordered — the output box
//! has to be online before the channel that talks through it — but each
//! step completes asynchronously. [`ChainCoordinator`] decouples the two:
//! it issues the lifecycle action on one device, suspends until that
//! device's target state is observed on its state channel, then moves to
//! the next. Other tasks (frame delivery, unrelated stage work) interleave
//! freely while a chain is suspended.
//!
//! A coordinator is single-use: it tracks exactly one in-flight pass and
//! [`ChainCoordinator::run`] consumes it, so reuse is a compile error
//! rather than a runtime one. On timeout or device fault the pass stops
//! issuing steps and returns; devices already transitioned are left where
//! they are — cleanup belongs to the caller.

use std::time::Duration;

use tokio::time::{self, Instant};

use crate::core::{DeviceState, SharedDevice};
use crate::error::{AppResult, RigError};

/// Which way a chain drives its devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainDirection {
    /// Bring devices up, in order.
    Activate,
    /// Take devices down, in order.
    Deactivate,
}

impl ChainDirection {
    /// The state each device must reach before the next step is issued.
    pub fn target(self) -> DeviceState {
        match self {
            ChainDirection::Activate => DeviceState::Active,
            ChainDirection::Deactivate => DeviceState::Inactive,
        }
    }
}

type StepHook = Box<dyn FnMut(usize, &str) + Send>;

/// Single-use driver for one ordered activation or deactivation pass.
pub struct ChainCoordinator {
    devices: Vec<SharedDevice>,
    direction: ChainDirection,
    timeout: Option<Duration>,
    on_step: Option<StepHook>,
}

impl ChainCoordinator {
    /// Build a coordinator over an ordered device sequence.
    pub fn new(devices: Vec<SharedDevice>, direction: ChainDirection) -> Self {
        Self {
            devices,
            direction,
            timeout: None,
            on_step: None,
        }
    }

    /// Build a coordinator from a sequence that may contain gaps.
    ///
    /// Absent devices (already torn down or never constructed) are skipped
    /// while the relative order of the rest is preserved. Shutdown paths
    /// use this so a partially constructed rig still deactivates cleanly.
    pub fn from_optional(devices: Vec<Option<SharedDevice>>, direction: ChainDirection) -> Self {
        Self::new(devices.into_iter().flatten().collect(), direction)
    }

    /// Bound the whole pass by a single deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Observe intermediate completions.
    ///
    /// The hook fires with `(index, device_id)` as each device short of the
    /// last reaches the target state, before the next step is issued.
    pub fn on_step(mut self, hook: impl FnMut(usize, &str) + Send + 'static) -> Self {
        self.on_step = Some(Box::new(hook));
        self
    }

    /// Number of devices in the chain.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the chain has no devices.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Drive the chain to completion.
    ///
    /// Issues the action on `devices[0]` immediately; each subsequent
    /// action is issued only after the previous device is observed at the
    /// target state. Returns `Ok(())` exactly once, after the last device
    /// arrives. An empty chain completes immediately with no action taken.
    ///
    /// # Errors
    ///
    /// [`RigError::ChainTimeout`] if the deadline expires first — no
    /// further steps are issued and in-flight device work is not aborted.
    /// [`RigError::DeviceFault`] if a device reports the error state.
    /// Device-issued errors (illegal transition) propagate unchanged.
    pub async fn run(mut self) -> AppResult<()> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let target = self.direction.target();
        let last = self.devices.len().saturating_sub(1);

        for (index, device) in self.devices.iter().enumerate() {
            let (id, mut state_rx) = {
                let mut dev = device.lock().await;
                let id = dev.id().to_string();
                match self.direction {
                    ChainDirection::Activate => dev.activate().await?,
                    ChainDirection::Deactivate => dev.deactivate().await?,
                }
                (id, dev.state_channel())
            };

            let wait = state_rx.wait_for(|s| *s == target || *s == DeviceState::Error);
            let observed = match deadline {
                Some(at) => time::timeout_at(at, wait)
                    .await
                    .map_err(|_| RigError::ChainTimeout {
                        device: id.clone(),
                        target,
                    })?,
                None => wait.await,
            };
            let state = *observed.map_err(|_| {
                RigError::Device(format!("'{id}' dropped its state channel mid-transition"))
            })?;

            if state == DeviceState::Error {
                return Err(RigError::DeviceFault(id));
            }
            if index < last {
                if let Some(hook) = self.on_step.as_mut() {
                    hook(index, &id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::share;
    use crate::device::mock::{ActionJournal, MockDevice};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn journal() -> ActionJournal {
        ActionJournal::default()
    }

    #[tokio::test]
    async fn test_activation_runs_in_index_order() {
        let journal = journal();
        let devices = vec![
            share(MockDevice::new("a").journaled(journal.clone())),
            share(MockDevice::new("b").journaled(journal.clone())),
            share(MockDevice::new("c").journaled(journal.clone())),
        ];

        ChainCoordinator::new(devices, ChainDirection::Activate)
            .run()
            .await
            .unwrap();

        assert_eq!(
            journal.entries(),
            vec!["a:activate", "b:activate", "c:activate"]
        );
    }

    #[tokio::test]
    async fn test_empty_chain_completes_immediately() {
        ChainCoordinator::new(Vec::new(), ChainDirection::Activate)
            .run()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_device_chain() {
        let journal = journal();
        let device = share(MockDevice::new("solo").journaled(journal.clone()));

        let hooks = Arc::new(AtomicUsize::new(0));
        let counter = hooks.clone();
        ChainCoordinator::new(vec![device], ChainDirection::Activate)
            .on_step(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .run()
            .await
            .unwrap();

        assert_eq!(journal.entries(), vec!["solo:activate"]);
        assert_eq!(hooks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_step_hook_fires_for_all_but_last() {
        let devices = vec![
            share(MockDevice::new("a")),
            share(MockDevice::new("b")),
            share(MockDevice::new("c")),
        ];
        let hooks = Arc::new(AtomicUsize::new(0));
        let counter = hooks.clone();

        ChainCoordinator::new(devices, ChainDirection::Activate)
            .on_step(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .run()
            .await
            .unwrap();

        assert_eq!(hooks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_issuing_steps() {
        let journal = journal();
        let devices = vec![
            share(
                MockDevice::new("slow")
                    .with_delay(Duration::from_secs(10))
                    .journaled(journal.clone()),
            ),
            share(MockDevice::new("never").journaled(journal.clone())),
        ];

        let err = ChainCoordinator::new(devices, ChainDirection::Activate)
            .with_timeout(Duration::from_secs(1))
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, RigError::ChainTimeout { ref device, .. } if device == "slow"));
        // Only the step pending at expiry was ever issued.
        assert_eq!(journal.entries(), vec!["slow:activate"]);
    }

    #[tokio::test]
    async fn test_device_fault_halts_chain() {
        let journal = journal();
        let devices = vec![
            share(MockDevice::new("ok").journaled(journal.clone())),
            share(MockDevice::new("bad").failing().journaled(journal.clone())),
            share(MockDevice::new("after").journaled(journal.clone())),
        ];

        let err = ChainCoordinator::new(devices, ChainDirection::Activate)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, RigError::DeviceFault(ref id) if id == "bad"));
        assert_eq!(journal.entries(), vec!["ok:activate", "bad:activate"]);
    }

    #[tokio::test]
    async fn test_deactivation_chain() {
        let journal = journal();
        let a = share(MockDevice::new("a").journaled(journal.clone()));
        let b = share(MockDevice::new("b").journaled(journal.clone()));

        ChainCoordinator::new(vec![a.clone(), b.clone()], ChainDirection::Activate)
            .run()
            .await
            .unwrap();
        ChainCoordinator::new(vec![a, b], ChainDirection::Deactivate)
            .run()
            .await
            .unwrap();

        assert_eq!(
            journal.entries(),
            vec!["a:activate", "b:activate", "a:deactivate", "b:deactivate"]
        );
    }

    #[tokio::test]
    async fn test_from_optional_skips_gaps_in_order() {
        let journal = journal();
        let devices = vec![
            None,
            Some(share(MockDevice::new("first").journaled(journal.clone()))),
            None,
            Some(share(MockDevice::new("second").journaled(journal.clone()))),
        ];

        let chain = ChainCoordinator::from_optional(devices, ChainDirection::Activate);
        assert_eq!(chain.len(), 2);
        chain.run().await.unwrap();

        assert_eq!(journal.entries(), vec!["first:activate", "second:activate"]);
    }
}
