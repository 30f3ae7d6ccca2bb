//! Session executor for the conditioning rig.
//!
//! The engine owns the simulated hardware (stimulus output box, video
//! channel), one [`RecordingSession`] per animal run, and the trial log.
//! It is the piece an external stage framework would call into; the CLI
//! binary drives it directly.
//!
//! # Lifecycle
//!
//! ```text
//! bring_up -> configure_animal -> run_animal -> shut_down
//! ```
//!
//! Bring-up activates `[daq, video]` as an ordered chain and starts the
//! frame pump feeding the session's router. Each trial schedules its tone
//! and shock windows against the trial clock, stamping events against the
//! video-time cursor as the lines switch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chain::{ChainCoordinator, ChainDirection};
use crate::config::{Settings, TrialOptions};
use crate::core::{DeviceState, DisplaySink, EventKey, SharedDevice, WriterSpec};
use crate::data::TrialLogWriter;
use crate::device::daq::{DaqOutDevice, SimPort, StimulusLine};
use crate::device::video::VideoChannel;
use crate::error::{AppResult, RigError};
use crate::session::RecordingSession;
use crate::timeline::{session_phases, Timeline};

/// Engine lifecycle state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// Nothing running.
    Idle,
    /// Hardware chain activation in flight.
    BringUp,
    /// Hardware online, no animal configured or run complete.
    Ready,
    /// Trial loop executing.
    Running {
        /// Zero-based index of the trial in flight.
        trial: usize,
    },
    /// Teardown in flight.
    ShuttingDown,
    /// A run finished all its trials.
    Complete,
    /// Bring-up or run failed; see the returned error.
    Error,
}

/// One scheduled line switch inside a trial.
struct StimulusEvent {
    offset: f64,
    line: StimulusLine,
    high: bool,
    key: EventKey,
}

/// Sidecar describing one animal run, written next to the footage.
#[derive(Debug, Serialize)]
struct RunManifest<'a> {
    run_id: &'a str,
    animal_id: &'a str,
    trial_type: &'a str,
    options: &'a TrialOptions,
    timeline: &'a Timeline,
    started: String,
}

/// Orchestrates a full conditioning session over simulated hardware.
pub struct ExperimentEngine {
    settings: Settings,
    daq: Arc<Mutex<DaqOutDevice>>,
    video: Arc<Mutex<VideoChannel>>,
    session: RecordingSession,
    log: TrialLogWriter,
    state: EngineState,
    run_id: Option<String>,
    animal_id: String,
    trial_type: String,
    options: Option<TrialOptions>,
    timeline: Option<Timeline>,
    pump: Option<JoinHandle<()>>,
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

impl ExperimentEngine {
    /// Wire up the engine from settings with simulated hardware.
    pub fn new(settings: Settings, display: Arc<dyn DisplaySink>) -> Self {
        let daq = Arc::new(Mutex::new(DaqOutDevice::new(
            "mcdaq",
            &settings.daq,
            Box::new(SimPort::new()),
        )));
        let video = Arc::new(Mutex::new(VideoChannel::new("player", &settings.video)));
        let session = RecordingSession::new(&settings, display);
        let log = TrialLogWriter::new(
            settings.storage.data_dir.clone(),
            settings.experiment.log_name_pat.clone(),
        );
        Self {
            settings,
            daq,
            video,
            session,
            log,
            state: EngineState::Idle,
            run_id: None,
            animal_id: String::new(),
            trial_type: String::new(),
            options: None,
            timeline: None,
            pump: None,
        }
    }

    /// Current engine state.
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// The session timeline computed for the configured animal.
    pub fn timeline(&self) -> Option<&Timeline> {
        self.timeline.as_ref()
    }

    /// Identifier of the configured run, if any.
    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    /// Bring the hardware chain online and start the frame pump.
    pub async fn bring_up(&mut self) -> AppResult<()> {
        self.state = EngineState::BringUp;
        tokio::fs::create_dir_all(&self.settings.storage.data_dir).await?;

        let devices: Vec<SharedDevice> = vec![
            self.daq.clone() as SharedDevice,
            self.video.clone() as SharedDevice,
        ];
        let mut chain = ChainCoordinator::new(devices, ChainDirection::Activate)
            .on_step(|index, id| info!(step = index, device = id, "device online"));
        if let Some(timeout) = self.settings.chain.activation_timeout {
            chain = chain.with_timeout(timeout);
        }
        if let Err(err) = chain.run().await {
            self.state = EngineState::Error;
            return Err(err);
        }

        let mut frames = self.video.lock().await.frames();
        let router = self.session.router();
        self.pump = Some(tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => router.on_video_frame(frame.pts, frame.data),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "video pump lagged; frames skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        self.state = EngineState::Ready;
        info!("hardware online");
        Ok(())
    }

    /// Configure the session for one animal: select the trial type, build
    /// the timeline, allocate and activate the per-trial writers, and
    /// write the run manifest.
    pub async fn configure_animal(&mut self, animal_id: &str, trial_type: &str) -> AppResult<()> {
        let options = self
            .settings
            .experiment
            .trial_opts
            .select(trial_type)?
            .clone();

        let phases = session_phases(
            &self.settings.experiment,
            &self.settings.experiment.trial_opts,
            options.trial_length(),
        );
        let timeline = Timeline::build(&phases)?;

        let spec = WriterSpec::from(&self.settings.video);
        self.session.allocate(&spec, options.repeat, animal_id)?;
        self.session.activate_all().await?;

        let run_id = Uuid::new_v4().to_string();
        info!(
            run_id = %run_id,
            animal = animal_id,
            trial_type,
            trials = options.repeat,
            session_len = timeline.total_duration(),
            "animal configured"
        );
        self.write_manifest(&run_id, animal_id, trial_type, &options, &timeline)?;

        self.run_id = Some(run_id);
        self.animal_id = animal_id.to_string();
        self.trial_type = trial_type.to_string();
        self.options = Some(options);
        self.timeline = Some(timeline);
        Ok(())
    }

    fn write_manifest(
        &self,
        run_id: &str,
        animal_id: &str,
        trial_type: &str,
        options: &TrialOptions,
        timeline: &Timeline,
    ) -> AppResult<()> {
        let manifest = RunManifest {
            run_id,
            animal_id,
            trial_type,
            options,
            timeline,
            started: Local::now().to_rfc3339(),
        };
        let body = serde_json::to_string_pretty(&manifest)
            .map_err(|e| RigError::Log(e.to_string()))?;
        let path: PathBuf = self
            .settings
            .storage
            .data_dir
            .join(format!("{animal_id}_{run_id}.manifest.json"));
        std::fs::write(&path, body)?;
        Ok(())
    }

    /// Run every trial for the configured animal, then wind down.
    pub async fn run_animal(&mut self) -> AppResult<()> {
        let options = self
            .options
            .clone()
            .ok_or_else(|| RigError::Configuration("no animal configured".to_string()))?;
        let experiment = self.settings.experiment.clone();

        sleep(secs(experiment.prehab)).await;

        for trial in 0..options.repeat as usize {
            self.state = EngineState::Running { trial };
            info!(trial, "trial starting");

            // Recording starts at the head of the pre-record window so the
            // lead-in footage lands in the trial's file.
            self.session.start_trial(trial)?;
            sleep(secs(experiment.prerecord)).await;
            self.session.mark_event(EventKey::TrialStart);

            if let Err(err) = self.run_stimuli(&options).await {
                self.state = EngineState::Error;
                return Err(err);
            }

            self.session.mark_event(EventKey::TrialEnd);
            sleep(secs(experiment.postrecord)).await;

            self.session.stop_trial(trial).await?;
            let stats = self.session.stats_snapshot();
            self.log.append(
                &self.animal_id,
                &self.trial_type,
                trial,
                &stats,
                Local::now(),
            )?;
            info!(trial, ?stats, "trial complete");

            if trial + 1 < options.repeat as usize {
                let iti = options.iti.sample(&mut rand::thread_rng());
                info!(trial, iti, "inter-trial interval");
                sleep(secs(iti)).await;
            }
        }

        sleep(secs(experiment.posthab)).await;
        self.state = EngineState::Complete;
        Ok(())
    }

    /// Drive the tone and shock lines through their windows, stamping
    /// events as each line switches. Sleeps cover the whole trial length.
    async fn run_stimuli(&mut self, options: &TrialOptions) -> AppResult<()> {
        let mut events: Vec<StimulusEvent> = Vec::new();
        if options.tone.enabled() {
            events.push(StimulusEvent {
                offset: options.tone.delay,
                line: StimulusLine::Tone,
                high: true,
                key: EventKey::ToneStart,
            });
            events.push(StimulusEvent {
                offset: options.tone.end(),
                line: StimulusLine::Tone,
                high: false,
                key: EventKey::ToneEnd,
            });
        }
        if options.shock.enabled() {
            events.push(StimulusEvent {
                offset: options.shock.delay,
                line: StimulusLine::Shocker,
                high: true,
                key: EventKey::ShockStart,
            });
            events.push(StimulusEvent {
                offset: options.shock.end(),
                line: StimulusLine::Shocker,
                high: false,
                key: EventKey::ShockEnd,
            });
        }
        events.sort_by(|a, b| a.offset.total_cmp(&b.offset));

        let mut elapsed = 0.0;
        for event in &events {
            if event.offset > elapsed {
                sleep(secs(event.offset - elapsed)).await;
                elapsed = event.offset;
            }
            self.daq.lock().await.set_line(event.line, event.high).await?;
            self.session.mark_event(event.key);
        }
        let trial_length = options.trial_length();
        if trial_length > elapsed {
            sleep(secs(trial_length - elapsed)).await;
        }
        Ok(())
    }

    /// Tear the whole rig down: close the log, stop the pump, chain the
    /// remaining writers down, then deactivate the hardware in reverse
    /// order. Absent devices are tolerated; every failure is collected
    /// rather than masking the ones after it.
    pub async fn shut_down(&mut self) -> AppResult<()> {
        self.state = EngineState::ShuttingDown;
        let mut failures: Vec<RigError> = Vec::new();

        if let Err(err) = self.log.close() {
            failures.push(err);
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Err(err) = self.session.teardown().await {
            failures.push(err);
        }

        // Reverse bring-up order; a device that never made it to Active
        // (or is already down) is skipped rather than rejected mid-chain.
        let mut devices: Vec<Option<SharedDevice>> = Vec::new();
        for device in [
            self.video.clone() as SharedDevice,
            self.daq.clone() as SharedDevice,
        ] {
            let state = device.lock().await.state();
            devices.push((state == DeviceState::Active).then_some(device));
        }
        let mut chain = ChainCoordinator::from_optional(devices, ChainDirection::Deactivate);
        if let Some(timeout) = self.settings.chain.deactivation_timeout {
            chain = chain.with_timeout(timeout);
        }
        if let Err(err) = chain.run().await {
            failures.push(err);
        }

        if failures.is_empty() {
            self.state = EngineState::Idle;
            info!("rig shut down");
            Ok(())
        } else {
            self.state = EngineState::Error;
            Err(RigError::ShutdownFailed(failures))
        }
    }
}
