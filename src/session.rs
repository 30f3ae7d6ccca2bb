//! Per-animal recording session.
//!
//! A session owns the per-trial video writers, the "current writer"
//! pointer, the live video-time cursor, and the event-stamp record for the
//! trial in flight. Frame delivery is the hot path: [`FrameRouter`] is a
//! cheap handle the video pump calls on every frame, and it only updates
//! the cursor, enqueues to the current writer, and forwards to the display
//! — no blocking, no awaiting.
//!
//! All event timestamps use the video-time cursor rather than wall clock,
//! so tone/shock/trial markers are frame-accurate relative to the footage.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::Local;
use log::warn;
use tokio::sync::mpsc;

use crate::chain::{ChainCoordinator, ChainDirection};
use crate::config::Settings;
use crate::core::{
    share, DeviceState, DisplaySink, EventKey, SharedDevice, TrialStats, VideoFrame, WriterSpec,
};
use crate::data::expand_pattern;
use crate::device::writer::FrameWriter;
use crate::error::{AppResult, RigError};

/// Hot-path state shared between the session and the frame router.
struct SessionShared {
    video_cursor: f64,
    stats: TrialStats,
    current: Option<usize>,
    lanes: Vec<Option<FrameLane>>,
    display: Arc<dyn DisplaySink>,
}

/// The queue end and label for one trial writer.
struct FrameLane {
    frames: mpsc::Sender<VideoFrame>,
    path: PathBuf,
}

/// Frame-delivery handle given to the video pump.
#[derive(Clone)]
pub struct FrameRouter {
    shared: Arc<Mutex<SessionShared>>,
}

impl FrameRouter {
    /// Deliver one frame.
    ///
    /// Updates the video-time cursor, enqueues to the current trial's
    /// writer if one is armed, and always forwards to the display sink.
    /// Never blocks: a full writer queue drops the frame with a warning —
    /// losing a frame is recoverable, aborting a running trial is not.
    pub fn on_video_frame(&self, pts: f64, data: Bytes) {
        let mut shared = lock(&self.shared);
        shared.video_cursor = pts;
        if let Some(lane) = shared
            .current
            .and_then(|i| shared.lanes.get(i))
            .and_then(Option::as_ref)
        {
            let frame = VideoFrame {
                pts,
                data: data.clone(),
            };
            if let Err(err) = lane.frames.try_send(frame) {
                warn!(
                    "dropping frame at {pts:.3}s for '{}': {err}",
                    lane.path.display()
                );
            }
        }
        shared.display.present(&VideoFrame { pts, data });
    }
}

/// One writer slot: the device for chain orchestration plus its target.
struct WriterSlot {
    device: SharedDevice,
    path: PathBuf,
}

/// Per-animal recording state machine.
pub struct RecordingSession {
    record_video: bool,
    name_pattern: String,
    data_dir: PathBuf,
    activation_timeout: Option<Duration>,
    deactivation_timeout: Option<Duration>,
    writers: Vec<Option<WriterSlot>>,
    shared: Arc<Mutex<SessionShared>>,
}

fn lock(shared: &Arc<Mutex<SessionShared>>) -> MutexGuard<'_, SessionShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordingSession {
    /// Build a session from settings. Containers are freshly constructed
    /// per session; nothing is shared between animals.
    pub fn new(settings: &Settings, display: Arc<dyn DisplaySink>) -> Self {
        Self {
            record_video: settings.experiment.record_video,
            name_pattern: settings.experiment.video_name_pat.clone(),
            data_dir: settings.storage.data_dir.clone(),
            activation_timeout: settings.chain.activation_timeout,
            deactivation_timeout: settings.chain.deactivation_timeout,
            writers: Vec::new(),
            shared: Arc::new(Mutex::new(SessionShared {
                video_cursor: 0.0,
                stats: TrialStats::new(),
                current: None,
                lanes: Vec::new(),
                display,
            })),
        }
    }

    /// Frame-delivery handle for the video pump.
    pub fn router(&self) -> FrameRouter {
        FrameRouter {
            shared: self.shared.clone(),
        }
    }

    /// Construct one writer per trial for `animal_id`.
    ///
    /// Filenames come from the session pattern: `{trial}` (zero-based) and
    /// `{animal}` substitution first, then strftime against a single
    /// wall-clock instant. With recording disabled this is a no-op and
    /// trials run without writers.
    ///
    /// # Errors
    ///
    /// [`RigError::FileCollision`] if any resolved path already exists on
    /// disk or repeats within the batch; the writer list is left empty.
    pub fn allocate(&mut self, spec: &WriterSpec, repeat: u32, animal_id: &str) -> AppResult<()> {
        self.writers.clear();
        {
            let mut shared = lock(&self.shared);
            shared.lanes.clear();
            shared.current = None;
        }
        if !self.record_video {
            return Ok(());
        }

        let now = Local::now();
        let mut paths: Vec<PathBuf> = Vec::with_capacity(repeat as usize);
        for trial in 0..repeat {
            let mut vars = HashMap::new();
            vars.insert("animal".to_string(), animal_id.to_string());
            vars.insert("trial".to_string(), trial.to_string());
            let path = self
                .data_dir
                .join(expand_pattern(&self.name_pattern, &vars, now)?);
            if path.exists() || paths.contains(&path) {
                return Err(RigError::FileCollision(path));
            }
            paths.push(path);
        }

        let mut shared = lock(&self.shared);
        for path in paths {
            let writer = FrameWriter::new(path.clone(), spec.clone());
            shared.lanes.push(Some(FrameLane {
                frames: writer.frame_sender(),
                path: path.clone(),
            }));
            self.writers.push(Some(WriterSlot {
                device: share(writer),
                path,
            }));
        }
        Ok(())
    }

    /// Number of allocated writers.
    pub fn writer_count(&self) -> usize {
        self.writers.iter().flatten().count()
    }

    /// Target path of the writer for `index`, if allocated.
    pub fn writer_path(&self, index: usize) -> Option<&PathBuf> {
        self.writers
            .get(index)
            .and_then(Option::as_ref)
            .map(|slot| &slot.path)
    }

    /// Bring every allocated writer up as one ordered chain.
    pub async fn activate_all(&mut self) -> AppResult<()> {
        let devices: Vec<SharedDevice> = self
            .writers
            .iter()
            .flatten()
            .map(|slot| slot.device.clone())
            .collect();
        if devices.is_empty() {
            return Ok(());
        }
        let mut chain = ChainCoordinator::new(devices, ChainDirection::Activate);
        if let Some(timeout) = self.activation_timeout {
            chain = chain.with_timeout(timeout);
        }
        chain.run().await
    }

    /// Begin trial `index`: reset the event stamps and arm that trial's
    /// writer (when recording is enabled).
    pub fn start_trial(&mut self, index: usize) -> AppResult<()> {
        let mut shared = lock(&self.shared);
        shared.stats.reset();
        shared.current = None;
        if self.record_video {
            if self.writers.get(index).and_then(Option::as_ref).is_none() {
                return Err(RigError::Device(format!(
                    "no writer allocated for trial {index}"
                )));
            }
            shared.current = Some(index);
        }
        Ok(())
    }

    /// Stamp one event against the video-time cursor.
    pub fn mark_event(&self, key: EventKey) {
        let mut shared = lock(&self.shared);
        let cursor = shared.video_cursor;
        shared.stats.set(key, cursor);
    }

    /// The video-time cursor: timestamp of the most recent frame.
    pub fn video_cursor(&self) -> f64 {
        lock(&self.shared).video_cursor
    }

    /// Copy of the in-flight trial's event stamps.
    pub fn stats_snapshot(&self) -> TrialStats {
        lock(&self.shared).stats
    }

    /// Index of the armed trial writer, if any.
    pub fn current_trial(&self) -> Option<usize> {
        lock(&self.shared).current
    }

    /// End trial `index`: disarm and individually deactivate its writer,
    /// waiting until its queue is flushed. Each trial's writer is
    /// independent once started; only end-of-session teardown runs the
    /// remainder as a chain.
    pub async fn stop_trial(&mut self, index: usize) -> AppResult<()> {
        let slot = {
            let mut shared = lock(&self.shared);
            if shared.current == Some(index) {
                shared.current = None;
            }
            if let Some(lane) = shared.lanes.get_mut(index) {
                lane.take();
            }
            match self.writers.get_mut(index) {
                Some(slot) => slot.take(),
                None => None,
            }
        };
        let Some(slot) = slot else {
            return Ok(());
        };

        let state = slot.device.lock().await.state();
        match state {
            DeviceState::Active => {
                let mut chain =
                    ChainCoordinator::new(vec![slot.device], ChainDirection::Deactivate);
                if let Some(timeout) = self.deactivation_timeout {
                    chain = chain.with_timeout(timeout);
                }
                chain.run().await
            }
            DeviceState::Error => {
                // Footage for this trial is lost; the session keeps going.
                warn!(
                    "writer for '{}' already faulted; discarding",
                    slot.path.display()
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Deactivate any remaining writers as one chain and clear the list.
    pub async fn teardown(&mut self) -> AppResult<()> {
        {
            let mut shared = lock(&self.shared);
            shared.current = None;
            shared.lanes.clear();
        }
        let leftovers: Vec<Option<SharedDevice>> = self
            .writers
            .drain(..)
            .map(|slot| slot.map(|s| s.device))
            .collect();
        let mut chain = ChainCoordinator::from_optional(leftovers, ChainDirection::Deactivate);
        if chain.is_empty() {
            return Ok(());
        }
        if let Some(timeout) = self.deactivation_timeout {
            chain = chain.with_timeout(timeout);
        }
        chain.run().await
    }
}
