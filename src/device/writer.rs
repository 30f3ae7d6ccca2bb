//! Per-trial video frame writer.
//!
//! One writer is allocated per trial and owns one output file. Frames
//! arrive on a bounded queue so the delivery hot path never blocks on
//! disk; the drain task writes them out and the queue is fully flushed
//! before the device reports `Inactive`. Payloads are written as-is —
//! encoding is outside this crate.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{error, info};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, watch};

use crate::core::{Device, DeviceState, StateCell, VideoFrame, WriterSpec};
use crate::error::{AppResult, RigError};

const FRAME_QUEUE_DEPTH: usize = 64;

/// Writes one trial's frames to one file.
pub struct FrameWriter {
    id: String,
    path: PathBuf,
    spec: WriterSpec,
    state: StateCell,
    frames_tx: mpsc::Sender<VideoFrame>,
    frames_rx: Option<mpsc::Receiver<VideoFrame>>,
    stop: Option<watch::Sender<bool>>,
}

impl FrameWriter {
    /// Build a writer targeting `path`.
    pub fn new(path: PathBuf, spec: WriterSpec) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "writer".to_string());
        Self {
            id,
            path,
            spec,
            state: StateCell::new(),
            frames_tx,
            frames_rx: Some(frames_rx),
            stop: None,
        }
    }

    /// The queue end handed to the frame router.
    pub fn frame_sender(&self) -> mpsc::Sender<VideoFrame> {
        self.frames_tx.clone()
    }

    /// Target file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writer construction parameters.
    pub fn spec(&self) -> &WriterSpec {
        &self.spec
    }
}

#[async_trait]
impl Device for FrameWriter {
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
        let mut frames_rx = self.frames_rx.take().ok_or_else(|| {
            RigError::Device(format!("'{}' was already run once", self.id))
        })?;
        self.state.set(DeviceState::Activating);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.stop = Some(stop_tx);

        let cell = self.state.clone();
        let path = self.path.clone();
        let id = self.id.clone();

        tokio::spawn(async move {
            // create_new backstops the session's collision check: footage
            // is never silently overwritten even if a file appeared since.
            let file = match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(err) => {
                    error!("{id}: cannot open '{}': {err}", path.display());
                    cell.set(DeviceState::Error);
                    return;
                }
            };
            let mut out = BufWriter::new(file);
            cell.set(DeviceState::Active);
            info!("{id}: recording to '{}'", path.display());

            let mut frames_written = 0u64;
            let failed = loop {
                tokio::select! {
                    _ = stop_rx.changed() => break false,
                    frame = frames_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(err) = out.write_all(&frame.data).await {
                                error!("{id}: write failed: {err}");
                                break true;
                            }
                            frames_written += 1;
                        }
                        None => break false,
                    },
                }
            };
            if failed {
                cell.set(DeviceState::Error);
                return;
            }

            // Drain whatever the router managed to enqueue before stop.
            while let Ok(frame) = frames_rx.try_recv() {
                if let Err(err) = out.write_all(&frame.data).await {
                    error!("{id}: write failed during drain: {err}");
                    cell.set(DeviceState::Error);
                    return;
                }
                frames_written += 1;
            }
            if let Err(err) = out.flush().await {
                error!("{id}: flush failed: {err}");
                cell.set(DeviceState::Error);
                return;
            }
            info!("{id}: closed after {frames_written} frames");
            cell.set(DeviceState::Inactive);
        });
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
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        Ok(())
    }
}
