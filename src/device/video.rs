//! Simulated video acquisition channel.
//!
//! Stands in for the frame grabber: while active it emits timestamped
//! frames at the configured rate on a broadcast channel, with `pts`
//! advancing monotonically by the frame interval. Grabber wire protocol
//! and codecs are out of scope; the payload is a flat buffer of the
//! configured geometry.

use async_trait::async_trait;
use bytes::Bytes;
use log::info;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::config::VideoSettings;
use crate::core::{Device, DeviceState, StateCell, VideoFrame};
use crate::error::{AppResult, RigError};

const FRAME_CHANNEL_DEPTH: usize = 256;

/// Frame-producing lifecycle device.
pub struct VideoChannel {
    id: String,
    state: StateCell,
    rate: f64,
    payload: Bytes,
    frames_tx: broadcast::Sender<VideoFrame>,
    stop: Option<watch::Sender<bool>>,
}

impl VideoChannel {
    /// Build a channel from the video settings.
    pub fn new(id: impl Into<String>, settings: &VideoSettings) -> Self {
        let (frames_tx, _) = broadcast::channel(FRAME_CHANNEL_DEPTH);
        let bytes_per_frame = (settings.width * settings.height * 3) as usize;
        Self {
            id: id.into(),
            state: StateCell::new(),
            rate: settings.rate,
            payload: Bytes::from(vec![0u8; bytes_per_frame]),
            frames_tx,
            stop: None,
        }
    }

    /// Frame rate in Hz.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Subscribe to the frame stream. Frames flow only while active.
    pub fn frames(&self) -> broadcast::Receiver<VideoFrame> {
        self.frames_tx.subscribe()
    }
}

#[async_trait]
impl Device for VideoChannel {
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

        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.stop = Some(stop_tx);

        let cell = self.state.clone();
        let frames_tx = self.frames_tx.clone();
        let payload = self.payload.clone();
        let step = 1.0 / self.rate;
        let id = self.id.clone();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs_f64(step));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut pts = 0.0;
            cell.set(DeviceState::Active);
            info!("{id}: frame source running at {:.1} fps", 1.0 / step);

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        // No receivers is fine; the pump may not be up yet.
                        let _ = frames_tx.send(VideoFrame {
                            pts,
                            data: payload.clone(),
                        });
                        pts += step;
                    }
                }
            }
            info!("{id}: frame source stopped at pts {pts:.3}");
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

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_settings() -> VideoSettings {
        VideoSettings {
            rate: 100.0,
            width: 4,
            height: 4,
            ..VideoSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_flow_with_monotonic_pts() {
        let mut channel = VideoChannel::new("player", &tiny_settings());
        let mut frames = channel.frames();
        channel.activate().await.unwrap();

        let mut last = f64::NEG_INFINITY;
        for _ in 0..5 {
            let frame = frames.recv().await.unwrap();
            assert!(frame.pts >= last);
            assert_eq!(frame.data.len(), 4 * 4 * 3);
            last = frame.pts;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_stops_the_stream() {
        let mut channel = VideoChannel::new("player", &tiny_settings());
        let mut rx = channel.state_channel();
        channel.activate().await.unwrap();
        rx.wait_for(|s| *s == DeviceState::Active).await.unwrap();

        channel.deactivate().await.unwrap();
        rx.wait_for(|s| *s == DeviceState::Inactive).await.unwrap();

        let mut frames = channel.frames();
        // Stream is quiet once the device reports inactive.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            frames.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
