//! Integration test for the per-trial recording flow without the engine:
//! allocate writers, chain them up, route frames, stamp events, stop the
//! trial, and log the row — the same sequence an external stage framework
//! would drive.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{Local, TimeZone};

use cond_rig::config::Settings;
use cond_rig::core::{EventKey, NullDisplay, TrialStats, WriterSpec};
use cond_rig::data::TrialLogWriter;
use cond_rig::session::RecordingSession;

fn settings(dir: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.experiment.video_name_pat = "{animal}_trial{trial}.avi".to_string();
    settings.storage.data_dir = dir.to_path_buf();
    settings
}

fn spec() -> WriterSpec {
    WriterSpec {
        rate: 30.0,
        width: 8,
        height: 8,
        input_format: "rgb24".to_string(),
        output_format: String::new(),
    }
}

#[tokio::test]
async fn test_stage_driven_trial_records_and_logs() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = RecordingSession::new(&settings(dir.path()), Arc::new(NullDisplay));
    let mut log = TrialLogWriter::new(dir.path().to_path_buf(), "{animal}.csv");

    session.allocate(&spec(), 2, "rat9").unwrap();
    session.activate_all().await.unwrap();
    let router = session.router();

    for trial in 0..2usize {
        session.start_trial(trial).unwrap();
        router.on_video_frame(trial as f64 * 10.0, Bytes::from_static(b"frame"));
        session.mark_event(EventKey::TrialStart);
        router.on_video_frame(trial as f64 * 10.0 + 1.0, Bytes::from_static(b"frame"));
        session.mark_event(EventKey::ToneStart);
        router.on_video_frame(trial as f64 * 10.0 + 2.0, Bytes::from_static(b"frame"));
        session.mark_event(EventKey::ToneEnd);
        session.mark_event(EventKey::TrialEnd);

        session.stop_trial(trial).await.unwrap();
        let stats = session.stats_snapshot();
        let when = Local.with_ymd_and_hms(2024, 7, 1, 9, 0, trial as u32).unwrap();
        log.append("rat9", "control", trial, &stats, when).unwrap();
    }
    session.teardown().await.unwrap();
    log.close().unwrap();

    // Each trial wrote its own footage.
    for trial in 0..2 {
        let footage = std::fs::read(dir.path().join(format!("rat9_trial{trial}.avi"))).unwrap();
        assert_eq!(footage.len(), 3 * 5);
    }

    // And one frame-accurate log row per trial.
    let contents = std::fs::read_to_string(dir.path().join("rat9.csv")).unwrap();
    let rows: Vec<&str> = contents.lines().collect();
    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows[1],
        "07/01/2024 09:00:00 AM,rat9,control,0,0,2,1,2,-1,-1"
    );
    assert_eq!(
        rows[2],
        "07/01/2024 09:00:01 AM,rat9,control,1,10,12,11,12,-1,-1"
    );
}

#[tokio::test]
async fn test_stats_never_mix_between_trials() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings.experiment.record_video = false;
    let mut session = RecordingSession::new(&settings, Arc::new(NullDisplay));
    let router = session.router();

    session.start_trial(0).unwrap();
    router.on_video_frame(5.0, Bytes::new());
    session.mark_event(EventKey::ShockStart);
    session.stop_trial(0).await.unwrap();

    session.start_trial(1).unwrap();
    let stats = session.stats_snapshot();
    assert_eq!(stats, TrialStats::new());
    assert_eq!(stats.shock_start, TrialStats::UNSET);
}
