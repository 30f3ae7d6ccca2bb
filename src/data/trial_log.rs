//! The per-trial experiment log.
//!
//! One CSV row per completed trial, keyed by animal. The writer keeps one
//! open handle per resolved filename and rotates — close, then reopen in
//! append mode — whenever the resolved name changes (a new animal, or a
//! time directive rolling over). Existing files are never truncated; the
//! header row is written only when the file is first created. Every row
//! is flushed as it is written: a crashed rig must not cost more than the
//! trial in flight.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::info;

use crate::core::TrialStats;
use crate::data::expand_pattern;
use crate::error::{AppResult, RigError};

/// Fixed header of the trial log.
pub const LOG_HEADER: [&str; 10] = [
    "Date",
    "ID",
    "Type",
    "Trial",
    "TrialStart",
    "TrialEnd",
    "ToneStart",
    "ToneEnd",
    "ShockStart",
    "ShockEnd",
];

const DATE_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

/// Append-only structured log sink keyed by animal.
pub struct TrialLogWriter {
    data_dir: PathBuf,
    pattern: String,
    path: Option<PathBuf>,
    writer: Option<csv::Writer<File>>,
}

impl TrialLogWriter {
    /// Build a writer resolving names under `data_dir` from `pattern`.
    pub fn new(data_dir: PathBuf, pattern: impl Into<String>) -> Self {
        Self {
            data_dir,
            pattern: pattern.into(),
            path: None,
            writer: None,
        }
    }

    /// Path of the currently open log file, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one trial row, rotating first if the resolved filename
    /// changed. The row is flushed before this returns.
    ///
    /// # Errors
    ///
    /// A failed write closes the handle before surfacing — the experiment
    /// must not keep running against a dead log.
    pub fn append(
        &mut self,
        animal_id: &str,
        trial_type: &str,
        trial_index: usize,
        stats: &TrialStats,
        now: DateTime<Local>,
    ) -> AppResult<()> {
        let mut vars = HashMap::new();
        vars.insert("animal".to_string(), animal_id.to_string());
        let resolved = self.data_dir.join(expand_pattern(&self.pattern, &vars, now)?);

        if self.path.as_deref() != Some(resolved.as_path()) {
            self.rotate(resolved)?;
        }
        let writer = self.writer.as_mut().ok_or_else(|| {
            RigError::Log("no open log handle after rotation".to_string())
        })?;

        let row = [
            now.format(DATE_FORMAT).to_string(),
            animal_id.to_string(),
            trial_type.to_string(),
            trial_index.to_string(),
            stats.trial_start.to_string(),
            stats.trial_end.to_string(),
            stats.tone_start.to_string(),
            stats.tone_end.to_string(),
            stats.shock_start.to_string(),
            stats.shock_end.to_string(),
        ];
        let result = writer
            .write_record(&row)
            .map_err(|e| RigError::Log(e.to_string()))
            .and_then(|()| writer.flush().map_err(|e| RigError::Log(e.to_string())));
        if result.is_err() {
            self.writer = None;
            self.path = None;
        }
        result
    }

    fn rotate(&mut self, path: PathBuf) -> AppResult<()> {
        self.close()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let existed = path.exists();
        let file = OpenOptions::new().append(true).create(true).open(&path)?;
        let mut writer = csv::Writer::from_writer(file);
        if !existed {
            writer
                .write_record(LOG_HEADER)
                .and_then(|()| Ok(writer.flush()?))
                .map_err(|e| RigError::Log(e.to_string()))?;
        }
        info!(
            "trial log {} '{}'",
            if existed { "appending to" } else { "created at" },
            path.display()
        );
        self.writer = Some(writer);
        self.path = Some(path);
        Ok(())
    }

    /// Flush and close the current handle; the next append reopens.
    pub fn close(&mut self) -> AppResult<()> {
        self.path = None;
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| RigError::Log(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EventKey;
    use chrono::TimeZone;

    fn afternoon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 14, 30, 9).unwrap()
    }

    fn stats_with_tone() -> TrialStats {
        let mut stats = TrialStats::new();
        stats.set(EventKey::TrialStart, 2.0);
        stats.set(EventKey::ToneStart, 12.5);
        stats.set(EventKey::ToneEnd, 15.0);
        stats
    }

    #[test]
    fn test_header_then_exact_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TrialLogWriter::new(dir.path().to_path_buf(), "{animal}.csv");

        log.append("rat1", "control", 0, &stats_with_tone(), afternoon())
            .unwrap();

        let contents = std::fs::read_to_string(dir.path().join("rat1.csv")).unwrap();
        assert_eq!(
            contents,
            "Date,ID,Type,Trial,TrialStart,TrialEnd,ToneStart,ToneEnd,ShockStart,ShockEnd\n\
             03/05/2024 02:30:09 PM,rat1,control,0,2,-1,12.5,15,-1,-1\n"
        );
    }

    #[test]
    fn test_preexisting_file_gets_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rat1.csv");
        std::fs::write(&path, "old line\n").unwrap();

        let mut log = TrialLogWriter::new(dir.path().to_path_buf(), "{animal}.csv");
        log.append("rat1", "control", 0, &TrialStats::new(), afternoon())
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("old line\n"));
        assert!(!contents.contains("Date,ID"));
        assert!(contents.contains("03/05/2024 02:30:09 PM,rat1,control,0,-1,-1,-1,-1,-1,-1"));
    }

    #[test]
    fn test_rotation_on_animal_change_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TrialLogWriter::new(dir.path().to_path_buf(), "{animal}.csv");

        log.append("rat1", "control", 0, &TrialStats::new(), afternoon())
            .unwrap();
        log.append("rat2", "control", 0, &TrialStats::new(), afternoon())
            .unwrap();
        assert_eq!(log.current_path(), Some(dir.path().join("rat2.csv").as_path()));

        // Rotating back must append, not truncate.
        log.append("rat1", "control", 1, &TrialStats::new(), afternoon())
            .unwrap();
        let contents = std::fs::read_to_string(dir.path().join("rat1.csv")).unwrap();
        let rows: Vec<&str> = contents.lines().collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].starts_with("Date,"));
        assert!(rows[1].ends_with(",rat1,control,0,-1,-1,-1,-1,-1,-1"));
        assert!(rows[2].ends_with(",rat1,control,1,-1,-1,-1,-1,-1,-1"));
        // Second pass over rat1.csv sees an existing file: no second header.
        assert_eq!(contents.matches("Date,ID").count(), 1);
    }

    #[test]
    fn test_same_resolved_name_keeps_handle() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TrialLogWriter::new(dir.path().to_path_buf(), "{animal}.csv");

        log.append("rat1", "control", 0, &TrialStats::new(), afternoon())
            .unwrap();
        let first = log.current_path().map(Path::to_path_buf);
        log.append("rat1", "control", 1, &TrialStats::new(), afternoon())
            .unwrap();
        assert_eq!(log.current_path().map(Path::to_path_buf), first);
    }
}
