//! The session timing skeleton.
//!
//! A session is described as an ordered list of named phases, each with a
//! duration in seconds. [`Timeline::build`] turns that list into cumulative
//! [`TimeSlice`]s so downstream consumers (progress displays, schedulers)
//! can ask "when does phase X begin" without re-summing. Building is pure:
//! no I/O, no clocks.

use serde::Serialize;

use crate::config::{ExperimentSettings, TrialConfigStore};
use crate::error::{AppResult, RigError};

/// One named, durationed segment of the session.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimeSlice {
    /// Phase name, unique within one timeline.
    pub name: String,
    /// Phase length in seconds; zero is legal and marks an instant.
    pub duration: f64,
    /// Sum of all preceding slice durations.
    pub start_offset: f64,
}

/// An ordered, cumulative sequence of time slices.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Timeline {
    slices: Vec<TimeSlice>,
}

impl Timeline {
    /// Build a timeline from `(name, duration)` phases.
    ///
    /// `start_offset` of slice *i* is the sum of durations `0..i`. A
    /// zero-duration phase yields a zero-width slice without disturbing
    /// the offsets of later slices.
    ///
    /// # Errors
    ///
    /// [`RigError::Configuration`] on a duplicate phase name or a negative
    /// duration.
    pub fn build<S: AsRef<str>>(phases: &[(S, f64)]) -> AppResult<Self> {
        let mut slices: Vec<TimeSlice> = Vec::with_capacity(phases.len());
        let mut cursor = 0.0;

        for (name, duration) in phases {
            let name = name.as_ref();
            if *duration < 0.0 {
                return Err(RigError::Configuration(format!(
                    "phase '{name}' has negative duration {duration}"
                )));
            }
            if slices.iter().any(|s| s.name == name) {
                return Err(RigError::Configuration(format!(
                    "duplicate timeline phase '{name}'"
                )));
            }
            slices.push(TimeSlice {
                name: name.to_string(),
                duration: *duration,
                start_offset: cursor,
            });
            cursor += duration;
        }
        Ok(Self { slices })
    }

    /// The slices, in order.
    pub fn slices(&self) -> &[TimeSlice] {
        &self.slices
    }

    /// Total session length in seconds.
    pub fn total_duration(&self) -> f64 {
        self.slices
            .last()
            .map_or(0.0, |s| s.start_offset + s.duration)
    }

    /// Look up a slice by name.
    pub fn slice(&self, name: &str) -> Option<&TimeSlice> {
        self.slices.iter().find(|s| s.name == name)
    }
}

/// The canonical seven-phase session skeleton.
///
/// The ITI phase uses the maximum ITI upper bound across every configured
/// trial type: the timeline is computed before a trial type is selected,
/// so it must accommodate the worst case.
pub fn session_phases(
    experiment: &ExperimentSettings,
    trial_opts: &TrialConfigStore,
    trial_duration: f64,
) -> Vec<(String, f64)> {
    vec![
        ("Init".to_string(), 0.0),
        ("Prehab".to_string(), experiment.prehab),
        ("Pre".to_string(), experiment.prerecord),
        ("Trial".to_string(), trial_duration),
        ("Post".to_string(), experiment.postrecord),
        ("ITI".to_string(), trial_opts.max_iti()),
        ("Posthab".to_string(), experiment.posthab),
    ]
}
