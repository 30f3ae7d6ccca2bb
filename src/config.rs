//! Configuration loading and trial-option validation.
//!
//! Settings are layered with `figment`: compiled-in defaults, then an
//! optional TOML file, then `COND_RIG_`-prefixed environment variables.
//! Every section is a typed struct rejecting unknown keys, and semantic
//! validation (ITI ranges, phase durations) runs as a separate step after
//! extraction so logically invalid values never reach a running session.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::WriterSpec;
use crate::error::{AppResult, RigError};

// =============================================================================
// Trial Options
// =============================================================================

/// A stimulus window inside a trial: delay from trial start, then duration.
///
/// Serialized as a `(delay, duration)` pair to match the option shape the
/// rig has always used. A zero duration disables the stimulus.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct StimulusWindow {
    /// Seconds from trial start to stimulus onset.
    pub delay: f64,
    /// Stimulus length in seconds; zero disables it.
    pub duration: f64,
}

impl StimulusWindow {
    /// Whether this stimulus fires at all.
    pub fn enabled(&self) -> bool {
        self.duration > 0.0
    }

    /// Offset of the stimulus end relative to trial start.
    pub fn end(&self) -> f64 {
        self.delay + self.duration
    }
}

impl From<(f64, f64)> for StimulusWindow {
    fn from((delay, duration): (f64, f64)) -> Self {
        Self { delay, duration }
    }
}

impl From<StimulusWindow> for (f64, f64) {
    fn from(w: StimulusWindow) -> Self {
        (w.delay, w.duration)
    }
}

/// Inter-trial-interval bounds; a rest length is drawn uniformly from the
/// closed range.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct ItiRange {
    /// Minimum rest in seconds.
    pub min: f64,
    /// Maximum rest in seconds.
    pub max: f64,
}

impl ItiRange {
    /// Draw a rest length uniformly from `[min, max]`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        rng.gen_range(self.min..=self.max)
    }
}

impl From<(f64, f64)> for ItiRange {
    fn from((min, max): (f64, f64)) -> Self {
        Self { min, max }
    }
}

impl From<ItiRange> for (f64, f64) {
    fn from(r: ItiRange) -> Self {
        (r.min, r.max)
    }
}

/// The structure of one trial type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrialOptions {
    /// Number of trials to run; floored to 1 during normalization.
    pub repeat: u32,
    /// Trial length in seconds. Zero means the trial lasts exactly as long
    /// as its stimulus windows.
    pub duration: f64,
    /// Shock delay/duration window.
    pub shock: StimulusWindow,
    /// Tone delay/duration window.
    pub tone: StimulusWindow,
    /// Inter-trial-interval bounds.
    pub iti: ItiRange,
}

impl TrialOptions {
    fn normalize(&mut self, name: &str) -> AppResult<()> {
        if self.repeat < 1 {
            self.repeat = 1;
        }
        for (field, value) in [
            ("duration", self.duration),
            ("shock delay", self.shock.delay),
            ("shock duration", self.shock.duration),
            ("tone delay", self.tone.delay),
            ("tone duration", self.tone.duration),
            ("iti minimum", self.iti.min),
            ("iti maximum", self.iti.max),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(RigError::Configuration(format!(
                    "trial type '{name}': {field} must be a non-negative number, got {value}"
                )));
            }
        }
        if self.iti.min > self.iti.max {
            return Err(RigError::Configuration(format!(
                "trial type '{name}': iti minimum {} exceeds maximum {}",
                self.iti.min, self.iti.max
            )));
        }
        Ok(())
    }

    /// Offset of the last stimulus end, or zero with no stimuli enabled.
    pub fn stimulus_envelope(&self) -> f64 {
        let tone = if self.tone.enabled() { self.tone.end() } else { 0.0 };
        let shock = if self.shock.enabled() { self.shock.end() } else { 0.0 };
        tone.max(shock)
    }

    /// Effective trial length: the configured duration, stretched to cover
    /// every enabled stimulus window.
    pub fn trial_length(&self) -> f64 {
        self.duration.max(self.stimulus_envelope())
    }
}

/// Validated set of named trial-type definitions.
///
/// Normalization runs on construction and again on every replacement, so a
/// reloaded option set can never smuggle in an invalid record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialConfigStore {
    opts: BTreeMap<String, TrialOptions>,
}

impl TrialConfigStore {
    /// Build a store from raw records, normalizing them.
    pub fn new(opts: BTreeMap<String, TrialOptions>) -> AppResult<Self> {
        let mut store = Self { opts };
        store.normalize()?;
        Ok(store)
    }

    /// The rig's stock trial types: control, backward, and conditioning.
    pub fn with_defaults() -> Self {
        let mut opts = BTreeMap::new();
        opts.insert(
            "control".to_string(),
            TrialOptions {
                repeat: 3,
                duration: 15.0,
                shock: (0.0, 0.0).into(),
                tone: (0.0, 0.0).into(),
                iti: (45.0, 60.0).into(),
            },
        );
        opts.insert(
            "backward".to_string(),
            TrialOptions {
                repeat: 3,
                duration: 0.0,
                shock: (0.0, 3.0).into(),
                tone: (5.0, 3.0).into(),
                iti: (45.0, 60.0).into(),
            },
        );
        opts.insert(
            "condition".to_string(),
            TrialOptions {
                repeat: 3,
                duration: 0.0,
                shock: (2.0, 3.0).into(),
                tone: (0.0, 3.0).into(),
                iti: (45.0, 60.0).into(),
            },
        );
        Self { opts }
    }

    /// Replace the whole option set, re-normalizing.
    pub fn replace(&mut self, opts: BTreeMap<String, TrialOptions>) -> AppResult<()> {
        self.opts = opts;
        self.normalize()
    }

    /// Coerce every record to the documented invariants. Idempotent.
    pub fn normalize(&mut self) -> AppResult<()> {
        for (name, record) in &mut self.opts {
            record.normalize(name)?;
        }
        Ok(())
    }

    /// Look up the record for a trial-type name.
    pub fn select(&self, name: &str) -> AppResult<&TrialOptions> {
        self.opts
            .get(name)
            .ok_or_else(|| RigError::UnknownTrialType(name.to_string()))
    }

    /// The largest ITI upper bound across all configured trial types.
    pub fn max_iti(&self) -> f64 {
        self.opts.values().map(|o| o.iti.max).fold(0.0, f64::max)
    }

    /// Configured trial-type names, in stable order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.opts.keys().map(String::as_str)
    }
}

// =============================================================================
// Settings Sections
// =============================================================================

/// Session phase lengths and naming patterns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExperimentSettings {
    /// Habituation before the first trial, seconds.
    pub prehab: f64,
    /// Wind-down after the last trial, seconds.
    pub posthab: f64,
    /// Recording lead-in before each trial, seconds (in addition to ITI).
    pub prerecord: f64,
    /// Recording tail after each trial, seconds (in addition to ITI).
    pub postrecord: f64,
    /// Whether video is recorded at all.
    pub record_video: bool,
    /// Per-trial video filename template: `{animal}`/`{trial}` placeholders
    /// expanded first, then strftime directives.
    pub video_name_pat: String,
    /// Trial log filename template: `{animal}` then strftime.
    pub log_name_pat: String,
    /// The available trial types.
    pub trial_opts: TrialConfigStore,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self {
            prehab: 60.0,
            posthab: 60.0,
            prerecord: 5.0,
            postrecord: 5.0,
            record_video: true,
            video_name_pat: "{animal}_trial{trial}_%m-%d-%Y_%I-%M-%S_%p.avi".to_string(),
            log_name_pat: "{animal}_%m-%d-%Y_%I-%M-%S_%p.csv".to_string(),
            trial_opts: TrialConfigStore::with_defaults(),
        }
    }
}

/// Device-chain deadlines.
///
/// The observed rigs disagreed on the deactivation bound (five seconds in
/// one, unbounded in the other), so both deadlines are configuration
/// rather than constants.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ChainSettings {
    /// Deadline for a full activation pass; absent means unbounded.
    #[serde(with = "humantime_serde")]
    pub activation_timeout: Option<Duration>,
    /// Deadline for a full deactivation pass; absent means unbounded.
    #[serde(with = "humantime_serde")]
    pub deactivation_timeout: Option<Duration>,
}

impl ChainSettings {
    fn stock() -> Self {
        Self {
            activation_timeout: None,
            deactivation_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Video channel geometry and formats.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VideoSettings {
    /// Frame rate in Hz.
    pub rate: f64,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format delivered by the source.
    pub input_format: String,
    /// Pixel format written by the recorders; empty means same as input.
    pub output_format: String,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            rate: 30.0,
            width: 640,
            height: 480,
            input_format: "rgb24".to_string(),
            output_format: String::new(),
        }
    }
}

impl From<&VideoSettings> for WriterSpec {
    fn from(video: &VideoSettings) -> Self {
        WriterSpec {
            rate: video.rate,
            width: video.width,
            height: video.height,
            input_format: video.input_format.clone(),
            output_format: video.output_format.clone(),
        }
    }
}

/// Digital output pin assignments for the stimulus box.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DaqSettings {
    /// Output pin wired to the shocker.
    pub shocker_pin: u8,
    /// Output pin wired to the tone generator.
    pub tone_pin: u8,
    /// Output pin wired to the IR illuminator.
    pub ir_leds_pin: u8,
}

impl Default for DaqSettings {
    fn default() -> Self {
        Self {
            shocker_pin: 4,
            tone_pin: 5,
            ir_leds_pin: 6,
        }
    }
}

/// Where session output lands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageSettings {
    /// Directory for videos, logs, and manifests.
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Top-level application settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    /// Session phases, patterns, and trial types.
    pub experiment: ExperimentSettings,
    /// Chain deadlines.
    pub chain: ChainSettings,
    /// Video geometry.
    pub video: VideoSettings,
    /// Stimulus output pins.
    pub daq: DaqSettings,
    /// Output location.
    pub storage: StorageSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            experiment: ExperimentSettings::default(),
            chain: ChainSettings::stock(),
            video: VideoSettings::default(),
            daq: DaqSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file, and the
    /// environment, then validate.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let mut settings: Settings = figment
            .merge(Env::prefixed("COND_RIG_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Run semantic validation over all sections.
    pub fn validate(&mut self) -> AppResult<()> {
        self.experiment.trial_opts.normalize()?;
        for (field, value) in [
            ("prehab", self.experiment.prehab),
            ("posthab", self.experiment.posthab),
            ("prerecord", self.experiment.prerecord),
            ("postrecord", self.experiment.postrecord),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(RigError::Configuration(format!(
                    "experiment.{field} must be a non-negative number, got {value}"
                )));
            }
        }
        if !self.video.rate.is_finite() || self.video.rate <= 0.0 {
            return Err(RigError::Configuration(format!(
                "video.rate must be positive, got {}",
                self.video.rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_settings_validate() {
        let mut settings = Settings::default();
        settings.validate().unwrap();
        assert!(settings.experiment.record_video);
        assert_eq!(settings.chain.deactivation_timeout, Some(Duration::from_secs(5)));
        assert_eq!(settings.chain.activation_timeout, None);
    }

    #[test]
    fn test_control_record_normalizes_per_contract() {
        let store = TrialConfigStore::with_defaults();
        let control = store.select("control").unwrap();
        assert_eq!(control.repeat, 3);
        assert_eq!(control.duration, 15.0);
        assert_eq!(control.shock, StimulusWindow::from((0.0, 0.0)));
        assert_eq!(control.tone, StimulusWindow::from((0.0, 0.0)));
        assert_eq!(control.iti, ItiRange::from((45.0, 60.0)));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut store = TrialConfigStore::with_defaults();
        store.normalize().unwrap();
        let once = store.clone();
        store.normalize().unwrap();
        assert_eq!(store, once);
    }

    #[test]
    fn test_repeat_floored_to_one() {
        let mut opts = BTreeMap::new();
        opts.insert(
            "empty".to_string(),
            TrialOptions {
                repeat: 0,
                duration: 1.0,
                shock: (0.0, 0.0).into(),
                tone: (0.0, 0.0).into(),
                iti: (1.0, 2.0).into(),
            },
        );
        let store = TrialConfigStore::new(opts).unwrap();
        assert_eq!(store.select("empty").unwrap().repeat, 1);
    }

    #[test]
    fn test_inverted_iti_rejected() {
        let mut opts = BTreeMap::new();
        opts.insert(
            "bad".to_string(),
            TrialOptions {
                repeat: 1,
                duration: 1.0,
                shock: (0.0, 0.0).into(),
                tone: (0.0, 0.0).into(),
                iti: (10.0, 5.0).into(),
            },
        );
        let err = TrialConfigStore::new(opts).unwrap_err();
        assert!(matches!(err, RigError::Configuration(_)));
    }

    #[test]
    fn test_missing_field_is_config_error() {
        let raw = serde_json::json!({ "repeat": 2, "duration": 1.0 });
        assert!(serde_json::from_value::<TrialOptions>(raw).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let raw = serde_json::json!({
            "repeat": 2,
            "duration": 1.0,
            "shock": [0.0, 0.0],
            "tone": [0.0, 0.0],
            "iti": [1.0, 2.0],
            "surprise": true,
        });
        assert!(serde_json::from_value::<TrialOptions>(raw).is_err());
    }

    #[test]
    fn test_select_unknown_type() {
        let store = TrialConfigStore::with_defaults();
        let err = store.select("extinction").unwrap_err();
        assert!(matches!(err, RigError::UnknownTrialType(ref name) if name == "extinction"));
    }

    #[test]
    fn test_max_iti_scans_all_types() {
        let mut opts = BTreeMap::new();
        opts.insert(
            "short".to_string(),
            TrialOptions {
                repeat: 1,
                duration: 1.0,
                shock: (0.0, 0.0).into(),
                tone: (0.0, 0.0).into(),
                iti: (5.0, 10.0).into(),
            },
        );
        opts.insert(
            "long".to_string(),
            TrialOptions {
                repeat: 1,
                duration: 1.0,
                shock: (0.0, 0.0).into(),
                tone: (0.0, 0.0).into(),
                iti: (30.0, 90.0).into(),
            },
        );
        let store = TrialConfigStore::new(opts).unwrap();
        assert_eq!(store.max_iti(), 90.0);
    }

    #[test]
    fn test_iti_sampling_stays_in_range() {
        let range = ItiRange::from((45.0, 60.0));
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let iti = range.sample(&mut rng);
            assert!((45.0..=60.0).contains(&iti));
        }
    }

    #[test]
    fn test_trial_length_covers_stimuli() {
        let store = TrialConfigStore::with_defaults();
        // backward: tone ends at 5 + 3 = 8s, configured duration 0.
        assert_eq!(store.select("backward").unwrap().trial_length(), 8.0);
        // control: no stimuli, configured duration rules.
        assert_eq!(store.select("control").unwrap().trial_length(), 15.0);
    }
}
