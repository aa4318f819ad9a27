use std::{collections::HashSet, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{exercise::Exercise, ProtofitError, Result};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:5000/analyze";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    #[default]
    Mock,
    Opencv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub backend: CameraBackend,
    #[serde(default)]
    pub device_index: i32,
    /// Requested capture size; the device may pick something else.
    #[serde(default)]
    pub resolution: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub endpoint: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Unset means the HTTP client's own defaults apply.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub health_check: bool,
}

/// What a tick does while a previous request is still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InFlightPolicy {
    #[default]
    Skip,
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_refresh_hz")]
    pub refresh_hz: u32,
    #[serde(default)]
    pub in_flight: InFlightPolicy,
    #[serde(default = "Exercise::defaults")]
    pub exercises: Vec<Exercise>,
    #[serde(default)]
    pub default_exercise: Option<Exercise>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpsConfig {
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
    /// When set, every dispatched frame is also written here as a JPEG.
    #[serde(default)]
    pub capture_dir: Option<String>,
    /// Most recent bus events kept in memory by the telemetry store.
    #[serde(default = "default_telemetry_events")]
    pub telemetry_events: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtofitConfig {
    #[serde(default)]
    pub camera: CameraConfig,
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    pub ops: OpsConfig,
}

fn default_jpeg_quality() -> u8 {
    92
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_refresh_hz() -> u32 {
    60
}

fn default_telemetry_events() -> usize {
    1024
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: CameraBackend::default(),
            device_index: 0,
            resolution: None,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.into(),
            jpeg_quality: default_jpeg_quality(),
            request_timeout_ms: None,
            health_check: true,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            refresh_hz: default_refresh_hz(),
            in_flight: InFlightPolicy::default(),
            exercises: Exercise::defaults(),
            default_exercise: None,
        }
    }
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_file: None,
            capture_dir: None,
            telemetry_events: default_telemetry_events(),
        }
    }
}

impl Default for ProtofitConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            analysis: AnalysisConfig::default(),
            tracker: TrackerConfig::default(),
            ops: OpsConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Index of the exercise selected at startup.
    pub fn initial_selection(&self) -> usize {
        self.default_exercise
            .as_ref()
            .and_then(|wanted| self.exercises.iter().position(|e| e == wanted))
            .unwrap_or(0)
    }
}

impl ProtofitConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|err| {
            ProtofitError::Configuration(format!(
                "unable to read config file {}: {err}",
                path_ref.display()
            ))
        })?;
        toml::from_str(&contents).map_err(|err| {
            ProtofitError::Configuration(format!(
                "failed to parse config file {}: {err}",
                path_ref.display()
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        let endpoint = self.analysis.endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ProtofitError::Configuration(format!(
                "analysis.endpoint must be an http(s) URL, got '{endpoint}'"
            )));
        }
        if !(1..=100).contains(&self.analysis.jpeg_quality) {
            return Err(ProtofitError::Configuration(
                "analysis.jpeg_quality must be between 1 and 100".into(),
            ));
        }
        if self.analysis.request_timeout_ms == Some(0) {
            return Err(ProtofitError::Configuration(
                "analysis.request_timeout_ms must be greater than zero when set".into(),
            ));
        }
        if self.tracker.poll_interval_ms == 0 {
            return Err(ProtofitError::Configuration(
                "tracker.poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.tracker.refresh_hz == 0 {
            return Err(ProtofitError::Configuration(
                "tracker.refresh_hz must be greater than zero".into(),
            ));
        }
        if self.tracker.exercises.is_empty() {
            return Err(ProtofitError::Configuration(
                "tracker.exercises must list at least one exercise".into(),
            ));
        }
        let mut seen = HashSet::new();
        for exercise in &self.tracker.exercises {
            if exercise.as_str().trim().is_empty() {
                return Err(ProtofitError::Configuration(
                    "tracker.exercises must not contain empty labels".into(),
                ));
            }
            if !seen.insert(exercise.as_str()) {
                return Err(ProtofitError::Configuration(format!(
                    "tracker.exercises lists '{exercise}' more than once"
                )));
            }
        }
        if let Some(default) = &self.tracker.default_exercise {
            if !self.tracker.exercises.contains(default) {
                return Err(ProtofitError::Configuration(format!(
                    "tracker.default_exercise '{default}' is not one of tracker.exercises"
                )));
            }
        }
        if let Some((w, h)) = self.camera.resolution {
            if w == 0 || h == 0 {
                return Err(ProtofitError::Configuration(
                    "camera.resolution must be non-zero in both dimensions".into(),
                ));
            }
        }
        if self.ops.telemetry_events == 0 {
            return Err(ProtofitError::Configuration(
                "ops.telemetry_events must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
