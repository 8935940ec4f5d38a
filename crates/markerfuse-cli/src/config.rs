//! Configuration – reads/writes `~/.markerfuse/config.toml`.

use markerfuse_perception::fusion::{DEFAULT_UPDATE_RATE, PoseFuser};
use markerfuse_perception::pairwise::{
    DEFAULT_ROTATION_SMOOTHING, DEFAULT_TRANSLATION_SMOOTHING, SmoothingConfig,
};
use markerfuse_runtime::pipeline::PipelineConfig;
use markerfuse_runtime::tracker::{
    DEFAULT_CAMERA_FRAME, DEFAULT_OBJECT_FRAME, DEFAULT_REFERENCE_ID, TrackerConfig,
};
use markerfuse_types::MarkerId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persisted tracker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Marker whose frame is the tracked object frame.
    #[serde(default = "default_reference_id")]
    pub reference_id: MarkerId,

    /// Weight kept on the accumulated edge translation, in `[0, 1)`.
    #[serde(default = "default_translation_smoothing")]
    pub translation_smoothing: f64,

    /// Weight kept on the accumulated edge rotation, in `[0, 1)`.
    #[serde(default = "default_rotation_smoothing")]
    pub rotation_smoothing: f64,

    /// Blend rate of each new fused pose, in `(0, 1]`.
    #[serde(default = "default_update_rate")]
    pub update_rate: f64,

    /// Learning phase length for `run`.
    #[serde(default = "default_calibration_window_secs")]
    pub calibration_window_secs: u64,

    /// Fusion timer period for `run`.
    #[serde(default = "default_fusion_interval_ms")]
    pub fusion_interval_ms: u64,

    /// Saved reference table.  Loaded by `run` when present, written after
    /// calibration otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_path: Option<PathBuf>,

    #[serde(default = "default_camera_frame_id")]
    pub camera_frame_id: String,

    #[serde(default = "default_object_frame_id")]
    pub object_frame_id: String,
}

fn default_reference_id() -> MarkerId {
    DEFAULT_REFERENCE_ID
}
fn default_translation_smoothing() -> f64 {
    DEFAULT_TRANSLATION_SMOOTHING
}
fn default_rotation_smoothing() -> f64 {
    DEFAULT_ROTATION_SMOOTHING
}
fn default_update_rate() -> f64 {
    DEFAULT_UPDATE_RATE
}
fn default_calibration_window_secs() -> u64 {
    120
}
fn default_fusion_interval_ms() -> u64 {
    100
}
fn default_camera_frame_id() -> String {
    DEFAULT_CAMERA_FRAME.to_string()
}
fn default_object_frame_id() -> String {
    DEFAULT_OBJECT_FRAME.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reference_id: default_reference_id(),
            translation_smoothing: default_translation_smoothing(),
            rotation_smoothing: default_rotation_smoothing(),
            update_rate: default_update_rate(),
            calibration_window_secs: default_calibration_window_secs(),
            fusion_interval_ms: default_fusion_interval_ms(),
            table_path: None,
            camera_frame_id: default_camera_frame_id(),
            object_frame_id: default_object_frame_id(),
        }
    }
}

impl Config {
    /// Check every value and build the runtime configuration.
    ///
    /// Runs before any frame is read, so a bad setting aborts startup.
    pub fn validate(&self) -> Result<(TrackerConfig, PipelineConfig), String> {
        let smoothing = SmoothingConfig::new(self.translation_smoothing, self.rotation_smoothing)
            .map_err(|e| format!("Invalid configuration: {e}"))?;
        PoseFuser::new(self.update_rate).map_err(|e| format!("Invalid configuration: {e}"))?;
        let pipeline = PipelineConfig::new(
            Duration::from_millis(self.fusion_interval_ms),
            Duration::from_secs(self.calibration_window_secs),
            self.table_path.clone(),
        )
        .map_err(|e| format!("Invalid configuration: {e}"))?;

        let tracker = TrackerConfig {
            reference_id: self.reference_id,
            smoothing,
            update_rate: self.update_rate,
            camera_frame_id: self.camera_frame_id.clone(),
            object_frame_id: self.object_frame_id.clone(),
        };
        Ok((tracker, pipeline))
    }
}

/// Return the path to `~/.markerfuse/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".markerfuse").join("config.toml")
}

/// Load the effective configuration: `path` (or the default location) if it
/// exists, defaults otherwise, then environment overrides.
pub fn load_effective(path: Option<&Path>) -> Result<Config, String> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    let mut cfg = load_from(&path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path.  `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `MARKERFUSE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MARKERFUSE_REFERENCE_ID` | `reference_id` |
/// | `MARKERFUSE_UPDATE_RATE` | `update_rate` |
/// | `MARKERFUSE_TABLE_PATH` | `table_path` |
/// | `MARKERFUSE_CALIBRATION_WINDOW_SECS` | `calibration_window_secs` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides_from(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("MARKERFUSE_REFERENCE_ID")
        && let Ok(id) = v.trim().parse::<MarkerId>()
    {
        cfg.reference_id = id;
    }
    if let Some(v) = lookup("MARKERFUSE_UPDATE_RATE")
        && let Ok(rate) = v.trim().parse::<f64>()
    {
        cfg.update_rate = rate;
    }
    if let Some(v) = lookup("MARKERFUSE_TABLE_PATH")
        && !v.is_empty()
    {
        cfg.table_path = Some(PathBuf::from(v));
    }
    if let Some(v) = lookup("MARKERFUSE_CALIBRATION_WINDOW_SECS")
        && let Ok(secs) = v.trim().parse::<u64>()
    {
        cfg.calibration_window_secs = secs;
    }
}

/// Write the default configuration to `path`.
///
/// An existing file is left alone unless `force` is set.
pub fn init_config(path: &Path, force: bool) -> Result<(), String> {
    if path.exists() && !force {
        return Err(format!(
            "Config already exists at {}; pass --force to overwrite",
            path.display()
        ));
    }
    save_to(&Config::default(), path)
}

/// Save the config to a specific path, creating parent directories.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))
}
