//! Configuration – reads `~/.coilsweep/config.toml` (or `--config <path>`).

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use coilsweep_types::SweepError;
use serde::{Deserialize, Serialize};

/// Field, sensor and loop parameters.
///
/// Every field has a default, so a partial file (or no file at all) is
/// valid.  Values are only range-checked when the grid and loop are built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Meters per cell edge.
    pub resolution: f64,
    /// Cells along X.
    pub num_cells_in_x: i64,
    /// Cells along Y.
    pub num_cells_in_y: i64,
    /// Detection radius of one coil, in meters.
    pub detection_min_dist: f64,
    /// Wait for the start handshake before sweeping.
    pub is_simulation: bool,
    /// Driver loop rate.
    pub rate_hz: f64,
    /// Pause after a failed pose lookup.
    pub failure_backoff_ms: u64,
    /// Grid is drawn this far below the last coil height.
    pub clearance: f64,
    /// Frame the grid and coil poses are expressed in.
    pub reference_frame: String,
    /// Coil frames, in sampling order.
    pub coil_frames: Vec<String>,
    /// Transforms older than this count as unavailable.
    pub stale_after_ms: u64,
    /// Give up waiting for the start handshake after this long.  Unset waits
    /// forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_timeout_secs: Option<u64>,
    /// Failed lookups in a row before a coil is reported as lost.
    pub stale_warn_cycles: u32,
    /// Run the WebSocket bridge (transform ingest, coverage output).
    pub bridge_enabled: bool,
    /// Address the bridge listens on.
    pub bridge_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resolution: 0.1,
            num_cells_in_x: 100,
            num_cells_in_y: 100,
            detection_min_dist: 0.3,
            is_simulation: false,
            rate_hz: 30.0,
            failure_backoff_ms: 50,
            clearance: 0.30,
            reference_frame: "minefield".to_string(),
            coil_frames: vec![
                "left_coil".to_string(),
                "middle_coil".to_string(),
                "right_coil".to_string(),
            ],
            stale_after_ms: 500,
            start_timeout_secs: None,
            stale_warn_cycles: 30,
            bridge_enabled: true,
            bridge_addr: "127.0.0.1:9870".to_string(),
        }
    }
}

impl Config {
    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn start_timeout(&self) -> Option<Duration> {
        self.start_timeout_secs.map(Duration::from_secs)
    }

    /// Parsed [`bridge_addr`][Self::bridge_addr].
    ///
    /// # Errors
    ///
    /// [`SweepError::Config`] when the address is not `ip:port`.
    pub fn bridge_socket_addr(&self) -> Result<SocketAddr, SweepError> {
        self.bridge_addr.parse().map_err(|e| {
            SweepError::Config(format!("invalid bridge address {:?}: {e}", self.bridge_addr))
        })
    }
}

/// Return the path to `~/.coilsweep/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".coilsweep").join("config.toml")
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
///
/// # Errors
///
/// [`SweepError::Config`] when the file exists but cannot be read or parsed.
pub fn load_from(path: &Path) -> Result<Option<Config>, SweepError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        SweepError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| {
        SweepError::Config(format!("failed to parse {}: {e}", path.display()))
    })?;
    Ok(Some(cfg))
}

/// Write `cfg` to `path`, creating parent directories.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), SweepError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            SweepError::Config(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| SweepError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw)
        .map_err(|e| SweepError::Config(format!("failed to write {}: {e}", path.display())))
}

/// Apply `COILSWEEP_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `COILSWEEP_RESOLUTION` | `resolution` |
/// | `COILSWEEP_CELLS_X` | `num_cells_in_x` |
/// | `COILSWEEP_CELLS_Y` | `num_cells_in_y` |
/// | `COILSWEEP_DETECTION_DIST` | `detection_min_dist` |
/// | `COILSWEEP_RATE_HZ` | `rate_hz` |
/// | `COILSWEEP_SIMULATION` | `is_simulation` |
/// | `COILSWEEP_BRIDGE_ADDR` | `bridge_addr` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// Override logic behind [`apply_env_overrides`], with the variable lookup
/// injected.
pub(crate) fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
        var(key).and_then(|v| v.trim().parse().ok())
    }

    if let Some(v) = parsed(&var, "COILSWEEP_RESOLUTION") {
        cfg.resolution = v;
    }
    if let Some(v) = parsed(&var, "COILSWEEP_CELLS_X") {
        cfg.num_cells_in_x = v;
    }
    if let Some(v) = parsed(&var, "COILSWEEP_CELLS_Y") {
        cfg.num_cells_in_y = v;
    }
    if let Some(v) = parsed(&var, "COILSWEEP_DETECTION_DIST") {
        cfg.detection_min_dist = v;
    }
    if let Some(v) = parsed(&var, "COILSWEEP_RATE_HZ") {
        cfg.rate_hz = v;
    }
    if let Some(v) = parsed(&var, "COILSWEEP_SIMULATION") {
        cfg.is_simulation = v;
    }
    if let Some(v) = var("COILSWEEP_BRIDGE_ADDR") {
        cfg.bridge_addr = v.trim().to_string();
    }
}
