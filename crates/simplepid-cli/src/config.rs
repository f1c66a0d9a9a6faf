//! Configuration – reads/writes `~/.simplepid/config.toml`.
//!
//! ```toml
//! refresh_interval_secs = 10
//!
//! [[controllers]]
//! name = "boiler"
//! sensor_entity_id = "sensor.boiler_temperature"
//! output_range_min = 0.0
//! output_range_max = 100.0
//!
//! [controllers.parameters]
//! kp = 2.0
//! setpoint = 55.0
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use simplepid_runtime::{DeviceConfig, ParameterSeeds, RetryPolicy, RuntimeSettings};
use simplepid_types::PidError;

/// One `[[controllers]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(flatten)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub parameters: ParameterSeeds,
}

/// First-order plant driven by a controller's output in the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Process value the plant settles to with zero output.
    pub ambient: f64,
    /// Process value gained per unit of output at steady state.
    pub gain: f64,
    pub time_constant_secs: f64,
    pub step_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            ambient: 20.0,
            gain: 0.5,
            time_constant_secs: 30.0,
            step_ms: 1000,
        }
    }
}

/// Persisted configuration stored in `~/.simplepid/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Seconds between background refreshes; `0` refreshes on demand only.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    #[serde(default = "default_setup_retry_attempts")]
    pub setup_retry_attempts: u32,

    #[serde(default = "default_setup_retry_delay_ms")]
    pub setup_retry_delay_ms: u64,

    #[serde(default)]
    pub simulation: SimulationConfig,

    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
}

fn default_refresh_interval_secs() -> u64 {
    10
}
fn default_setup_retry_attempts() -> u32 {
    5
}
fn default_setup_retry_delay_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval_secs(),
            setup_retry_attempts: default_setup_retry_attempts(),
            setup_retry_delay_ms: default_setup_retry_delay_ms(),
            simulation: SimulationConfig::default(),
            controllers: vec![ControllerConfig {
                device: DeviceConfig::new("PID1", "sensor.process_value"),
                parameters: ParameterSeeds::default(),
            }],
        }
    }
}

impl Config {
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            refresh_interval: (self.refresh_interval_secs > 0)
                .then(|| Duration::from_secs(self.refresh_interval_secs)),
            retry: RetryPolicy {
                attempts: self.setup_retry_attempts,
                delay: Duration::from_millis(self.setup_retry_delay_ms),
            },
        }
    }

    pub fn controller(&self, name: &str) -> Option<&ControllerConfig> {
        self.controllers.iter().find(|c| c.device.name == name)
    }

    /// Reject duplicate names and inverted ranges.
    pub fn validate(&self) -> Result<(), PidError> {
        let mut seen = std::collections::HashSet::new();
        for c in &self.controllers {
            let d = &c.device;
            if !seen.insert(d.name.as_str()) {
                return Err(PidError::Config(format!("duplicate controller name '{}'", d.name)));
            }
            if d.input_range_min > d.input_range_max || d.output_range_min > d.output_range_max {
                return Err(PidError::Config(format!("controller '{}' has an inverted range", d.name)));
            }
        }
        Ok(())
    }
}

/// Return the path to `~/.simplepid/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".simplepid").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, PidError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, PidError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| PidError::Config(format!("failed to read {}: {e}", path.display())))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| PidError::Config(format!("failed to parse config: {e}")))?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Apply `SIMPLEPID_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SIMPLEPID_REFRESH_INTERVAL_SECS` | `refresh_interval_secs` |
/// | `SIMPLEPID_SETUP_RETRY_ATTEMPTS` | `setup_retry_attempts` |
/// | `SIMPLEPID_SETUP_RETRY_DELAY_MS` | `setup_retry_delay_ms` |
///
/// Unparsable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(v) = env_parse("SIMPLEPID_REFRESH_INTERVAL_SECS") {
        cfg.refresh_interval_secs = v;
    }
    if let Some(v) = env_parse("SIMPLEPID_SETUP_RETRY_ATTEMPTS") {
        cfg.setup_retry_attempts = v;
    }
    if let Some(v) = env_parse("SIMPLEPID_SETUP_RETRY_DELAY_MS") {
        cfg.setup_retry_delay_ms = v;
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Save the config to disk, creating `~/.simplepid/` if necessary.
pub fn save(cfg: &Config) -> Result<(), PidError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), PidError> {
    let io_err = |what: &str, e: std::io::Error| PidError::Config(format!("{what}: {e}"));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err("failed to create config directory", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| io_err("failed to set config directory permissions", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| PidError::Serialization(format!("failed to serialize config: {e}")))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| io_err(&format!("failed to write {}", path.display()), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| io_err(&format!("failed to write {}", path.display()), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use simplepid_types::{EntityId, Preset};

    #[test]
    fn parses_controllers_with_defaults() {
        let raw = r#"
            refresh_interval_secs = 5

            [[controllers]]
            name = "boiler"
            sensor_entity_id = "sensor.boiler_temperature"
            output_range_max = 1.0

            [controllers.parameters]
            kp = 2.0
            start_mode = "last_known_value"
        "#;
        let cfg: Config = toml::from_str(raw).expect("parse");
        assert_eq!(cfg.refresh_interval_secs, 5);
        assert_eq!(cfg.setup_retry_attempts, 5);

        let boiler = cfg.controller("boiler").expect("boiler");
        assert_eq!(
            boiler.device.sensor_entity_id,
            EntityId::from("sensor.boiler_temperature")
        );
        assert_eq!(boiler.device.input_range_max, 100.0);
        assert_eq!(boiler.device.output_range_min, 0.0);
        assert_eq!(boiler.device.output_range_max, 1.0);
        assert_eq!(boiler.parameters.kp, 2.0);
        assert_eq!(boiler.parameters.setpoint, 50.0);
        assert_eq!(boiler.parameters.start_mode, Preset::LastKnownValue);
    }

    #[test]
    fn runtime_settings_from_config() {
        let mut cfg = Config::default();
        let settings = cfg.runtime_settings();
        assert_eq!(settings.refresh_interval, Some(Duration::from_secs(10)));
        assert_eq!(settings.retry.attempts, 5);
        assert_eq!(settings.retry.delay, Duration::from_millis(1000));

        cfg.refresh_interval_secs = 0;
        assert_eq!(cfg.runtime_settings().refresh_interval, None);
    }

    #[test]
    fn validate_rejects_duplicates_and_inverted_ranges() {
        let mut cfg = Config::default();
        assert!(cfg.validate().is_ok());

        cfg.controllers.push(cfg.controllers[0].clone());
        assert!(matches!(cfg.validate(), Err(PidError::Config(_))));

        let mut cfg = Config::default();
        cfg.controllers[0].device.output_range_min = 5.0;
        cfg.controllers[0].device.output_range_max = 1.0;
        assert!(matches!(cfg.validate(), Err(PidError::Config(_))));
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config::default();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.controllers, cfg.controllers);
        assert_eq!(loaded.simulation, cfg.simulation);
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "refresh_interval_secs = \"soon\"").expect("write");
        assert!(matches!(load_from(&path), Err(PidError::Config(_))));
    }

    #[test]
    fn config_path_points_to_simplepid_dir() {
        let p = config_path_for_home("/home/operator");
        assert!(p.to_string_lossy().contains(".simplepid"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        // SAFETY: no other test touches these variables.
        unsafe {
            std::env::set_var("SIMPLEPID_REFRESH_INTERVAL_SECS", "3");
            std::env::set_var("SIMPLEPID_SETUP_RETRY_ATTEMPTS", "many");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.refresh_interval_secs, 3);
        assert_eq!(cfg.setup_retry_attempts, 5);
        unsafe {
            std::env::remove_var("SIMPLEPID_REFRESH_INTERVAL_SECS");
            std::env::remove_var("SIMPLEPID_SETUP_RETRY_ATTEMPTS");
        }
    }
}
