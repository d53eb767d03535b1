//! Configuration Vault – reads/writes `~/.medbot/config.toml`.

use medbot_sync::{AngleInference, PipelineConfig, ReconnectPolicy, SessionConfig};
use medbot_types::{JointKind, JointSpec};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Persisted operator configuration stored in `~/.medbot/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket endpoint of the joint command channel.
    #[serde(default = "default_command_url")]
    pub command_url: String,

    /// WebSocket endpoint that pushes telemetry invalidation triggers.
    /// Empty disables the telemetry snapshot.
    #[serde(default = "default_trigger_url")]
    pub trigger_url: String,

    /// HTTP endpoint serving the full telemetry snapshot.
    #[serde(default = "default_snapshot_url")]
    pub snapshot_url: String,

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Quiet period before an operator edit is sent.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    #[serde(default)]
    pub angle_inference: AngleInference,

    #[serde(default = "default_joints")]
    pub joints: Vec<JointSpec>,
}

fn default_command_url() -> String {
    "ws://localhost:8000/ws/joints".to_string()
}
fn default_trigger_url() -> String {
    "ws://localhost:8000/ws/telemetry".to_string()
}
fn default_snapshot_url() -> String {
    "http://localhost:8000/api/telemetry".to_string()
}
fn default_reconnect_base_ms() -> u64 {
    500
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}
fn default_debounce_ms() -> u64 {
    40
}
fn default_fetch_timeout_ms() -> u64 {
    5_000
}

/// Six-axis arm on a prismatic lift column.
fn default_joints() -> Vec<JointSpec> {
    vec![
        JointSpec::new("shoulder_pan", JointKind::Revolute, -170.0, 170.0).with_alias("j1"),
        JointSpec::new("shoulder_lift", JointKind::Revolute, -120.0, 120.0).with_alias("j2"),
        JointSpec::new("elbow", JointKind::Revolute, -150.0, 150.0).with_alias("j3"),
        JointSpec::new("wrist_pitch", JointKind::Revolute, -120.0, 120.0).with_alias("j4"),
        JointSpec::new("wrist_yaw", JointKind::Revolute, -170.0, 170.0).with_alias("j5"),
        JointSpec::new("wrist_roll", JointKind::Continuous, -360.0, 360.0).with_alias("j6"),
        JointSpec::new("lift", JointKind::Prismatic, 0.0, 400.0),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_url: default_command_url(),
            trigger_url: default_trigger_url(),
            snapshot_url: default_snapshot_url(),
            reconnect_base_ms: default_reconnect_base_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            debounce_ms: default_debounce_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            angle_inference: AngleInference::default(),
            joints: default_joints(),
        }
    }
}

impl Config {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_base_ms),
            self.max_reconnect_attempts,
        )
        .with_max_delay(Duration::from_millis(self.max_reconnect_delay_ms))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            endpoint: self.command_url.clone(),
            policy: self.reconnect_policy(),
            pipeline: PipelineConfig {
                debounce: Duration::from_millis(self.debounce_ms),
                angle_inference: self.angle_inference,
            },
        }
    }

    /// Both telemetry endpoints are configured.
    pub fn telemetry_enabled(&self) -> bool {
        !self.trigger_url.is_empty() && !self.snapshot_url.is_empty()
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Return the path to `~/.medbot/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".medbot").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `MEDBOT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MEDBOT_COMMAND_URL` | `command_url` |
/// | `MEDBOT_TRIGGER_URL` | `trigger_url` |
/// | `MEDBOT_SNAPSHOT_URL` | `snapshot_url` |
/// | `MEDBOT_RECONNECT_BASE_MS` | `reconnect_base_ms` |
/// | `MEDBOT_MAX_RECONNECT_ATTEMPTS` | `max_reconnect_attempts` |
/// | `MEDBOT_MAX_RECONNECT_DELAY_MS` | `max_reconnect_delay_ms` |
/// | `MEDBOT_DEBOUNCE_MS` | `debounce_ms` |
/// | `MEDBOT_FETCH_TIMEOUT_MS` | `fetch_timeout_ms` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("MEDBOT_COMMAND_URL") {
        cfg.command_url = v;
    }
    if let Ok(v) = std::env::var("MEDBOT_TRIGGER_URL") {
        cfg.trigger_url = v;
    }
    if let Ok(v) = std::env::var("MEDBOT_SNAPSHOT_URL") {
        cfg.snapshot_url = v;
    }
    if let Ok(v) = std::env::var("MEDBOT_RECONNECT_BASE_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.reconnect_base_ms = ms;
    }
    if let Ok(v) = std::env::var("MEDBOT_MAX_RECONNECT_ATTEMPTS")
        && let Ok(n) = v.parse::<u32>()
    {
        cfg.max_reconnect_attempts = n;
    }
    if let Ok(v) = std::env::var("MEDBOT_MAX_RECONNECT_DELAY_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.max_reconnect_delay_ms = ms;
    }
    if let Ok(v) = std::env::var("MEDBOT_DEBOUNCE_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.debounce_ms = ms;
    }
    if let Ok(v) = std::env::var("MEDBOT_FETCH_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.fetch_timeout_ms = ms;
    }
}

/// Save the config to disk, creating `~/.medbot/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.reconnect_base_ms, 500);
        assert_eq!(loaded.max_reconnect_attempts, 5);
        assert_eq!(loaded.debounce_ms, 40);
        assert_eq!(loaded.joints.len(), 7);
        assert_eq!(loaded.joints[0].aliases, vec!["j1".to_string()]);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
debounce_ms = 80
angle_inference = "degrees"

[[joints]]
id = "elbow"
kind = "revolute"
min = -90.0
max = 90.0
"#,
        )
        .unwrap();

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.debounce_ms, 80);
        assert_eq!(cfg.angle_inference, AngleInference::Degrees);
        assert_eq!(cfg.joints.len(), 1);
        assert!(cfg.joints[0].aliases.is_empty());
        assert_eq!(cfg.reconnect_base_ms, 500);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "debounce_ms = \"soon\"").unwrap();
        let err = load_from(&path).unwrap_err();
        assert!(err.contains("Failed to parse config"));
    }

    #[test]
    fn config_path_points_to_medbot_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".medbot"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn session_config_carries_timings() {
        let cfg = Config {
            reconnect_base_ms: 250,
            max_reconnect_attempts: 3,
            max_reconnect_delay_ms: 4_000,
            debounce_ms: 25,
            ..Config::default()
        };
        let session = cfg.session_config();
        assert_eq!(session.endpoint, cfg.command_url);
        assert_eq!(session.policy.base_interval, Duration::from_millis(250));
        assert_eq!(session.policy.max_attempts, 3);
        assert_eq!(session.policy.max_delay, Duration::from_secs(4));
        assert_eq!(session.pipeline.debounce, Duration::from_millis(25));
    }

    #[test]
    fn telemetry_requires_both_endpoints() {
        let mut cfg = Config::default();
        assert!(cfg.telemetry_enabled());
        cfg.trigger_url.clear();
        assert!(!cfg.telemetry_enabled());
    }

    #[test]
    fn apply_env_overrides_changes_command_url() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("MEDBOT_COMMAND_URL", "ws://robot-7:9000/ws") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.command_url, "ws://robot-7:9000/ws");
        unsafe { std::env::remove_var("MEDBOT_COMMAND_URL") };
    }

    #[test]
    fn apply_env_overrides_changes_snapshot_url() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("MEDBOT_SNAPSHOT_URL", "http://robot-7:9000/api/telemetry") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.snapshot_url, "http://robot-7:9000/api/telemetry");
        unsafe { std::env::remove_var("MEDBOT_SNAPSHOT_URL") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_attempts() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("MEDBOT_MAX_RECONNECT_ATTEMPTS", "many") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.max_reconnect_attempts, 5);
        unsafe { std::env::remove_var("MEDBOT_MAX_RECONNECT_ATTEMPTS") };
    }

    #[test]
    fn apply_env_overrides_changes_timeouts() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe {
            std::env::set_var("MEDBOT_MAX_RECONNECT_DELAY_MS", "2500");
            std::env::set_var("MEDBOT_FETCH_TIMEOUT_MS", "750");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.reconnect_policy().max_delay, Duration::from_millis(2500));
        assert_eq!(cfg.fetch_timeout(), Duration::from_millis(750));
        unsafe {
            std::env::remove_var("MEDBOT_MAX_RECONNECT_DELAY_MS");
            std::env::remove_var("MEDBOT_FETCH_TIMEOUT_MS");
        }
    }
}
