//! Configuration – reads/writes `~/.flake/config.toml`.

use flake_kernel::KernelConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted shell configuration stored in `~/.flake/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// How often a demo worker feeds its heartbeat watchdog.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Timeout of the heartbeat watchdog registered by each demo worker.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Stack size requested for demo workers spawned with `/spawn`.
    #[serde(default = "default_stack_size")]
    pub default_stack_size: usize,

    /// Orchestrator and allocator tunables.
    #[serde(default)]
    pub kernel: KernelConfig,
}

fn default_heartbeat_interval_ms() -> u64 {
    500
}
fn default_heartbeat_timeout_ms() -> u64 {
    2000
}
fn default_stack_size() -> usize {
    4096
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            default_stack_size: default_stack_size(),
            kernel: KernelConfig::default(),
        }
    }
}

/// Return the path to `~/.flake/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".flake").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
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

/// Apply `FLAKE_*` environment variable overrides to `cfg`.
///
/// Unparseable values are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `FLAKE_TICK_MS` | `kernel.tick_period_ms` |
/// | `FLAKE_SWEEP_BOUND_MS` | `kernel.sweep_lock_bound_ms` |
/// | `FLAKE_HEARTBEAT_MS` | `heartbeat_interval_ms` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("FLAKE_TICK_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.kernel.tick_period_ms = ms;
    }
    if let Ok(v) = std::env::var("FLAKE_SWEEP_BOUND_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.kernel.sweep_lock_bound_ms = ms;
    }
    if let Ok(v) = std::env::var("FLAKE_HEARTBEAT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.heartbeat_interval_ms = ms;
    }
}

/// Save the config to disk, creating `~/.flake/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
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
    // Owner-only read/write (rw-------) on Unix.
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
    use flake_types::Priority;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory must have 0o700 permissions");
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.kernel.kernel_priority, Priority::Critical);
        assert_eq!(loaded.kernel.memory.internal, 256 * 1024);
        assert_eq!(loaded.heartbeat_timeout_ms, 2000);
        assert_eq!(loaded.default_stack_size, 4096);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "heartbeat_timeout_ms = 750\n\n[kernel]\nlow_memory_threshold = 64\n")
            .expect("write");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.heartbeat_timeout_ms, 750);
        assert_eq!(loaded.kernel.low_memory_threshold, 64);
        assert_eq!(loaded.kernel.sweep_lock_bound_ms, 10);
        assert_eq!(loaded.default_stack_size, 4096);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "kernel = [not valid").expect("write");
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn config_path_points_to_flake_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".flake"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn apply_env_overrides_changes_tick_period() {
        // SAFETY: each env test touches its own variable.
        unsafe { std::env::set_var("FLAKE_TICK_MS", "20") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.kernel.tick_period_ms, 20);
        unsafe { std::env::remove_var("FLAKE_TICK_MS") };
    }

    #[test]
    fn apply_env_overrides_changes_heartbeat() {
        // SAFETY: each env test touches its own variable.
        unsafe { std::env::set_var("FLAKE_HEARTBEAT_MS", "125") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.heartbeat_interval_ms, 125);
        unsafe { std::env::remove_var("FLAKE_HEARTBEAT_MS") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_value() {
        // SAFETY: each env test touches its own variable.
        unsafe { std::env::set_var("FLAKE_SWEEP_BOUND_MS", "soon") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.kernel.sweep_lock_bound_ms, 10);
        unsafe { std::env::remove_var("FLAKE_SWEEP_BOUND_MS") };
    }
}
