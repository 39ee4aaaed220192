use crate::channel::{ClientOptions, ProcessRole, ReconnectPolicy};
use crate::error::{Result, VigilError};
use crate::supervision::{LinkConfig, RespawnPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supervision tunables, loaded from a TOML file.
///
/// The heartbeat thresholds and backoff constants are deliberately
/// configuration rather than fixed contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionConfig {
    /// Directory for the socket and arbitration token files
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// Seconds between heartbeats from an observed process
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Consecutive missed beats before a link degrades
    #[serde(default = "default_degraded_after")]
    pub degraded_after_beats: u32,

    /// Further missed beats before a degraded link is lost
    #[serde(default = "default_lost_after")]
    pub lost_after_beats: u32,

    /// Seconds a freshly spawned counterpart gets to report in
    #[serde(default = "default_startup_grace")]
    pub startup_grace_secs: u64,

    /// Floor between respawn attempts (seconds)
    #[serde(default = "default_respawn_min_interval")]
    pub respawn_min_interval_secs: u64,

    /// Ceiling for respawn backoff after repeated failures (seconds)
    #[serde(default = "default_respawn_backoff_cap")]
    pub respawn_backoff_cap_secs: u64,

    /// How long respawn pauses while an update replaces the binary
    #[serde(default = "default_update_pause")]
    pub update_pause_secs: u64,

    /// First client reconnect delay (milliseconds)
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    /// Client reconnect backoff ceiling (seconds)
    #[serde(default = "default_reconnect_cap")]
    pub reconnect_cap_secs: u64,

    /// Messages queued on a disconnected client before the oldest are
    /// dropped
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,

    /// Binary launched when the daemon must be respawned
    #[serde(default = "default_daemon_binary")]
    pub daemon_binary: PathBuf,

    /// Binary launched when the sentinel must be respawned
    #[serde(default = "default_sentinel_binary")]
    pub sentinel_binary: PathBuf,

    /// Path this config was loaded from, forwarded to respawned
    /// counterparts
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

// Default value functions for serde
fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/tmp/vigil")
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_degraded_after() -> u32 {
    3
}

fn default_lost_after() -> u32 {
    2
}

fn default_startup_grace() -> u64 {
    10
}

fn default_respawn_min_interval() -> u64 {
    10
}

fn default_respawn_backoff_cap() -> u64 {
    60
}

fn default_update_pause() -> u64 {
    60
}

fn default_reconnect_initial() -> u64 {
    500
}

fn default_reconnect_cap() -> u64 {
    30
}

fn default_send_queue_depth() -> usize {
    64
}

fn default_daemon_binary() -> PathBuf {
    PathBuf::from("vigil-daemon")
}

fn default_sentinel_binary() -> PathBuf {
    PathBuf::from("vigil-sentinel")
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        // serde's defaults are the single source of truth
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl SupervisionConfig {
    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| VigilError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: SupervisionConfig = toml::from_str(&contents)
            .map_err(|e| VigilError::InvalidConfig(format!("Failed to parse config: {}", e)))?;

        config.config_path = Some(path.to_path_buf());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(VigilError::InvalidConfig(
                "heartbeat_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.degraded_after_beats == 0 || self.lost_after_beats == 0 {
            return Err(VigilError::InvalidConfig(
                "missed-beat thresholds must be at least 1".to_string(),
            ));
        }
        if self.respawn_min_interval_secs == 0 {
            return Err(VigilError::InvalidConfig(
                "respawn_min_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.send_queue_depth == 0 {
            return Err(VigilError::InvalidConfig(
                "send_queue_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn link_config(&self) -> LinkConfig {
        // A fresh counterpart gets its startup allowance plus one full
        // beat to report in
        let grace_ticks =
            self.startup_grace_secs.div_ceil(self.heartbeat_interval_secs).max(1) as u32 + 1;

        LinkConfig {
            heartbeat_interval: self.heartbeat_interval(),
            degraded_after: self.degraded_after_beats,
            lost_after: self.lost_after_beats,
            startup_grace_ticks: grace_ticks,
            update_pause: Duration::from_secs(self.update_pause_secs),
        }
    }

    pub fn respawn_policy(&self) -> RespawnPolicy {
        RespawnPolicy::from_config(self.respawn_min_interval_secs, self.respawn_backoff_cap_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial: Duration::from_millis(self.reconnect_initial_ms),
            cap: Duration::from_secs(self.reconnect_cap_secs),
        }
    }

    pub fn client_options(&self, auto_reconnect: bool) -> ClientOptions {
        ClientOptions {
            auto_reconnect,
            queue_depth: self.send_queue_depth,
            reconnect: self.reconnect_policy(),
        }
    }

    /// Binary to launch for the given guardian role
    pub fn binary_for(&self, role: ProcessRole) -> Option<&Path> {
        match role {
            ProcessRole::Daemon => Some(self.daemon_binary.as_path()),
            ProcessRole::Sentinel => Some(self.sentinel_binary.as_path()),
            ProcessRole::Client => None,
        }
    }

    /// Arguments passed to a respawned counterpart
    pub fn respawn_args(&self) -> Vec<String> {
        let mut args = vec!["--foreground".to_string()];
        if let Some(path) = &self.config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SupervisionConfig::default();
        assert_eq!(config.heartbeat_interval_secs, 5);
        assert_eq!(config.degraded_after_beats, 3);
        assert_eq!(config.lost_after_beats, 2);
        assert_eq!(config.respawn_min_interval_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, "heartbeat_interval_secs = 2\nsend_queue_depth = 16\n").unwrap();

        let config = SupervisionConfig::load(&path).unwrap();
        assert_eq!(config.heartbeat_interval_secs, 2);
        assert_eq!(config.send_queue_depth, 16);
        assert_eq!(config.degraded_after_beats, 3);
        assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, "heartbeat_interval_secs = 0\n").unwrap();

        assert!(matches!(
            SupervisionConfig::load(&path),
            Err(VigilError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_malformed_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, "not valid toml [[[").unwrap();

        assert!(matches!(
            SupervisionConfig::load(&path),
            Err(VigilError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_link_config_grace_ticks() {
        let config = SupervisionConfig::default();
        let link = config.link_config();
        // 10s grace at 5s beats: two beats plus one extra
        assert_eq!(link.startup_grace_ticks, 3);
        assert_eq!(link.heartbeat_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_respawn_args_carry_config_path() {
        let mut config = SupervisionConfig::default();
        assert_eq!(config.respawn_args(), vec!["--foreground".to_string()]);

        config.config_path = Some(PathBuf::from("/etc/vigil.toml"));
        let args = config.respawn_args();
        assert!(args.contains(&"--config".to_string()));
        assert!(args.contains(&"/etc/vigil.toml".to_string()));
    }

    #[test]
    fn test_binary_for_roles() {
        let config = SupervisionConfig::default();
        assert!(config.binary_for(ProcessRole::Daemon).is_some());
        assert!(config.binary_for(ProcessRole::Sentinel).is_some());
        assert!(config.binary_for(ProcessRole::Client).is_none());
    }
}
