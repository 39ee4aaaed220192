use crate::error::{Result, VigilError};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Rate cap and backoff for respawning a counterpart process.
///
/// The cap exists to stop a crash-restart storm: a counterpart that
/// dies on startup must not be relaunched in a tight loop.
#[derive(Debug, Clone, Copy)]
pub struct RespawnPolicy {
    /// Floor between consecutive respawn attempts
    pub min_interval: Duration,
    /// Ceiling for the backoff applied after consecutive failures
    pub backoff_cap: Duration,
}

impl RespawnPolicy {
    pub fn new() -> Self {
        Self {
            min_interval: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(60),
        }
    }

    pub fn from_config(min_interval_secs: u64, backoff_cap_secs: u64) -> Self {
        Self {
            min_interval: Duration::from_secs(min_interval_secs),
            backoff_cap: Duration::from_secs(backoff_cap_secs),
        }
    }
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks respawn attempts for one supervision link
#[derive(Debug, Clone, Default)]
pub struct RespawnTracker {
    last_attempt: Option<Instant>,
    consecutive_failures: u32,
    total_attempts: u64,
}

impl RespawnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long to wait before the next attempt is allowed.
    ///
    /// The first attempt is immediate; afterwards the policy floor
    /// applies, doubled per consecutive failure up to the cap.
    pub fn delay_until_next(&self, policy: &RespawnPolicy) -> Duration {
        let Some(last) = self.last_attempt else {
            return Duration::ZERO;
        };

        let factor = 2u32.saturating_pow(self.consecutive_failures.min(16));
        let floor = policy
            .min_interval
            .saturating_mul(factor)
            .min(policy.backoff_cap.max(policy.min_interval));

        floor.saturating_sub(last.elapsed())
    }

    pub fn record_attempt(&mut self) {
        self.last_attempt = Some(Instant::now());
        self.total_attempts += 1;
    }

    /// A fresh heartbeat arrived after an attempt
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// The attempt did not produce a live counterpart
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn total_attempts(&self) -> u64 {
        self.total_attempts
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Launch a counterpart process, detached from our stdio, and return
/// its pid. The child is not awaited; its liveness is observed through
/// heartbeats, not through the process handle.
pub async fn spawn_counterpart(binary: &Path, args: &[String]) -> Result<u32> {
    if binary.is_absolute() && !binary.exists() {
        return Err(VigilError::Spawn(
            binary.display().to_string(),
            "binary does not exist".to_string(),
        ));
    }

    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| VigilError::Spawn(binary.display().to_string(), e.to_string()))?;

    child.id().ok_or_else(|| {
        VigilError::Spawn(
            binary.display().to_string(),
            "process exited before a pid could be read".to_string(),
        )
    })
}
