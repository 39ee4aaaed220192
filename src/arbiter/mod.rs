// InstanceArbiter - deterministic single-instance arbitration via an
// exclusively locked file named by the version-qualified channel name

use crate::channel::ChannelName;
use crate::error::{Result, VigilError};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[cfg(unix)]
use nix::fcntl::{Flock, FlockArg};

/// A held arbitration token. Dropping it releases the OS-level lock.
#[cfg(unix)]
struct HeldToken {
    lock: Flock<File>,
    path: PathBuf,
}

#[cfg(not(unix))]
struct HeldToken {
    lock: File,
    path: PathBuf,
}

/// Single-instance arbiter for one process.
///
/// The token name is a stable hash of identity and version, so two
/// instances of the same version contend while distinct versions run
/// side by side during an upgrade window.
pub struct InstanceArbiter {
    runtime_dir: PathBuf,
    held: Option<HeldToken>,
}

impl InstanceArbiter {
    pub fn new<P: Into<PathBuf>>(runtime_dir: P) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            held: None,
        }
    }

    /// Try to become the sole instance for this identity and version.
    ///
    /// Never blocks. `Ok(false)` means another instance of this exact
    /// identity+version already holds the token; the caller must exit
    /// promptly with the duplicate-instance code. Access denial is
    /// treated the same way: fail closed, assume running.
    pub fn try_acquire(&mut self, identity: &str, version: &str) -> Result<bool> {
        if self.held.is_some() {
            return Ok(true);
        }

        let path = self.lock_path(identity, version);
        std::fs::create_dir_all(&self.runtime_dir)?;

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                warn!(
                    "Access denied opening arbitration token {}, assuming an instance is running",
                    path.display()
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        match Self::lock_exclusive(file) {
            LockOutcome::Acquired(mut token) => {
                // PID is recorded for diagnostics only; the flock is
                // the actual token
                let _ = token.lock.set_len(0);
                if let Err(e) = write!(token.lock, "{}", std::process::id()) {
                    debug!("Failed to record pid in token file: {}", e);
                }
                token.path = path;
                info!("Acquired instance token for {}/{}", identity, version);
                self.held = Some(token);
                Ok(true)
            }
            LockOutcome::Contended => {
                debug!(
                    "Instance token {} is held by another process",
                    path.display()
                );
                Ok(false)
            }
            LockOutcome::Denied => {
                warn!(
                    "Access denied locking arbitration token {}, assuming an instance is running",
                    path.display()
                );
                Ok(false)
            }
            LockOutcome::Failed(reason) => Err(VigilError::Arbitration(reason)),
        }
    }

    /// Release the token. Idempotent; safe to call without holding.
    pub fn release(&mut self) -> Result<()> {
        if let Some(token) = self.held.take() {
            let path = token.path.clone();
            drop(token);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("Failed to remove token file {}: {}", path.display(), e);
                }
            }
            info!("Released instance token");
        }
        Ok(())
    }

    /// Non-destructive probe: is another process holding the token for
    /// this identity+version? Holding it ourselves does not count.
    pub fn is_running_elsewhere(&self, identity: &str, version: &str) -> Result<bool> {
        let path = self.lock_path(identity, version);

        if let Some(held) = &self.held {
            if held.path == path {
                return Ok(false);
            }
        }

        if !path.exists() {
            return Ok(false);
        }

        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return Ok(true),
            Err(_) => return Ok(false),
        };

        match Self::lock_exclusive(file) {
            // Probe lock is dropped immediately; nothing was running
            LockOutcome::Acquired(_) => Ok(false),
            LockOutcome::Contended | LockOutcome::Denied => Ok(true),
            LockOutcome::Failed(reason) => Err(VigilError::Arbitration(reason)),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    pub fn lock_path(&self, identity: &str, version: &str) -> PathBuf {
        ChannelName::derive(identity, version).lock_path(&self.runtime_dir)
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    #[cfg(unix)]
    fn lock_exclusive(file: File) -> LockOutcome {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => LockOutcome::Acquired(HeldToken {
                lock,
                path: PathBuf::new(),
            }),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => LockOutcome::Contended,
            Err((_, nix::errno::Errno::EACCES)) | Err((_, nix::errno::Errno::EPERM)) => {
                LockOutcome::Denied
            }
            Err((_, errno)) => LockOutcome::Failed(format!("flock failed: {}", errno)),
        }
    }

    #[cfg(not(unix))]
    fn lock_exclusive(file: File) -> LockOutcome {
        // Without flock the file's existence is the best available
        // token; creation already succeeded, so treat it as acquired
        LockOutcome::Acquired(HeldToken {
            lock: file,
            path: PathBuf::new(),
        })
    }
}

impl Drop for InstanceArbiter {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

enum LockOutcome {
    Acquired(HeldToken),
    Contended,
    Denied,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_then_reacquire_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut arbiter = InstanceArbiter::new(dir.path());

        assert!(arbiter.try_acquire("test-app", "1.0.0").unwrap());
        assert!(arbiter.try_acquire("test-app", "1.0.0").unwrap());
        assert!(arbiter.is_held());
    }

    #[test]
    fn test_second_instance_same_version_is_denied() {
        let dir = TempDir::new().unwrap();
        let mut first = InstanceArbiter::new(dir.path());
        let mut second = InstanceArbiter::new(dir.path());

        assert!(first.try_acquire("test-app", "1.0.0").unwrap());
        assert!(!second.try_acquire("test-app", "1.0.0").unwrap());
        assert!(!second.is_held());
    }

    #[test]
    fn test_distinct_versions_never_contend() {
        let dir = TempDir::new().unwrap();
        let mut old = InstanceArbiter::new(dir.path());
        let mut new = InstanceArbiter::new(dir.path());

        assert!(old.try_acquire("test-app", "1.0.0").unwrap());
        assert!(new.try_acquire("test-app", "1.1.0").unwrap());
    }

    #[test]
    fn test_release_frees_the_token() {
        let dir = TempDir::new().unwrap();
        let mut first = InstanceArbiter::new(dir.path());
        let mut second = InstanceArbiter::new(dir.path());

        assert!(first.try_acquire("test-app", "1.0.0").unwrap());
        first.release().unwrap();

        assert!(second.try_acquire("test-app", "1.0.0").unwrap());
    }

    #[test]
    fn test_release_without_holding_is_safe() {
        let dir = TempDir::new().unwrap();
        let mut arbiter = InstanceArbiter::new(dir.path());
        arbiter.release().unwrap();
        arbiter.release().unwrap();
    }

    #[test]
    fn test_drop_releases_the_token() {
        let dir = TempDir::new().unwrap();
        {
            let mut first = InstanceArbiter::new(dir.path());
            assert!(first.try_acquire("test-app", "1.0.0").unwrap());
        }
        let mut second = InstanceArbiter::new(dir.path());
        assert!(second.try_acquire("test-app", "1.0.0").unwrap());
    }

    #[test]
    fn test_probe_does_not_steal_the_token() {
        let dir = TempDir::new().unwrap();
        let mut holder = InstanceArbiter::new(dir.path());
        let prober = InstanceArbiter::new(dir.path());

        assert!(holder.try_acquire("test-app", "1.0.0").unwrap());
        assert!(prober.is_running_elsewhere("test-app", "1.0.0").unwrap());
        // Holder still owns the token after the probe
        assert!(holder.is_held());

        let mut second = InstanceArbiter::new(dir.path());
        assert!(!second.try_acquire("test-app", "1.0.0").unwrap());
    }

    #[test]
    fn test_probe_ignores_own_token() {
        let dir = TempDir::new().unwrap();
        let mut holder = InstanceArbiter::new(dir.path());

        assert!(holder.try_acquire("test-app", "1.0.0").unwrap());
        assert!(!holder.is_running_elsewhere("test-app", "1.0.0").unwrap());
    }

    #[test]
    fn test_probe_with_no_token_reports_not_running() {
        let dir = TempDir::new().unwrap();
        let arbiter = InstanceArbiter::new(dir.path());
        assert!(!arbiter.is_running_elsewhere("test-app", "1.0.0").unwrap());
    }
}
