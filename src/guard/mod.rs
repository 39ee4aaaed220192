// ProcessGuard - marks the running process as critical to the OS so
// that forced termination is costly, with a serialized, idempotent
// toggle

use crate::error::{Result, VigilError};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

/// Platform seam for the critical-process marking. Implementations are
/// constructed explicitly and injected; there is no ambient registry.
pub trait CriticalToggle: Send + Sync {
    fn set_critical(&self, critical: bool) -> Result<()>;
}

/// Unix rendition of "critical process": pin the OOM score so the
/// kernel will sacrifice the rest of the session before this process.
pub struct OomScoreToggle {
    path: PathBuf,
}

impl OomScoreToggle {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/proc/self/oom_score_adj"),
        }
    }

    /// Redirect the score file, for tests
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl Default for OomScoreToggle {
    fn default() -> Self {
        Self::new()
    }
}

impl CriticalToggle for OomScoreToggle {
    fn set_critical(&self, critical: bool) -> Result<()> {
        let score = if critical { "-1000" } else { "0" };
        std::fs::write(&self.path, score).map_err(|e| {
            VigilError::ProtectionToggle(format!(
                "Failed to write {} to {}: {}",
                score,
                self.path.display(),
                e
            ))
        })
    }
}

/// Toggle that does nothing; used by tests and by platforms without a
/// critical-process facility.
pub struct NoopToggle;

impl CriticalToggle for NoopToggle {
    fn set_critical(&self, _critical: bool) -> Result<()> {
        Ok(())
    }
}

/// Synchronized wrapper around the OS toggle.
///
/// The flag always reflects the last successfully applied state, never
/// the attempted one, and the underlying toggle fires at most once per
/// desired state.
pub struct ProcessGuard {
    toggle: Box<dyn CriticalToggle>,
    protected: Mutex<bool>,
}

impl ProcessGuard {
    pub fn new(toggle: Box<dyn CriticalToggle>) -> Self {
        Self {
            toggle,
            protected: Mutex::new(false),
        }
    }

    /// Mark the process critical. Idempotent: a second call while
    /// already protected makes no OS call.
    pub fn enable_protection(&self) -> Result<()> {
        let mut protected = self.protected.lock().expect("protection lock poisoned");
        if *protected {
            return Ok(());
        }
        self.toggle.set_critical(true)?;
        *protected = true;
        info!("Process protection enabled");
        Ok(())
    }

    /// Unmark the process. Required before any voluntary exit; an exit
    /// while still protected is treated by the OS as catastrophic.
    pub fn disable_protection(&self) -> Result<()> {
        let mut protected = self.protected.lock().expect("protection lock poisoned");
        if !*protected {
            return Ok(());
        }
        self.toggle.set_critical(false)?;
        *protected = false;
        info!("Process protection disabled");
        Ok(())
    }

    pub fn is_protected(&self) -> bool {
        *self.protected.lock().expect("protection lock poisoned")
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if self.is_protected() {
            if let Err(e) = self.disable_protection() {
                warn!("Failed to disable protection on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts OS-level toggle invocations per direction
    struct CountingToggle {
        enables: Arc<AtomicUsize>,
        disables: Arc<AtomicUsize>,
        fail: bool,
    }

    impl CriticalToggle for CountingToggle {
        fn set_critical(&self, critical: bool) -> Result<()> {
            if self.fail {
                return Err(VigilError::ProtectionToggle("denied".to_string()));
            }
            if critical {
                self.enables.fetch_add(1, Ordering::SeqCst);
            } else {
                self.disables.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn counting_guard(fail: bool) -> (ProcessGuard, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let enables = Arc::new(AtomicUsize::new(0));
        let disables = Arc::new(AtomicUsize::new(0));
        let guard = ProcessGuard::new(Box::new(CountingToggle {
            enables: Arc::clone(&enables),
            disables: Arc::clone(&disables),
            fail,
        }));
        (guard, enables, disables)
    }

    #[test]
    fn test_enable_is_idempotent() {
        let (guard, enables, _) = counting_guard(false);

        guard.enable_protection().unwrap();
        guard.enable_protection().unwrap();

        assert_eq!(enables.load(Ordering::SeqCst), 1);
        assert!(guard.is_protected());
    }

    #[test]
    fn test_disable_without_enable_is_a_noop() {
        let (guard, _, disables) = counting_guard(false);

        guard.disable_protection().unwrap();

        assert_eq!(disables.load(Ordering::SeqCst), 0);
        assert!(!guard.is_protected());
    }

    #[test]
    fn test_full_cycle() {
        let (guard, enables, disables) = counting_guard(false);

        guard.enable_protection().unwrap();
        assert!(guard.is_protected());

        guard.disable_protection().unwrap();
        assert!(!guard.is_protected());

        guard.enable_protection().unwrap();
        assert!(guard.is_protected());

        assert_eq!(enables.load(Ordering::SeqCst), 2);
        assert_eq!(disables.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_toggle_leaves_state_unchanged() {
        let (guard, _, _) = counting_guard(true);

        let result = guard.enable_protection();
        assert!(matches!(result, Err(VigilError::ProtectionToggle(_))));
        // Flag reflects the last applied state, not the attempted one
        assert!(!guard.is_protected());
    }

    #[test]
    fn test_concurrent_enables_make_one_os_call() {
        let (guard, enables, _) = counting_guard(false);
        let guard = Arc::new(guard);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.enable_protection().unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(enables.load(Ordering::SeqCst), 1);
        assert!(guard.is_protected());
    }

    #[test]
    fn test_oom_toggle_writes_score_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oom_score_adj");
        std::fs::write(&path, "0").unwrap();

        let toggle = OomScoreToggle::with_path(&path);
        toggle.set_critical(true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "-1000");

        toggle.set_critical(false).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0");
    }
}
