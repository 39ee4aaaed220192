// Integration tests for the exit sequence: unprotect, release the
// token, notify the counterpart

use std::sync::Mutex;
use tempfile::TempDir;
use vigil::arbiter::InstanceArbiter;
use vigil::channel::{EnvelopeKind, EnvelopeSink};
use vigil::error::Result;
use vigil::guard::{NoopToggle, ProcessGuard};
use vigil::shutdown::{run_exit_sequence, ControlMessage, ShutdownOutcome};

#[derive(Default)]
struct CaptureSink {
    sent: Mutex<Vec<(EnvelopeKind, Vec<u8>)>>,
}

impl EnvelopeSink for CaptureSink {
    fn send_envelope(&self, kind: EnvelopeKind, payload: Vec<u8>) -> Result<()> {
        self.sent.lock().unwrap().push((kind, payload));
        Ok(())
    }
}

#[tokio::test]
async fn test_clean_stop_unprotects_releases_and_notifies() {
    let dir = TempDir::new().unwrap();
    let guard = ProcessGuard::new(Box::new(NoopToggle));
    let mut arbiter = InstanceArbiter::new(dir.path());
    let sink = CaptureSink::default();

    guard.enable_protection().unwrap();
    assert!(arbiter.try_acquire("test-app", "0.0.1").unwrap());

    let code = run_exit_sequence(
        ShutdownOutcome::StopWithSafeguards,
        &guard,
        &mut arbiter,
        Some(&sink),
    )
    .await;

    assert_eq!(code, 0);
    assert!(!guard.is_protected());
    assert!(!arbiter.is_held());

    let sent = sink.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (kind, payload) = &sent[0];
    assert_eq!(*kind, EnvelopeKind::Command);
    match ControlMessage::from_payload(payload).unwrap() {
        ControlMessage::ShutdownNotice { outcome, .. } => {
            assert_eq!(outcome, ShutdownOutcome::StopWithSafeguards);
        }
        other => panic!("Expected a shutdown notice, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_final_stop_notice_carries_the_outcome() {
    let dir = TempDir::new().unwrap();
    let guard = ProcessGuard::new(Box::new(NoopToggle));
    let mut arbiter = InstanceArbiter::new(dir.path());
    let sink = CaptureSink::default();

    let code = run_exit_sequence(
        ShutdownOutcome::StopWithoutSafeguards,
        &guard,
        &mut arbiter,
        Some(&sink),
    )
    .await;

    assert_eq!(code, 2);
    let sent = sink.sent.lock().unwrap();
    match ControlMessage::from_payload(&sent[0].1).unwrap() {
        ControlMessage::ShutdownNotice { outcome, .. } => {
            assert_eq!(outcome, ShutdownOutcome::StopWithoutSafeguards);
        }
        other => panic!("Expected a shutdown notice, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_critical_error_skips_the_sequence() {
    let dir = TempDir::new().unwrap();
    let guard = ProcessGuard::new(Box::new(NoopToggle));
    let mut arbiter = InstanceArbiter::new(dir.path());
    let sink = CaptureSink::default();

    guard.enable_protection().unwrap();
    assert!(arbiter.try_acquire("test-app", "0.0.1").unwrap());

    let code = run_exit_sequence(
        ShutdownOutcome::CriticalError,
        &guard,
        &mut arbiter,
        Some(&sink),
    )
    .await;

    // Protection stays on and the token stays held: the OS reaction to
    // a protected process dying is part of the deterrent, and the
    // flock dies with the process anyway
    assert_eq!(code, 1);
    assert!(guard.is_protected());
    assert!(arbiter.is_held());
    assert!(sink.sent.lock().unwrap().is_empty());

    // Leave the guard unprotected so its drop stays quiet
    guard.disable_protection().unwrap();
}

#[tokio::test]
async fn test_sequence_without_a_channel_still_exits_cleanly() {
    let dir = TempDir::new().unwrap();
    let guard = ProcessGuard::new(Box::new(NoopToggle));
    let mut arbiter = InstanceArbiter::new(dir.path());

    guard.enable_protection().unwrap();
    assert!(arbiter.try_acquire("test-app", "0.0.1").unwrap());

    let code =
        run_exit_sequence(ShutdownOutcome::StopForUpdate, &guard, &mut arbiter, None).await;

    assert_eq!(code, 3);
    assert!(!guard.is_protected());
    assert!(!arbiter.is_held());
}
