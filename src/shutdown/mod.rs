// ShutdownProtocol - the closed vocabulary of exit outcomes, carried
// both as process exit codes and as typed payloads on the channel

use crate::arbiter::InstanceArbiter;
use crate::channel::{EnvelopeKind, EnvelopeSink, ProcessRole};
use crate::error::{Result, VigilError};
use crate::guard::ProcessGuard;
use crate::supervision::LinkState;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// How a process exits, and what its supervisor should do about it.
///
/// The exit-code set is the only cross-process contract that works
/// without the channel: a crashed process cannot send messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownOutcome {
    /// Deliberate stop; supervisors should respawn (restart cycle)
    StopWithSafeguards,
    /// Unexpected fault; supervisors should respawn
    CriticalError,
    /// Deliberate, final stop; supervisors must not respawn
    StopWithoutSafeguards,
    /// Stopping so an update can replace the binary; respawn pauses
    /// for a bounded grace window
    StopForUpdate,
    /// Lost the instance arbitration; a twin of this exact version is
    /// already running
    DuplicateInstance,
}

impl ShutdownOutcome {
    pub fn as_exit_code(&self) -> i32 {
        match self {
            ShutdownOutcome::StopWithSafeguards => 0,
            ShutdownOutcome::CriticalError => 1,
            ShutdownOutcome::StopWithoutSafeguards => 2,
            ShutdownOutcome::StopForUpdate => 3,
            ShutdownOutcome::DuplicateInstance => 4,
        }
    }

    /// Decode an observed exit code. Unknown codes decode as
    /// `CriticalError`: a process that died without speaking the
    /// protocol is presumed faulted.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => ShutdownOutcome::StopWithSafeguards,
            2 => ShutdownOutcome::StopWithoutSafeguards,
            3 => ShutdownOutcome::StopForUpdate,
            4 => ShutdownOutcome::DuplicateInstance,
            _ => ShutdownOutcome::CriticalError,
        }
    }

    pub fn respawn_directive(&self) -> RespawnDirective {
        match self {
            ShutdownOutcome::StopWithSafeguards | ShutdownOutcome::CriticalError => {
                RespawnDirective::Respawn
            }
            ShutdownOutcome::StopWithoutSafeguards | ShutdownOutcome::DuplicateInstance => {
                RespawnDirective::Never
            }
            ShutdownOutcome::StopForUpdate => RespawnDirective::Pause,
        }
    }
}

impl std::fmt::Display for ShutdownOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownOutcome::StopWithSafeguards => write!(f, "stop-with-safeguards"),
            ShutdownOutcome::CriticalError => write!(f, "critical-error"),
            ShutdownOutcome::StopWithoutSafeguards => write!(f, "stop-without-safeguards"),
            ShutdownOutcome::StopForUpdate => write!(f, "stop-for-update"),
            ShutdownOutcome::DuplicateInstance => write!(f, "duplicate-instance"),
        }
    }
}

/// What an observer does when its counterpart announces an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespawnDirective {
    Respawn,
    Never,
    Pause,
}

/// Typed payloads riding inside `Command`/`StatusUpdate` envelopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// The sender is exiting with the given outcome
    ShutdownNotice {
        outcome: ShutdownOutcome,
        reason: Option<String>,
    },
    /// Ask the receiver to report its status
    StatusRequest,
    /// Status of one guardian process
    StatusReport {
        role: ProcessRole,
        link_state: LinkState,
        protected: bool,
        pid: u32,
        version: String,
    },
    /// Ask the receiver to exit with the given outcome
    StopRequest { outcome: ShutdownOutcome },
}

impl ControlMessage {
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            VigilError::Serialization(format!("Failed to serialize control message: {}", e))
        })
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| {
            VigilError::Deserialization(format!("Malformed control message: {}", e))
        })
    }
}

/// How long to let the channel writer flush a shutdown notice before
/// the process exits underneath it
const NOTIFY_FLUSH_WINDOW: Duration = Duration::from_millis(200);

/// Run the exit sequence and return the process exit code.
///
/// For any outcome other than `CriticalError`: disable protection,
/// release the arbitration token, and best-effort notify the
/// counterpart. A critical error leaves protection in place; the OS
/// reaction to a protected process dying is part of the deterrent.
pub async fn run_exit_sequence(
    outcome: ShutdownOutcome,
    guard: &ProcessGuard,
    arbiter: &mut InstanceArbiter,
    notify: Option<&dyn EnvelopeSink>,
) -> i32 {
    info!("Shutting down: {}", outcome);

    if outcome != ShutdownOutcome::CriticalError {
        if let Err(e) = guard.disable_protection() {
            warn!("Failed to disable protection during shutdown: {}", e);
        }
        if let Err(e) = arbiter.release() {
            warn!("Failed to release instance token during shutdown: {}", e);
        }
        if let Some(sink) = notify {
            let notice = ControlMessage::ShutdownNotice {
                outcome,
                reason: None,
            };
            match notice.to_payload() {
                Ok(payload) => {
                    if let Err(e) = sink.send_envelope(EnvelopeKind::Command, payload) {
                        warn!("Failed to notify counterpart of shutdown: {}", e);
                    } else {
                        // Give the writer loop a beat to flush the
                        // notice before the process exits
                        tokio::time::sleep(NOTIFY_FLUSH_WINDOW).await;
                    }
                }
                Err(e) => warn!("Failed to encode shutdown notice: {}", e),
            }
        }
    }

    outcome.as_exit_code()
}
