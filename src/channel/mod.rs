// Channel module - duplex reconnecting message transport between
// cooperating processes on one host

pub mod client;
pub mod envelope;
pub mod server;

pub use client::{ChannelClient, ClientHandle, ClientOptions, ReconnectPolicy};
pub use envelope::{Envelope, EnvelopeKind, Sequencer, MAX_FRAME_LEN};
pub use server::{ChannelServer, ServerHandle};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Role a process plays at a channel endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessRole {
    Daemon,
    Sentinel,
    Client,
}

impl ProcessRole {
    /// The guardian this role watches over. Clients sit outside the
    /// supervision graph and have no counterpart.
    pub fn counterpart(&self) -> Option<ProcessRole> {
        match self {
            ProcessRole::Daemon => Some(ProcessRole::Sentinel),
            ProcessRole::Sentinel => Some(ProcessRole::Daemon),
            ProcessRole::Client => None,
        }
    }
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessRole::Daemon => write!(f, "daemon"),
            ProcessRole::Sentinel => write!(f, "sentinel"),
            ProcessRole::Client => write!(f, "client"),
        }
    }
}

/// Identifier for one accepted connection on a server, or one
/// connection attempt generation on a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a single attach. The logical relationship between two
/// endpoints outlives any individual connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Events surfaced by a channel endpoint. Transport failures arrive
/// here, never as panics or fatal errors in the caller.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    Message {
        conn: ConnectionId,
        envelope: Envelope,
    },
    Error {
        conn: Option<ConnectionId>,
        reason: String,
    },
}

/// Version-qualified channel identity.
///
/// The name is a stable hash of application identity and version, so
/// distinct versions never collide on the same socket or lock file and
/// can run side by side during an upgrade window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn derive(identity: &str, version: &str) -> Self {
        let digest = Sha256::digest(format!("{}/{}", identity, version).as_bytes());
        Self(format!("vg-{}", hex::encode(&digest[..8])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn socket_path(&self, runtime_dir: &Path) -> PathBuf {
        runtime_dir.join(format!("{}.sock", self.0))
    }

    pub fn lock_path(&self, runtime_dir: &Path) -> PathBuf {
        runtime_dir.join(format!("{}.lock", self.0))
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Anything that can emit sequenced envelopes: a client handle sends to
/// its server, a server handle broadcasts to every attached client.
pub trait EnvelopeSink: Send + Sync {
    fn send_envelope(&self, kind: EnvelopeKind, payload: Vec<u8>) -> Result<()>;
}

impl<T: EnvelopeSink + ?Sized> EnvelopeSink for std::sync::Arc<T> {
    fn send_envelope(&self, kind: EnvelopeKind, payload: Vec<u8>) -> Result<()> {
        (**self).send_envelope(kind, payload)
    }
}

impl<T: EnvelopeSink + ?Sized> EnvelopeSink for Box<T> {
    fn send_envelope(&self, kind: EnvelopeKind, payload: Vec<u8>) -> Result<()> {
        (**self).send_envelope(kind, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_is_deterministic() {
        let a = ChannelName::derive("vigil-content-filter", "1.2.3");
        let b = ChannelName::derive("vigil-content-filter", "1.2.3");
        assert_eq!(a, b);
    }

    #[test]
    fn test_channel_name_differs_across_versions() {
        let old = ChannelName::derive("vigil-content-filter", "1.2.3");
        let new = ChannelName::derive("vigil-content-filter", "1.3.0");
        assert_ne!(old, new);
    }

    #[test]
    fn test_channel_name_differs_across_identities() {
        let a = ChannelName::derive("service-a", "1.0.0");
        let b = ChannelName::derive("service-b", "1.0.0");
        assert_ne!(a, b);
    }

    #[test]
    fn test_socket_and_lock_paths_share_the_name() {
        let name = ChannelName::derive("vigil-content-filter", "1.0.0");
        let dir = Path::new("/tmp/vigil");
        assert!(name.socket_path(dir).to_string_lossy().ends_with(".sock"));
        assert!(name.lock_path(dir).to_string_lossy().ends_with(".lock"));
    }

    #[test]
    fn test_counterpart_roles() {
        assert_eq!(
            ProcessRole::Daemon.counterpart(),
            Some(ProcessRole::Sentinel)
        );
        assert_eq!(
            ProcessRole::Sentinel.counterpart(),
            Some(ProcessRole::Daemon)
        );
        assert_eq!(ProcessRole::Client.counterpart(), None);
    }
}
