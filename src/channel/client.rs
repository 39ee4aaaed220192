// Channel client - attaches to a named endpoint and keeps the logical
// relationship alive across individual connection failures

use crate::channel::envelope::{
    read_frame, validate_size, write_frame, Envelope, EnvelopeKind, Sequencer,
};
use crate::channel::{ChannelEvent, ChannelName, ConnectionId, ConnectionState};
use crate::error::{Result, VigilError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Capacity of the event stream handed to the caller
const EVENT_QUEUE_DEPTH: usize = 256;

/// Bounded exponential backoff for reconnection attempts
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial.saturating_mul(factor).min(self.cap)
    }
}

/// Options for attaching to an endpoint
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub auto_reconnect: bool,
    pub queue_depth: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            queue_depth: 64,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

enum Cmd {
    Send(Envelope),
    Stop,
}

/// Channel client endpoint factory
pub struct ChannelClient;

impl ChannelClient {
    /// Attach to a named endpoint.
    ///
    /// With `auto_reconnect` the handle is returned even if the server
    /// is not up yet; the connection is established in the background
    /// and re-established after any drop until `stop()` is called.
    /// Without it, a failed first attempt is an error.
    pub async fn connect(
        name: &ChannelName,
        runtime_dir: &Path,
        options: ClientOptions,
    ) -> Result<(ClientHandle, mpsc::Receiver<ChannelEvent>)> {
        let path = name.socket_path(runtime_dir);

        let initial = match UnixStream::connect(&path).await {
            Ok(stream) => Some(stream),
            Err(e) if options.auto_reconnect => {
                debug!("Initial connect to {} failed, will retry: {}", path.display(), e);
                None
            }
            Err(e) => {
                return Err(VigilError::Transport(format!(
                    "Failed to connect to {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (cmd_tx, cmd_rx) = mpsc::channel(options.queue_depth.max(1) * 2);
        let initial_state = if initial.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Connecting
        };
        let (state_tx, state_rx) = watch::channel(initial_state);
        let seq = Arc::new(Sequencer::new());

        tokio::spawn(connection_loop(
            path, options, initial, cmd_rx, events_tx, state_tx,
        ));

        let handle = ClientHandle {
            cmd_tx,
            state_rx,
            seq,
        };

        Ok((handle, events_rx))
    }
}

/// Handle to a client endpoint. Cloneable; all clones feed the same
/// connection and share one sequence counter.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<Cmd>,
    state_rx: watch::Receiver<ConnectionState>,
    seq: Arc<Sequencer>,
}

impl ClientHandle {
    /// Build an envelope stamped with this endpoint's next sequence id
    pub fn envelope(&self, kind: EnvelopeKind, payload: Vec<u8>) -> Envelope {
        Envelope::new(self.seq.next(), kind, payload)
    }

    /// Send an envelope. While disconnected the envelope is queued, up
    /// to the configured depth, and flushed in order on reconnect.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        validate_size(&envelope)?;
        self.cmd_tx
            .try_send(Cmd::Send(envelope))
            .map_err(|_| VigilError::Transport("Send queue full or channel stopped".to_string()))
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watchable connection state, for callers that need to wait on
    /// Connected/Disconnected edges
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stop the endpoint. No reconnection is attempted afterwards.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Cmd::Stop).await;
    }
}

impl crate::channel::EnvelopeSink for ClientHandle {
    fn send_envelope(&self, kind: EnvelopeKind, payload: Vec<u8>) -> Result<()> {
        self.send(self.envelope(kind, payload))
    }
}

async fn connection_loop(
    path: PathBuf,
    options: ClientOptions,
    initial: Option<UnixStream>,
    mut cmd_rx: mpsc::Receiver<Cmd>,
    events: mpsc::Sender<ChannelEvent>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut pending: VecDeque<Envelope> = VecDeque::new();
    let mut generation: u64 = 0;
    let mut stream_slot = initial;

    loop {
        let stream = match stream_slot.take() {
            Some(stream) => stream,
            None => {
                let _ = state_tx.send(ConnectionState::Connecting);
                match wait_for_connection(&path, &options, &mut cmd_rx, &mut pending, &events).await
                {
                    Some(stream) => stream,
                    None => return,
                }
            }
        };

        generation += 1;
        let conn = ConnectionId(generation);
        let _ = state_tx.send(ConnectionState::Connected);
        let _ = events.send(ChannelEvent::Connected(conn)).await;

        let (read_half, mut write_half) = stream.into_split();

        // Reads run in their own task so a frame is never abandoned
        // halfway through reassembly
        let mut reader = tokio::spawn(read_task(conn, read_half, events.clone()));

        // Flush messages queued while disconnected, in send order. An
        // envelope that fails mid-write is dropped, not resent:
        // delivery is at-most-once.
        let mut broken = false;
        while let Some(envelope) = pending.pop_front() {
            if let Err(e) = write_frame(&mut write_half, &envelope).await {
                let _ = events
                    .send(ChannelEvent::Error {
                        conn: Some(conn),
                        reason: format!("Flush failed: {}", e),
                    })
                    .await;
                broken = true;
                break;
            }
        }

        while !broken {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Cmd::Send(envelope)) => {
                        if let Err(e) = write_frame(&mut write_half, &envelope).await {
                            let _ = events
                                .send(ChannelEvent::Error {
                                    conn: Some(conn),
                                    reason: format!("Write failed: {}", e),
                                })
                                .await;
                            broken = true;
                        }
                    }
                    Some(Cmd::Stop) | None => {
                        reader.abort();
                        let _ = state_tx.send(ConnectionState::Disconnected);
                        let _ = events.send(ChannelEvent::Disconnected(conn)).await;
                        return;
                    }
                },
                _ = &mut reader => broken = true,
            }
        }

        reader.abort();
        let _ = state_tx.send(ConnectionState::Disconnected);
        let _ = events.send(ChannelEvent::Disconnected(conn)).await;

        if !options.auto_reconnect {
            return;
        }
    }
}

/// Forward inbound frames as events until the stream closes or errors
async fn read_task(
    conn: ConnectionId,
    mut read_half: tokio::net::unix::OwnedReadHalf,
    events: mpsc::Sender<ChannelEvent>,
) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(envelope)) => {
                let _ = events.send(ChannelEvent::Message { conn, envelope }).await;
            }
            Ok(None) => break,
            Err(e) => {
                let _ = events
                    .send(ChannelEvent::Error {
                        conn: Some(conn),
                        reason: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }
}

/// Retry the connection with bounded exponential backoff, queueing any
/// sends that arrive in the meantime. Returns `None` when stopped.
async fn wait_for_connection(
    path: &Path,
    options: &ClientOptions,
    cmd_rx: &mut mpsc::Receiver<Cmd>,
    pending: &mut VecDeque<Envelope>,
    events: &mpsc::Sender<ChannelEvent>,
) -> Option<UnixStream> {
    let mut attempt: u32 = 0;

    loop {
        if let Ok(stream) = UnixStream::connect(path).await {
            return Some(stream);
        }

        let delay = options.reconnect.delay_for(attempt);
        attempt = attempt.saturating_add(1);
        debug!(
            "Reconnect attempt {} to {} failed, next try in {:?}",
            attempt,
            path.display(),
            delay
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Cmd::Send(envelope)) => {
                        enqueue(pending, envelope, options.queue_depth, events).await;
                    }
                    Some(Cmd::Stop) | None => return None,
                },
            }
        }
    }
}

/// Queue an envelope for the next connection. Past the depth bound the
/// oldest queued non-heartbeat is dropped and an error event raised.
async fn enqueue(
    pending: &mut VecDeque<Envelope>,
    envelope: Envelope,
    depth: usize,
    events: &mpsc::Sender<ChannelEvent>,
) {
    if pending.len() >= depth {
        let idx = pending.iter().position(|e| !e.is_heartbeat());
        let dropped = match idx {
            Some(i) => pending.remove(i),
            None => pending.pop_front(),
        };
        if let Some(dropped) = dropped {
            let _ = events
                .send(ChannelEvent::Error {
                    conn: None,
                    reason: format!(
                        "Send queue overflow, dropped queued {} envelope {}",
                        dropped.kind, dropped.id
                    ),
                })
                .await;
        }
    }
    pending.push_back(envelope);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_enqueue_drops_oldest_non_heartbeat_first() {
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let mut pending = VecDeque::new();

        pending.push_back(Envelope::new(1, EnvelopeKind::Heartbeat, Vec::new()));
        pending.push_back(Envelope::new(2, EnvelopeKind::Command, Vec::new()));
        pending.push_back(Envelope::new(3, EnvelopeKind::Command, Vec::new()));

        let extra = Envelope::new(4, EnvelopeKind::StatusUpdate, Vec::new());
        enqueue(&mut pending, extra, 3, &events_tx).await;

        // The oldest non-heartbeat (id 2) is gone, the heartbeat stays
        let ids: Vec<u64> = pending.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 3, 4]);

        match events_rx.recv().await {
            Some(ChannelEvent::Error { reason, .. }) => assert!(reason.contains("overflow")),
            other => panic!("Expected overflow error event, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_enqueue_drops_heartbeat_when_nothing_else_queued() {
        let (events_tx, _events_rx) = mpsc::channel(8);
        let mut pending = VecDeque::new();

        pending.push_back(Envelope::new(1, EnvelopeKind::Heartbeat, Vec::new()));
        pending.push_back(Envelope::new(2, EnvelopeKind::Heartbeat, Vec::new()));

        let extra = Envelope::new(3, EnvelopeKind::Heartbeat, Vec::new());
        enqueue(&mut pending, extra, 2, &events_tx).await;

        let ids: Vec<u64> = pending.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }
}
