// Channel server - hosts the named endpoint and fans envelopes
// in/out of every attached client connection

use crate::channel::envelope::{
    read_frame, validate_size, write_frame, Envelope, EnvelopeKind, Sequencer,
};
use crate::channel::{ChannelEvent, ChannelName, ConnectionId};
use crate::error::{Result, VigilError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capacity of the event stream handed to the caller
const EVENT_QUEUE_DEPTH: usize = 256;

/// Per-connection outbound queue depth
const CONN_QUEUE_DEPTH: usize = 64;

type ConnMap = Arc<Mutex<HashMap<ConnectionId, mpsc::Sender<Envelope>>>>;

/// Channel server endpoint factory
pub struct ChannelServer;

impl ChannelServer {
    /// Bind the version-qualified socket and start accepting clients.
    ///
    /// Must be called from within a tokio runtime. A stale socket file
    /// left by a crashed predecessor is removed before binding.
    pub fn bind(
        name: &ChannelName,
        runtime_dir: &Path,
    ) -> Result<(ServerHandle, mpsc::Receiver<ChannelEvent>)> {
        std::fs::create_dir_all(runtime_dir)?;

        let socket_path = name.socket_path(runtime_dir);
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| {
                VigilError::Transport(format!("Failed to remove stale socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| VigilError::Transport(format!("Failed to bind to socket: {}", e)))?;

        // Socket is reachable by the owning user only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&socket_path, permissions).map_err(|e| {
                VigilError::Transport(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let conns: ConnMap = Arc::new(Mutex::new(HashMap::new()));
        let conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let seq = Arc::new(Sequencer::new());

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&conns),
            Arc::clone(&conn_tasks),
            Arc::clone(&seq),
            events_tx,
        ));

        let handle = ServerHandle {
            socket_path,
            conns,
            conn_tasks,
            seq,
            accept_task,
        };

        Ok((handle, events_rx))
    }
}

/// Handle to a running server endpoint
pub struct ServerHandle {
    socket_path: PathBuf,
    conns: ConnMap,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    seq: Arc<Sequencer>,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    /// Build an envelope stamped with this endpoint's next sequence id
    pub fn envelope(&self, kind: EnvelopeKind, payload: Vec<u8>) -> Envelope {
        Envelope::new(self.seq.next(), kind, payload)
    }

    /// Send to one connection. Fails if the connection is gone or its
    /// write queue is full; a stalled client never blocks the caller.
    pub fn send(&self, conn: ConnectionId, envelope: Envelope) -> Result<()> {
        validate_size(&envelope)?;

        let tx = self
            .conns
            .lock()
            .expect("connection map lock poisoned")
            .get(&conn)
            .cloned()
            .ok_or_else(|| VigilError::Transport(format!("Unknown connection: {}", conn)))?;

        tx.try_send(envelope)
            .map_err(|_| VigilError::Transport(format!("Connection {} queue full or closed", conn)))
    }

    /// Send to every attached connection, returning how many accepted
    /// the envelope into their write queue.
    pub fn broadcast(&self, envelope: Envelope) -> Result<usize> {
        validate_size(&envelope)?;

        let txs: Vec<_> = self
            .conns
            .lock()
            .expect("connection map lock poisoned")
            .values()
            .cloned()
            .collect();

        let mut delivered = 0;
        for tx in txs {
            if tx.try_send(envelope.clone()).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    pub fn connection_count(&self) -> usize {
        self.conns
            .lock()
            .expect("connection map lock poisoned")
            .len()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stop accepting, drop all connections, remove the socket file.
    /// The endpoint can be re-bound afterwards without leaking handles.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        for task in self
            .conn_tasks
            .lock()
            .expect("connection task lock poisoned")
            .drain(..)
        {
            task.abort();
        }
        self.conns
            .lock()
            .expect("connection map lock poisoned")
            .clear();
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!("Failed to remove socket file on shutdown: {}", e);
            }
        }
    }
}

impl crate::channel::EnvelopeSink for ServerHandle {
    fn send_envelope(&self, kind: EnvelopeKind, payload: Vec<u8>) -> Result<()> {
        let envelope = self.envelope(kind, payload);
        self.broadcast(envelope).map(|_| ())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: UnixListener,
    conns: ConnMap,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    seq: Arc<Sequencer>,
    events: mpsc::Sender<ChannelEvent>,
) {
    let mut next_conn: u64 = 1;

    loop {
        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                let _ = events
                    .send(ChannelEvent::Error {
                        conn: None,
                        reason: format!("Accept failed: {}", e),
                    })
                    .await;
                continue;
            }
        };

        // Only the owning user may attach; an unprivileged local
        // process must not be able to inject commands.
        match authorize_peer(&stream) {
            Ok(true) => {}
            Ok(false) => {
                let _ = events
                    .send(ChannelEvent::Error {
                        conn: None,
                        reason: "Rejected connection from foreign uid".to_string(),
                    })
                    .await;
                continue;
            }
            Err(e) => {
                let _ = events
                    .send(ChannelEvent::Error {
                        conn: None,
                        reason: format!("Peer credential check failed: {}", e),
                    })
                    .await;
                continue;
            }
        }

        let conn = ConnectionId(next_conn);
        next_conn += 1;

        let (out_tx, out_rx) = mpsc::channel(CONN_QUEUE_DEPTH);
        conns
            .lock()
            .expect("connection map lock poisoned")
            .insert(conn, out_tx.clone());

        let _ = events.send(ChannelEvent::Connected(conn)).await;
        debug!("Accepted connection {}", conn);

        let (read_half, write_half) = stream.into_split();

        let writer = tokio::spawn(write_loop(conn, write_half, out_rx, events.clone()));
        let reader = tokio::spawn(read_loop(
            conn,
            read_half,
            out_tx,
            Arc::clone(&conns),
            Arc::clone(&seq),
            events.clone(),
        ));

        let mut tasks = conn_tasks.lock().expect("connection task lock poisoned");
        tasks.retain(|t| !t.is_finished());
        tasks.push(writer);
        tasks.push(reader);
    }
}

#[cfg(unix)]
fn authorize_peer(stream: &UnixStream) -> std::io::Result<bool> {
    let cred = stream.peer_cred()?;
    Ok(cred.uid() == nix::unistd::Uid::current().as_raw())
}

#[cfg(not(unix))]
fn authorize_peer(_stream: &UnixStream) -> std::io::Result<bool> {
    Ok(true)
}

async fn write_loop(
    conn: ConnectionId,
    mut write_half: tokio::net::unix::OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<Envelope>,
    events: mpsc::Sender<ChannelEvent>,
) {
    while let Some(envelope) = out_rx.recv().await {
        if let Err(e) = write_frame(&mut write_half, &envelope).await {
            let _ = events
                .send(ChannelEvent::Error {
                    conn: Some(conn),
                    reason: format!("Write failed: {}", e),
                })
                .await;
            break;
        }
    }
}

async fn read_loop(
    conn: ConnectionId,
    mut read_half: tokio::net::unix::OwnedReadHalf,
    out_tx: mpsc::Sender<Envelope>,
    conns: ConnMap,
    seq: Arc<Sequencer>,
    events: mpsc::Sender<ChannelEvent>,
) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(envelope)) => {
                let _ = events.send(ChannelEvent::Message { conn, envelope }).await;
            }
            Ok(None) => break,
            Err(e @ VigilError::Deserialization(_)) => {
                // Frame boundary is intact: echo the rejection and keep
                // the connection alive
                let echo = Envelope::new(seq.next(), EnvelopeKind::Error, e.to_string().into_bytes());
                let _ = out_tx.try_send(echo);
                let _ = events
                    .send(ChannelEvent::Error {
                        conn: Some(conn),
                        reason: e.to_string(),
                    })
                    .await;
            }
            Err(e @ VigilError::FrameTooLarge(..)) => {
                // The stream can no longer be trusted to be in sync:
                // echo the rejection, then drop the connection
                let echo = Envelope::new(seq.next(), EnvelopeKind::Error, e.to_string().into_bytes());
                let _ = out_tx.try_send(echo);
                let _ = events
                    .send(ChannelEvent::Error {
                        conn: Some(conn),
                        reason: e.to_string(),
                    })
                    .await;
                break;
            }
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

    conns
        .lock()
        .expect("connection map lock poisoned")
        .remove(&conn);
    let _ = events.send(ChannelEvent::Disconnected(conn)).await;
    debug!("Connection {} closed", conn);
}
