// EnforcementFacade - the composition root binding the supervision
// core around the external policy-enforcement engine

use crate::arbiter::InstanceArbiter;
use crate::channel::{
    ChannelClient, ChannelEvent, ChannelName, ChannelServer, ClientHandle, ConnectionId,
    EnvelopeKind, EnvelopeSink, ProcessRole, ServerHandle,
};
use crate::config::SupervisionConfig;
use crate::error::{Result, VigilError};
use crate::guard::ProcessGuard;
use crate::shutdown::{run_exit_sequence, ControlMessage, ShutdownOutcome};
use crate::supervision::{
    spawn_counterpart, start_being_observed, start_observing, LinkSignal, ObserverHandle,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Application identity shared by every guardian process. Combined
/// with the package version it yields the channel and token names.
pub const APP_IDENTITY: &str = "vigil-content-filter";

/// Boundary to the traffic-inspection engine. The supervision core
/// never inspects policy content; it only starts and stops the engine.
pub trait PolicyEnforcer: Send {
    fn start(&mut self) -> Result<bool>;
    fn stop(&mut self) -> Result<bool>;
}

/// Read-only identity and version strings, consumed for arbitration
/// and channel naming
pub trait ConfigSource: Send + Sync {
    fn identity(&self) -> &str;
    fn version(&self) -> &str;
}

/// Fixed identity/version pair
pub struct StaticConfigSource {
    identity: String,
    version: String,
}

impl StaticConfigSource {
    pub fn new<I: Into<String>, V: Into<String>>(identity: I, version: V) -> Self {
        Self {
            identity: identity.into(),
            version: version.into(),
        }
    }

    /// The identity/version this build of the application ships with
    pub fn for_app() -> Self {
        Self::new(APP_IDENTITY, env!("CARGO_PKG_VERSION"))
    }
}

impl ConfigSource for StaticConfigSource {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn version(&self) -> &str {
        &self.version
    }
}

/// Role action for processes with nothing to enforce (the sentinel)
pub struct IdleEnforcer;

impl PolicyEnforcer for IdleEnforcer {
    fn start(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn stop(&mut self) -> Result<bool> {
        Ok(true)
    }
}

/// The channel endpoint a guardian holds: the daemon hosts the server,
/// the sentinel attaches as a reconnecting client
enum Endpoint {
    Server(Arc<ServerHandle>),
    Client(ClientHandle),
}

impl Endpoint {
    fn sink(&self) -> Box<dyn EnvelopeSink> {
        match self {
            Endpoint::Server(handle) => Box::new(Arc::clone(handle)),
            Endpoint::Client(handle) => Box::new(handle.clone()),
        }
    }

    fn reply(
        &self,
        conn: ConnectionId,
        kind: EnvelopeKind,
        payload: Vec<u8>,
    ) -> Result<()> {
        match self {
            Endpoint::Server(handle) => handle.send(conn, handle.envelope(kind, payload)),
            Endpoint::Client(handle) => handle.send(handle.envelope(kind, payload)),
        }
    }
}

/// Composition root for one guardian process.
///
/// Everything is constructor-injected; there is no ambient state. The
/// `run` method implements the process entry contract: arbitrate,
/// protect, link, start the engine, and on termination run the
/// shutdown sequence.
pub struct EnforcementFacade {
    role: ProcessRole,
    config: SupervisionConfig,
    source: Box<dyn ConfigSource>,
    enforcer: Box<dyn PolicyEnforcer>,
    guard: Arc<ProcessGuard>,
    arbiter: InstanceArbiter,
}

impl EnforcementFacade {
    pub fn new(
        role: ProcessRole,
        config: SupervisionConfig,
        source: Box<dyn ConfigSource>,
        enforcer: Box<dyn PolicyEnforcer>,
        guard: ProcessGuard,
    ) -> Self {
        let arbiter = InstanceArbiter::new(config.runtime_dir.clone());
        Self {
            role,
            config,
            source,
            enforcer,
            guard: Arc::new(guard),
            arbiter,
        }
    }

    /// Run the guardian until the shutdown future resolves or a stop
    /// request arrives over the channel. Returns the process exit code.
    pub async fn run<S>(mut self, shutdown: S) -> i32
    where
        S: Future<Output = ShutdownOutcome> + Send,
    {
        // A failed acquisition is the expected duplicate-instance
        // signal, not an error: exit promptly, enforcement untouched.
        // The token is role-qualified: daemon and sentinel share the
        // channel name but never contend for the same token.
        let instance_identity = format!("{}.{}", self.source.identity(), self.role);
        match self
            .arbiter
            .try_acquire(&instance_identity, self.source.version())
        {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    "Another {} {} instance is already running, exiting",
                    instance_identity,
                    self.source.version()
                );
                return ShutdownOutcome::DuplicateInstance.as_exit_code();
            }
            Err(e) => {
                error!("Instance arbitration failed: {}", e);
                return ShutdownOutcome::CriticalError.as_exit_code();
            }
        }

        // Toggle failure is non-fatal: enforcement continues
        // unprotected
        if let Err(e) = self.guard.enable_protection() {
            warn!("Continuing unprotected: {}", e);
        }

        let name = ChannelName::derive(self.source.identity(), self.source.version());
        let (endpoint, mut events) = match self.open_endpoint(&name).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to open channel endpoint {}: {}", name, e);
                return ShutdownOutcome::CriticalError.as_exit_code();
            }
        };

        let Some(counterpart) = self.role.counterpart() else {
            error!("Role {} has no counterpart to supervise", self.role);
            return ShutdownOutcome::CriticalError.as_exit_code();
        };

        let heartbeats =
            start_being_observed(endpoint.sink(), self.config.heartbeat_interval());

        let observer = match self.start_observer(counterpart) {
            Ok(observer) => observer,
            Err(e) => {
                error!("Failed to start observing {}: {}", counterpart, e);
                heartbeats.abort();
                return ShutdownOutcome::CriticalError.as_exit_code();
            }
        };

        match self.enforcer.start() {
            Ok(true) => info!("{} running as {}", self.source.identity(), self.role),
            Ok(false) => {
                error!("Policy enforcer refused to start");
                heartbeats.abort();
                observer.abort();
                return ShutdownOutcome::CriticalError.as_exit_code();
            }
            Err(e) => {
                error!("Policy enforcer failed to start: {}", e);
                heartbeats.abort();
                observer.abort();
                return ShutdownOutcome::CriticalError.as_exit_code();
            }
        }

        tokio::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                outcome = &mut shutdown => break outcome,
                event = events.recv() => match event {
                    Some(ChannelEvent::Message { conn, envelope }) => {
                        if let Some(outcome) = self
                            .handle_envelope(&endpoint, &observer, conn, envelope)
                            .await
                        {
                            break outcome;
                        }
                    }
                    Some(ChannelEvent::Connected(conn)) => {
                        debug!("Connection {} attached", conn);
                    }
                    Some(ChannelEvent::Disconnected(conn)) => {
                        debug!("Connection {} detached", conn);
                    }
                    Some(ChannelEvent::Error { conn, reason }) => {
                        warn!("Channel error (connection {:?}): {}", conn, reason);
                    }
                    None => {
                        error!("Channel event stream closed unexpectedly");
                        break ShutdownOutcome::CriticalError;
                    }
                },
            }
        };

        heartbeats.abort();
        observer.abort();
        if let Err(e) = self.enforcer.stop() {
            warn!("Policy enforcer failed to stop cleanly: {}", e);
        }

        if outcome == ShutdownOutcome::CriticalError {
            return outcome.as_exit_code();
        }

        let sink = endpoint.sink();
        run_exit_sequence(outcome, &self.guard, &mut self.arbiter, Some(sink.as_ref())).await
    }

    async fn open_endpoint(
        &self,
        name: &ChannelName,
    ) -> Result<(Endpoint, mpsc::Receiver<ChannelEvent>)> {
        match self.role {
            ProcessRole::Daemon => {
                let (handle, events) = ChannelServer::bind(name, &self.config.runtime_dir)?;
                Ok((Endpoint::Server(Arc::new(handle)), events))
            }
            ProcessRole::Sentinel => {
                let (handle, events) = ChannelClient::connect(
                    name,
                    &self.config.runtime_dir,
                    self.config.client_options(true),
                )
                .await?;
                Ok((Endpoint::Client(handle), events))
            }
            ProcessRole::Client => Err(VigilError::Protocol(
                "The facade drives guardian roles only".to_string(),
            )),
        }
    }

    fn start_observer(&self, counterpart: ProcessRole) -> Result<ObserverHandle> {
        let binary = self
            .config
            .binary_for(counterpart)
            .ok_or_else(|| {
                VigilError::Protocol(format!("No binary configured for {}", counterpart))
            })?
            .to_path_buf();
        let args = self.config.respawn_args();

        start_observing(
            self.role,
            counterpart,
            self.config.link_config(),
            self.config.respawn_policy(),
            move || {
                let binary = binary.clone();
                let args = args.clone();
                async move { spawn_counterpart(&binary, &args).await }
            },
        )
    }

    async fn handle_envelope(
        &self,
        endpoint: &Endpoint,
        observer: &ObserverHandle,
        conn: ConnectionId,
        envelope: crate::channel::Envelope,
    ) -> Option<ShutdownOutcome> {
        match envelope.kind {
            EnvelopeKind::Heartbeat => {
                observer.signal(LinkSignal::Heartbeat).await;
                None
            }
            EnvelopeKind::Error => {
                observer.signal(LinkSignal::PeerError).await;
                None
            }
            EnvelopeKind::Command => match ControlMessage::from_payload(&envelope.payload) {
                Ok(ControlMessage::ShutdownNotice { outcome, reason }) => {
                    if let Some(reason) = reason {
                        info!("Counterpart shutdown notice: {} ({})", outcome, reason);
                    }
                    observer.signal(LinkSignal::Notice(outcome)).await;
                    None
                }
                Ok(ControlMessage::StopRequest { outcome }) => {
                    info!("Stop requested over channel: {}", outcome);
                    if let Err(e) = endpoint.reply(conn, EnvelopeKind::Ack, Vec::new()) {
                        debug!("Failed to ack stop request: {}", e);
                    }
                    Some(outcome)
                }
                Ok(ControlMessage::StatusRequest) => {
                    let report = ControlMessage::StatusReport {
                        role: self.role,
                        link_state: observer.state(),
                        protected: self.guard.is_protected(),
                        pid: std::process::id(),
                        version: self.source.version().to_string(),
                    };
                    match report.to_payload() {
                        Ok(payload) => {
                            if let Err(e) =
                                endpoint.reply(conn, EnvelopeKind::StatusUpdate, payload)
                            {
                                debug!("Failed to send status report: {}", e);
                            }
                        }
                        Err(e) => warn!("Failed to encode status report: {}", e),
                    }
                    None
                }
                // Reports are for clients; a guardian receiving one
                // has nothing to do with it
                Ok(ControlMessage::StatusReport { .. }) => None,
                Err(e) => {
                    warn!("Dropping malformed control message: {}", e);
                    None
                }
            },
            EnvelopeKind::StatusUpdate | EnvelopeKind::Ack => None,
        }
    }
}
