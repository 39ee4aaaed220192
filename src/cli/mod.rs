// CLI module - the interactive client surface. Connects to the
// daemon's channel for status and control; not part of the
// supervision graph.

pub mod output;

use crate::channel::{ChannelClient, ChannelEvent, ChannelName, Envelope, EnvelopeKind};
use crate::config::SupervisionConfig;
use crate::error::{Result, VigilError};
use crate::facade::{ConfigSource, StaticConfigSource};
use crate::shutdown::{ControlMessage, ShutdownOutcome};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How long to wait for the daemon to answer a request
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "vigil",
    version,
    about = "Control client for the vigil enforcement daemon"
)]
pub struct Cli {
    /// Path to the supervision config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the daemon's status
    Status,
    /// Check the daemon is reachable and measure the round trip
    Ping,
    /// Ask the daemon to stop
    Stop {
        /// How the stop should be treated by the sentinel
        #[arg(long, value_enum, default_value_t = StopMode::Safeguards)]
        mode: StopMode,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StopMode {
    /// Stop now; the sentinel will bring the daemon back
    Safeguards,
    /// Stop for good; nothing will respawn the daemon
    Final,
    /// Stop so an update can replace the binary
    Update,
}

impl StopMode {
    fn outcome(self) -> ShutdownOutcome {
        match self {
            StopMode::Safeguards => ShutdownOutcome::StopWithSafeguards,
            StopMode::Final => ShutdownOutcome::StopWithoutSafeguards,
            StopMode::Update => ShutdownOutcome::StopForUpdate,
        }
    }
}

impl std::fmt::Display for StopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopMode::Safeguards => write!(f, "safeguards"),
            StopMode::Final => write!(f, "final"),
            StopMode::Update => write!(f, "update"),
        }
    }
}

impl Cli {
    /// Parse arguments and execute the selected command
    pub async fn run() -> Result<()> {
        let cli = Cli::parse();

        let config = match &cli.config {
            Some(path) => SupervisionConfig::load(path)?,
            None => SupervisionConfig::default(),
        };

        let source = StaticConfigSource::for_app();
        let name = ChannelName::derive(source.identity(), source.version());

        let (client, mut events) = ChannelClient::connect(
            &name,
            &config.runtime_dir,
            config.client_options(false),
        )
        .await
        .map_err(|_| {
            VigilError::Transport("Daemon is not reachable; is it running?".to_string())
        })?;

        let result = match cli.command {
            Commands::Status => {
                let request = ControlMessage::StatusRequest.to_payload()?;
                client.send(client.envelope(EnvelopeKind::Command, request))?;
                let reply = await_reply(&mut events, EnvelopeKind::StatusUpdate).await?;
                match ControlMessage::from_payload(&reply.payload)? {
                    ControlMessage::StatusReport {
                        role,
                        link_state,
                        protected,
                        pid,
                        version,
                    } => {
                        output::print_status(
                            &role.to_string(),
                            &version,
                            pid,
                            link_state,
                            protected,
                        );
                        Ok(())
                    }
                    other => Err(VigilError::Protocol(format!(
                        "Unexpected reply to status request: {:?}",
                        other
                    ))),
                }
            }
            Commands::Ping => {
                let started = Instant::now();
                let request = ControlMessage::StatusRequest.to_payload()?;
                client.send(client.envelope(EnvelopeKind::Command, request))?;
                await_reply(&mut events, EnvelopeKind::StatusUpdate).await?;
                output::print_success(&format!(
                    "Daemon answered in {:.1}ms",
                    started.elapsed().as_secs_f64() * 1000.0
                ));
                Ok(())
            }
            Commands::Stop { mode } => {
                let outcome = mode.outcome();
                let request = ControlMessage::StopRequest { outcome }.to_payload()?;
                client.send(client.envelope(EnvelopeKind::Command, request))?;
                await_reply(&mut events, EnvelopeKind::Ack).await?;
                output::print_success(&format!("Daemon acknowledged stop ({})", outcome));
                if outcome == ShutdownOutcome::StopWithSafeguards {
                    output::print_info("The sentinel will restart it shortly");
                }
                Ok(())
            }
        };

        client.stop().await;
        result
    }
}

/// Wait for the next envelope of the wanted kind, skipping the
/// daemon's broadcast traffic (heartbeats, unrelated updates)
async fn await_reply(
    events: &mut mpsc::Receiver<ChannelEvent>,
    want: EnvelopeKind,
) -> Result<Envelope> {
    let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(ChannelEvent::Message { envelope, .. })) if envelope.kind == want => {
                return Ok(envelope)
            }
            Ok(Some(_)) => continue,
            Ok(None) => {
                return Err(VigilError::Transport(
                    "Connection to daemon closed".to_string(),
                ))
            }
            Err(_) => {
                return Err(VigilError::Transport(
                    "Timed out waiting for daemon reply".to_string(),
                ))
            }
        }
    }
}
