// vigil-daemon - the enforcement daemon process. Hosts the channel
// server, runs the content-filter engine, and keeps the sentinel alive.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vigil::channel::ProcessRole;
use vigil::config::SupervisionConfig;
use vigil::daemon::daemonize;
use vigil::error::Result;
use vigil::facade::{EnforcementFacade, PolicyEnforcer, StaticConfigSource};
use vigil::guard::{OomScoreToggle, ProcessGuard};
use vigil::shutdown::ShutdownOutcome;

#[derive(Parser)]
#[command(name = "vigil-daemon", version, about = "vigil enforcement daemon")]
struct Args {
    /// Path to the supervision config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stay attached to the terminal instead of daemonizing
    #[arg(long)]
    foreground: bool,
}

/// Adapter for the traffic-inspection engine. The engine itself is an
/// external collaborator; this process only owns its lifecycle.
struct ContentFilterEnforcer;

impl PolicyEnforcer for ContentFilterEnforcer {
    fn start(&mut self) -> Result<bool> {
        info!("Content filter engine started");
        Ok(true)
    }

    fn stop(&mut self) -> Result<bool> {
        info!("Content filter engine stopped");
        Ok(true)
    }
}

fn main() {
    let args = Args::parse();
    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("✗ Error: {}", e);
            std::process::exit(ShutdownOutcome::CriticalError.as_exit_code());
        }
    }
}

fn run(args: Args) -> anyhow::Result<i32> {
    let config = match &args.config {
        Some(path) => SupervisionConfig::load(path)?,
        None => SupervisionConfig::default(),
    };

    // Fork before the runtime exists; tokio threads do not survive one
    if !args.foreground {
        daemonize()?;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let code = runtime.block_on(async move {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut int = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        let shutdown = async move {
            tokio::select! {
                _ = term.recv() => {}
                _ = int.recv() => {}
            }
            ShutdownOutcome::StopWithSafeguards
        };

        let facade = EnforcementFacade::new(
            ProcessRole::Daemon,
            config,
            Box::new(StaticConfigSource::for_app()),
            Box::new(ContentFilterEnforcer),
            ProcessGuard::new(Box::new(OomScoreToggle::new())),
        );

        Ok::<i32, anyhow::Error>(facade.run(shutdown).await)
    })?;

    Ok(code)
}
