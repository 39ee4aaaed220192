// SupervisionLink - mutual-watchdog logic between a pair of guardian
// processes. The observed side emits heartbeats; the observer tracks
// them and resurrects the counterpart on silence or explicit failure.

use crate::channel::{EnvelopeKind, EnvelopeSink, ProcessRole};
use crate::error::{Result, VigilError};
use crate::shutdown::{RespawnDirective, ShutdownOutcome};
use crate::supervision::respawn::{RespawnPolicy, RespawnTracker};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Tunables for one supervision link. These are configuration, not
/// contracts; the defaults follow the shipped config file.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// How often the observed side emits a heartbeat
    pub heartbeat_interval: Duration,
    /// Consecutive missed beats before Alive degrades
    pub degraded_after: u32,
    /// Further missed beats before Degraded is declared Lost
    pub lost_after: u32,
    /// Beats allowed for a freshly (re)spawned counterpart to report in
    pub startup_grace_ticks: u32,
    /// How long respawn pauses when the counterpart stops for an update
    pub update_pause: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            degraded_after: 3,
            lost_after: 2,
            startup_grace_ticks: 3,
            update_pause: Duration::from_secs(60),
        }
    }
}

/// Observer's view of the counterpart. Transitions walk the ordered
/// path Starting -> Alive -> Degraded -> Lost; only an explicit
/// failure report may jump straight to Lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Starting,
    Alive,
    Degraded,
    Lost,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Starting => write!(f, "starting"),
            LinkState::Alive => write!(f, "alive"),
            LinkState::Degraded => write!(f, "degraded"),
            LinkState::Lost => write!(f, "lost"),
        }
    }
}

/// What the observer loop must do after feeding the monitor an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    None,
    /// Log-worthy degradation, no respawn yet
    Degraded,
    /// Counterpart is Lost; invoke the respawn path
    Respawn,
    /// Counterpart stopped for an update; respawn after the pause
    PauseRespawn,
    /// Counterpart stopped for good; never respawn
    Disarmed,
}

/// Pure missed-beat state machine, driven by the observer loop and
/// directly testable without any transport or timers.
#[derive(Debug)]
pub struct LinkMonitor {
    degraded_after: u32,
    lost_after: u32,
    startup_ticks: u32,
    state: LinkState,
    missed: u32,
    armed: bool,
}

impl LinkMonitor {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            degraded_after: config.degraded_after.max(1),
            lost_after: config.lost_after.max(1),
            startup_ticks: config.startup_grace_ticks.max(1),
            state: LinkState::Starting,
            missed: 0,
            armed: true,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn missed_beats(&self) -> u32 {
        self.missed
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// A heartbeat arrived. A live counterpart always re-arms the
    /// link: if it was stopped for good and someone started it again,
    /// it expects to be supervised.
    pub fn on_heartbeat(&mut self) {
        self.missed = 0;
        self.state = LinkState::Alive;
        self.armed = true;
    }

    /// One heartbeat interval elapsed without a beat
    pub fn on_tick(&mut self) -> LinkAction {
        if !self.armed {
            return LinkAction::None;
        }

        match self.state {
            LinkState::Starting => {
                self.missed += 1;
                if self.missed >= self.startup_ticks {
                    self.missed = 0;
                    LinkAction::Respawn
                } else {
                    LinkAction::None
                }
            }
            LinkState::Alive => {
                self.missed += 1;
                if self.missed >= self.degraded_after {
                    self.state = LinkState::Degraded;
                    LinkAction::Degraded
                } else {
                    LinkAction::None
                }
            }
            LinkState::Degraded => {
                self.missed += 1;
                if self.missed >= self.degraded_after + self.lost_after {
                    self.state = LinkState::Lost;
                    LinkAction::Respawn
                } else {
                    LinkAction::None
                }
            }
            // Already Lost: the respawn path owns recovery, ticks are
            // irrelevant until the monitor is reset
            LinkState::Lost => LinkAction::None,
        }
    }

    /// The counterpart self-reported a fatal failure. Faster than
    /// waiting out the timeout; jumps straight to Lost.
    pub fn on_peer_error(&mut self) -> LinkAction {
        if !self.armed || self.state == LinkState::Lost {
            return LinkAction::None;
        }
        self.state = LinkState::Lost;
        LinkAction::Respawn
    }

    /// The counterpart announced its shutdown outcome before exiting
    pub fn on_notice(&mut self, outcome: ShutdownOutcome) -> LinkAction {
        match outcome.respawn_directive() {
            RespawnDirective::Respawn => self.on_peer_error(),
            RespawnDirective::Never => {
                self.armed = false;
                self.state = LinkState::Lost;
                LinkAction::Disarmed
            }
            RespawnDirective::Pause => {
                if !self.armed {
                    return LinkAction::None;
                }
                self.state = LinkState::Lost;
                LinkAction::PauseRespawn
            }
        }
    }

    /// A respawn attempt was made; expect a fresh heartbeat within the
    /// startup grace
    pub fn on_respawned(&mut self) {
        self.state = LinkState::Starting;
        self.missed = 0;
    }
}

/// Events fed to an observer from the channel event loop
#[derive(Debug, Clone, Copy)]
pub enum LinkSignal {
    Heartbeat,
    PeerError,
    Notice(ShutdownOutcome),
    Stop,
}

type RespawnFn =
    Box<dyn FnMut() -> Pin<Box<dyn Future<Output = Result<u32>> + Send>> + Send>;

/// Handle to a running observer task
pub struct ObserverHandle {
    signals: mpsc::Sender<LinkSignal>,
    state_rx: watch::Receiver<LinkState>,
    task: JoinHandle<()>,
}

impl ObserverHandle {
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    pub async fn signal(&self, signal: LinkSignal) {
        let _ = self.signals.send(signal).await;
    }

    pub fn try_signal(&self, signal: LinkSignal) {
        let _ = self.signals.try_send(signal);
    }

    pub async fn stop(self) {
        let _ = self.signals.send(LinkSignal::Stop).await;
        let _ = self.task.await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Start observing the counterpart role.
///
/// The roles are validated up front: a process must never wind up
/// respawning its own role, and clients sit outside the supervision
/// graph entirely.
pub fn start_observing<F, Fut>(
    own_role: ProcessRole,
    counterpart: ProcessRole,
    config: LinkConfig,
    policy: RespawnPolicy,
    mut respawn: F,
) -> Result<ObserverHandle>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<u32>> + Send + 'static,
{
    if own_role == counterpart {
        return Err(VigilError::Protocol(format!(
            "Refusing to observe own role: {}",
            own_role
        )));
    }
    if counterpart == ProcessRole::Client {
        return Err(VigilError::Protocol(
            "Clients are outside the supervision graph".to_string(),
        ));
    }

    let respawn_fn: RespawnFn = Box::new(move || Box::pin(respawn()));

    let (signals_tx, signals_rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(LinkState::Starting);

    let task = tokio::spawn(async move {
        Observer {
            counterpart,
            config,
            policy,
            monitor: LinkMonitor::new(&config),
            tracker: RespawnTracker::new(),
            respawn: respawn_fn,
            pending_respawn: None,
            state_tx,
        }
        .run(signals_rx)
        .await;
    });

    Ok(ObserverHandle {
        signals: signals_tx,
        state_rx,
        task,
    })
}

/// Start the observed side: emit a heartbeat every interval,
/// regardless of activity, until the task is aborted.
pub fn start_being_observed<S>(sink: S, interval: Duration) -> JoinHandle<()>
where
    S: EnvelopeSink + 'static,
{
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            if let Err(e) = sink.send_envelope(EnvelopeKind::Heartbeat, Vec::new()) {
                debug!("Heartbeat send failed: {}", e);
            }
        }
    })
}

struct Observer {
    counterpart: ProcessRole,
    config: LinkConfig,
    policy: RespawnPolicy,
    monitor: LinkMonitor,
    tracker: RespawnTracker,
    respawn: RespawnFn,
    /// Deadline for a rate-capped or update-paused respawn
    pending_respawn: Option<Instant>,
    state_tx: watch::Sender<LinkState>,
}

impl Observer {
    async fn run(mut self, mut signals: mpsc::Receiver<LinkSignal>) {
        let first_tick = tokio::time::Instant::now() + self.config.heartbeat_interval;
        let mut ticks = tokio::time::interval_at(first_tick, self.config.heartbeat_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    if let Some(due) = self.pending_respawn {
                        if Instant::now() >= due {
                            self.pending_respawn = None;
                            self.do_respawn().await;
                        }
                    }
                    let action = self.monitor.on_tick();
                    self.handle_action(action).await;
                }
                signal = signals.recv() => match signal {
                    Some(LinkSignal::Heartbeat) => {
                        self.pending_respawn = None;
                        self.monitor.on_heartbeat();
                        self.tracker.record_success();
                        ticks.reset();
                    }
                    Some(LinkSignal::PeerError) => {
                        warn!("{} self-reported a fatal failure", self.counterpart);
                        let action = self.monitor.on_peer_error();
                        self.handle_action(action).await;
                    }
                    Some(LinkSignal::Notice(outcome)) => {
                        info!("{} announced shutdown: {}", self.counterpart, outcome);
                        let action = self.monitor.on_notice(outcome);
                        self.handle_action(action).await;
                    }
                    Some(LinkSignal::Stop) | None => break,
                },
            }
            self.publish();
        }
    }

    async fn handle_action(&mut self, action: LinkAction) {
        match action {
            LinkAction::None => {}
            LinkAction::Degraded => {
                warn!(
                    "No heartbeat from {} for {} beats, link degraded",
                    self.counterpart,
                    self.monitor.missed_beats()
                );
            }
            LinkAction::Respawn => {
                // A startup-grace expiry means the previous attempt
                // never produced a beat; grow the backoff
                if self.monitor.state() == LinkState::Starting && self.tracker.total_attempts() > 0
                {
                    self.tracker.record_failure();
                }
                let delay = self.tracker.delay_until_next(&self.policy);
                if delay.is_zero() {
                    self.do_respawn().await;
                } else {
                    warn!(
                        "{} is lost; respawn rate-capped, next attempt in {:?}",
                        self.counterpart, delay
                    );
                    self.pending_respawn = Some(Instant::now() + delay);
                }
            }
            LinkAction::PauseRespawn => {
                info!(
                    "{} is stopping for an update; respawn paused for {:?}",
                    self.counterpart, self.config.update_pause
                );
                self.pending_respawn = Some(Instant::now() + self.config.update_pause);
            }
            LinkAction::Disarmed => {
                info!(
                    "{} stopped without safeguards; respawn disarmed",
                    self.counterpart
                );
            }
        }
    }

    async fn do_respawn(&mut self) {
        self.tracker.record_attempt();
        info!(
            "Respawning {} (attempt {})",
            self.counterpart,
            self.tracker.total_attempts()
        );
        match (self.respawn)().await {
            Ok(pid) => {
                info!("Respawned {} with pid {}", self.counterpart, pid);
                self.monitor.on_respawned();
            }
            Err(e) => {
                error!("Failed to respawn {}: {}", self.counterpart, e);
                self.tracker.record_failure();
                self.pending_respawn =
                    Some(Instant::now() + self.tracker.delay_until_next(&self.policy));
            }
        }
    }

    fn publish(&self) {
        let _ = self.state_tx.send(self.monitor.state());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> LinkMonitor {
        LinkMonitor::new(&LinkConfig::default())
    }

    #[test]
    fn test_starts_in_starting_state() {
        let m = monitor();
        assert_eq!(m.state(), LinkState::Starting);
        assert!(m.is_armed());
    }

    #[test]
    fn test_heartbeat_moves_starting_to_alive() {
        let mut m = monitor();
        m.on_heartbeat();
        assert_eq!(m.state(), LinkState::Alive);
        assert_eq!(m.missed_beats(), 0);
    }

    #[test]
    fn test_ordered_path_to_lost() {
        let mut m = monitor();
        m.on_heartbeat();

        // Three missed beats: Alive -> Degraded, no respawn yet
        assert_eq!(m.on_tick(), LinkAction::None);
        assert_eq!(m.on_tick(), LinkAction::None);
        assert_eq!(m.on_tick(), LinkAction::Degraded);
        assert_eq!(m.state(), LinkState::Degraded);

        // Two more: Degraded -> Lost, exactly one respawn request
        assert_eq!(m.on_tick(), LinkAction::None);
        assert_eq!(m.on_tick(), LinkAction::Respawn);
        assert_eq!(m.state(), LinkState::Lost);

        // Further silence requests nothing more
        assert_eq!(m.on_tick(), LinkAction::None);
        assert_eq!(m.on_tick(), LinkAction::None);
    }

    #[test]
    fn test_degraded_is_never_skipped_by_ticks() {
        let mut m = monitor();
        m.on_heartbeat();
        let mut saw_degraded = false;
        loop {
            match m.on_tick() {
                LinkAction::Degraded => saw_degraded = true,
                LinkAction::Respawn => break,
                _ => {}
            }
        }
        assert!(saw_degraded);
    }

    #[test]
    fn test_heartbeat_resets_missed_count() {
        let mut m = monitor();
        m.on_heartbeat();
        m.on_tick();
        m.on_tick();
        m.on_heartbeat();
        assert_eq!(m.missed_beats(), 0);
        assert_eq!(m.state(), LinkState::Alive);
    }

    #[test]
    fn test_peer_error_jumps_straight_to_lost() {
        let mut m = monitor();
        m.on_heartbeat();
        assert_eq!(m.on_peer_error(), LinkAction::Respawn);
        assert_eq!(m.state(), LinkState::Lost);
        // No second respawn for a repeated error report
        assert_eq!(m.on_peer_error(), LinkAction::None);
    }

    #[test]
    fn test_startup_grace_expiry_requests_respawn() {
        let mut m = monitor();
        assert_eq!(m.on_tick(), LinkAction::None);
        assert_eq!(m.on_tick(), LinkAction::None);
        assert_eq!(m.on_tick(), LinkAction::Respawn);
        // Still Starting; the respawn path owns recovery
        assert_eq!(m.state(), LinkState::Starting);
    }

    #[test]
    fn test_respawned_resets_to_starting() {
        let mut m = monitor();
        m.on_heartbeat();
        while m.on_tick() != LinkAction::Respawn {}
        m.on_respawned();
        assert_eq!(m.state(), LinkState::Starting);
        assert_eq!(m.missed_beats(), 0);
    }

    #[test]
    fn test_stop_without_safeguards_disarms() {
        let mut m = monitor();
        m.on_heartbeat();
        assert_eq!(
            m.on_notice(ShutdownOutcome::StopWithoutSafeguards),
            LinkAction::Disarmed
        );
        assert!(!m.is_armed());
        // Disarmed: silence never triggers a respawn
        for _ in 0..20 {
            assert_eq!(m.on_tick(), LinkAction::None);
        }
    }

    #[test]
    fn test_stop_with_safeguards_fast_tracks_respawn() {
        let mut m = monitor();
        m.on_heartbeat();
        assert_eq!(
            m.on_notice(ShutdownOutcome::StopWithSafeguards),
            LinkAction::Respawn
        );
    }

    #[test]
    fn test_stop_for_update_pauses() {
        let mut m = monitor();
        m.on_heartbeat();
        assert_eq!(
            m.on_notice(ShutdownOutcome::StopForUpdate),
            LinkAction::PauseRespawn
        );
        assert_eq!(m.state(), LinkState::Lost);
    }

    #[test]
    fn test_heartbeat_rearms_a_disarmed_link() {
        let mut m = monitor();
        m.on_heartbeat();
        m.on_notice(ShutdownOutcome::StopWithoutSafeguards);
        assert!(!m.is_armed());

        m.on_heartbeat();
        assert!(m.is_armed());
        assert_eq!(m.state(), LinkState::Alive);
    }

    #[test]
    fn test_observing_own_role_is_rejected() {
        let result = start_observing(
            ProcessRole::Daemon,
            ProcessRole::Daemon,
            LinkConfig::default(),
            RespawnPolicy::default(),
            || async { Ok(0) },
        );
        assert!(matches!(result, Err(VigilError::Protocol(_))));
    }

    #[test]
    fn test_observing_a_client_is_rejected() {
        let result = start_observing(
            ProcessRole::Daemon,
            ProcessRole::Client,
            LinkConfig::default(),
            RespawnPolicy::default(),
            || async { Ok(0) },
        );
        assert!(matches!(result, Err(VigilError::Protocol(_))));
    }
}
