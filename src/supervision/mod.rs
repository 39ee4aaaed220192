// Supervision module - heartbeats, missed-beat tracking, and
// counterpart resurrection

pub mod link;
pub mod respawn;

pub use link::{
    start_being_observed, start_observing, LinkAction, LinkConfig, LinkMonitor, LinkSignal,
    LinkState, ObserverHandle,
};
pub use respawn::{spawn_counterpart, RespawnPolicy, RespawnTracker};
