//! Liveness monitor interface.
//!
//! The event loop registers itself on start, ticks a heartbeat on every
//! iteration and deregisters on exit. What the monitor does with stalled
//! loops is up to the implementation.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

pub trait LivenessMonitor: Send + Sync {
    fn register_loop(&self, name: &str);
    fn heartbeat(&self, name: &str);
    fn deregister_loop(&self, name: &str);
}

/// Monitor that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl LivenessMonitor for NoopMonitor {
    fn register_loop(&self, _name: &str) {}
    fn heartbeat(&self, _name: &str) {}
    fn deregister_loop(&self, _name: &str) {}
}

#[derive(Debug, Clone, Copy)]
struct LoopBeat {
    count: u64,
    last_beat: Instant,
}

/// In-process heartbeat table that a watchdog can poll.
#[derive(Debug, Default)]
pub struct HeartbeatRegistry {
    loops: DashMap<String, LoopBeat>,
}

impl HeartbeatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.loops.contains_key(name)
    }

    /// Heartbeats seen from `name` since registration.
    pub fn beats(&self, name: &str) -> Option<u64> {
        self.loops.get(name).map(|beat| beat.count)
    }

    /// Loops that have not ticked for longer than `threshold`.
    pub fn stalled_loops(&self, threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        self.loops
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_beat) > threshold)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl LivenessMonitor for HeartbeatRegistry {
    fn register_loop(&self, name: &str) {
        self.loops.insert(
            name.to_string(),
            LoopBeat {
                count: 0,
                last_beat: Instant::now(),
            },
        );
    }

    fn heartbeat(&self, name: &str) {
        if let Some(mut beat) = self.loops.get_mut(name) {
            beat.count += 1;
            beat.last_beat = Instant::now();
        }
    }

    fn deregister_loop(&self, name: &str) {
        self.loops.remove(name);
    }
}
