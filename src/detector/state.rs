use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Window thresholds and the alert cooldown, parsed once from config.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub rate_limit: u64,
    pub rate_window: Duration,
    pub auth_limit: u64,
    pub auth_window: Duration,
    pub cooldown: Duration,
}

/// A `(start, count)` sliding window: the first event after the window
/// length elapses resets the origin and starts counting at 1.
#[derive(Debug)]
struct SlidingWindow {
    start: Instant,
    count: u64,
}

impl SlidingWindow {
    fn new(now: Instant) -> Self {
        Self { start: now, count: 0 }
    }

    /// Record one event; returns the count inside the current window.
    fn record(&mut self, now: Instant, window: Duration) -> u64 {
        if now.duration_since(self.start) > window {
            self.start = now;
            self.count = 1;
        } else {
            self.count += 1;
        }
        self.count
    }
}

/// Per-address counters. The request and auth-failure windows keep
/// independent origins so one resetting cannot mask the other.
#[derive(Debug)]
pub struct AttackerState {
    requests: SlidingWindow,
    auth_failures: SlidingWindow,
    last_alert_at: Option<Instant>,
    pub alerts_sent: u64,
}

/// What one processed line did to the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    pub rate_breached: bool,
    pub auth_breached: bool,
}

/// Shared map of attacker states: sharded map, one short-lived async mutex
/// per address. Writes dominate during a burst; the cooldown check is a
/// read of `last_alert_at` under the same entry lock.
pub struct AttackerTracker {
    thresholds: Thresholds,
    states: DashMap<String, Arc<Mutex<AttackerState>>>,
}

/// Entries idle longer than this are evicted by the GC task.
const GC_EXPIRE: Duration = Duration::from_secs(30 * 60);
const GC_INTERVAL: Duration = Duration::from_secs(60);

impl AttackerTracker {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            states: DashMap::new(),
        }
    }

    fn entry(&self, source_ip: &str, now: Instant) -> Arc<Mutex<AttackerState>> {
        if let Some(existing) = self.states.get(source_ip) {
            return existing.value().clone();
        }
        self.states
            .entry(source_ip.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(AttackerState {
                    requests: SlidingWindow::new(now),
                    auth_failures: SlidingWindow::new(now),
                    last_alert_at: None,
                    alerts_sent: 0,
                }))
            })
            .clone()
    }

    /// Record one processed line for `source_ip`. Every line counts against
    /// the request window; only auth-failure lines count against the auth
    /// window. A breach fires strictly above the threshold.
    pub async fn record_line(
        &self,
        source_ip: &str,
        is_auth_failure: bool,
        now: Instant,
    ) -> WindowOutcome {
        let entry = self.entry(source_ip, now);
        let mut state = entry.lock().await;

        let requests = state.requests.record(now, self.thresholds.rate_window);
        let auth = if is_auth_failure {
            state
                .auth_failures
                .record(now, self.thresholds.auth_window)
        } else {
            0
        };

        WindowOutcome {
            rate_breached: requests > self.thresholds.rate_limit,
            auth_breached: is_auth_failure && auth > self.thresholds.auth_limit,
        }
    }

    /// Whether alerts for this address are currently suppressed.
    pub async fn in_cooldown(&self, source_ip: &str, now: Instant) -> bool {
        let Some(entry) = self.states.get(source_ip).map(|e| e.value().clone()) else {
            return false;
        };
        let state = entry.lock().await;
        match state.last_alert_at {
            Some(at) => now.duration_since(at) < self.thresholds.cooldown,
            None => false,
        }
    }

    /// Advance the cooldown origin. Called only after a successful dispatch,
    /// so a failed delivery leaves the next breach free to retry.
    pub async fn mark_alerted(&self, source_ip: &str, now: Instant) {
        let entry = self.entry(source_ip, now);
        let mut state = entry.lock().await;
        state.last_alert_at = Some(now);
        state.alerts_sent += 1;
    }

    pub async fn alerts_sent(&self, source_ip: &str) -> u64 {
        match self.states.get(source_ip).map(|e| e.value().clone()) {
            Some(entry) => entry.lock().await.alerts_sent,
            None => 0,
        }
    }

    pub fn tracked_addresses(&self) -> usize {
        self.states.len()
    }

    /// Periodically evict addresses that have gone quiet, so a scan across
    /// many source addresses cannot grow the map without bound.
    pub fn start_gc(self: &Arc<Self>) {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                tracker.evict_idle(Instant::now());
            }
        });
    }

    fn evict_idle(&self, now: Instant) {
        self.states.retain(|_, entry| {
            match entry.try_lock() {
                Ok(state) => {
                    let last_alert_idle = state
                        .last_alert_at
                        .map(|t| now.duration_since(t))
                        .unwrap_or(GC_EXPIRE);
                    let window_idle = now.duration_since(state.requests.start);
                    last_alert_idle < GC_EXPIRE || window_idle < GC_EXPIRE
                }
                // contended entry is clearly live
                Err(_) => true,
            }
        });
    }
}
