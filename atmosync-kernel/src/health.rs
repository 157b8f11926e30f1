use crate::scheduler::WatcherMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub watchers_running: u32,
    pub reconcile_cycles: u64,
    pub reconcile_skipped: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reconcile: Option<OffsetDateTime>,
    pub echo_sweeps: u64,
    pub echo_sweeps_skipped: u64,
    pub readings_ingested: u64,
    pub poll_failures: u64,
    pub memory_usage_mb: f32,
}

#[derive(Default)]
struct Counters {
    reconcile_cycles: AtomicU64,
    reconcile_skipped: AtomicU64,
    echo_sweeps: AtomicU64,
    echo_sweeps_skipped: AtomicU64,
    readings_ingested: AtomicU64,
    poll_failures: AtomicU64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    counters: Arc<Counters>,
    last_reconcile: Arc<Mutex<Option<OffsetDateTime>>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
            last_reconcile: Arc::new(Mutex::new(None)),
        }
    }

    /// Un cycle réussi met à jour l'horodatage, un cycle sauté est seulement compté
    pub fn record_reconcile(&self, ok: bool) {
        if ok {
            self.counters.reconcile_cycles.fetch_add(1, Ordering::Relaxed);
            *self.last_reconcile.lock() = Some(OffsetDateTime::now_utc());
        } else {
            self.counters.reconcile_skipped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_sweep(&self, ok: bool) {
        let counter = if ok {
            &self.counters.echo_sweeps
        } else {
            &self.counters.echo_sweeps_skipped
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reading(&self) {
        self.counters.readings_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_failure(&self) {
        self.counters.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconcile_cycles(&self) -> u64 {
        self.counters.reconcile_cycles.load(Ordering::Relaxed)
    }

    pub fn reconcile_skipped(&self) -> u64 {
        self.counters.reconcile_skipped.load(Ordering::Relaxed)
    }

    pub fn sweeps(&self) -> u64 {
        self.counters.echo_sweeps.load(Ordering::Relaxed)
    }

    pub fn sweeps_skipped(&self) -> u64 {
        self.counters.echo_sweeps_skipped.load(Ordering::Relaxed)
    }

    pub fn readings_ingested(&self) -> u64 {
        self.counters.readings_ingested.load(Ordering::Relaxed)
    }

    pub fn poll_failures(&self) -> u64 {
        self.counters.poll_failures.load(Ordering::Relaxed)
    }

    pub fn get_health(&self, watchers: &WatcherMap) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            watchers_running: watchers.len() as u32,
            reconcile_cycles: self.reconcile_cycles(),
            reconcile_skipped: self.reconcile_skipped(),
            last_reconcile: *self.last_reconcile.lock(),
            echo_sweeps: self.sweeps(),
            echo_sweeps_skipped: self.sweeps_skipped(),
            readings_ingested: self.readings_ingested(),
            poll_failures: self.poll_failures(),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// VmRSS du processus, 0 hors Linux ou si /proc est illisible
fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            if let Some(kb) = parse_vm_rss_kb(&status) {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}
