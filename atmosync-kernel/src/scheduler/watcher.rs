//! Per-device watcher task
//!
//! One tokio task per device, ticking at the device's frequency. A tick
//! re-checks the registry, polls the device and either stores a reading or
//! bumps the failure count. Ticks are single-flight: while a poll is
//! outstanding, interval ticks are dropped, never queued.

use super::{bounded, SchedulerContext, WatcherMap};
use crate::device::DeviceError;
use crate::models::{Device, DeviceStatus, Reading};
use crate::store::StatusChange;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters shared between a watcher task and its handle
#[derive(Debug, Default)]
pub struct WatcherState {
    failures: AtomicU32,
    busy: AtomicBool,
    polls: AtomicU64,
    skipped: AtomicU64,
}

impl WatcherState {
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Owned by the `WatcherMap`; dropping it does not stop the task, `cancel()` does.
pub struct WatcherHandle {
    device: String,
    frequency: Duration,
    generation: u64,
    state: Arc<WatcherState>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatcherInfo {
    pub device: String,
    pub frequency_secs: u64,
    pub generation: u64,
    pub failures: u32,
    pub busy: bool,
    pub polls: u64,
    pub skipped_ticks: u64,
}

impl WatcherHandle {
    pub fn frequency(&self) -> Duration {
        self.frequency
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// After this returns no new tick starts and any in-flight poll is dropped
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn info(&self) -> WatcherInfo {
        WatcherInfo {
            device: self.device.clone(),
            frequency_secs: self.frequency.as_secs(),
            generation: self.generation,
            failures: self.state.failures(),
            busy: self.state.is_busy(),
            polls: self.state.polls(),
            skipped_ticks: self.state.skipped(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// Device removed, offline or without address in the registry
    NotPollable,
    FailureThreshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Polled,
    Failed,
    /// Registry unreadable, nothing attempted
    Skipped,
    Retire(RetireReason),
}

type TickFuture = Pin<Box<dyn Future<Output = TickOutcome> + Send>>;

/// Spawns the task; the caller must insert the handle into `watchers`
/// before releasing the map lock.
pub(crate) fn spawn_watcher(
    ctx: &SchedulerContext,
    watchers: &WatcherMap,
    device: &str,
    frequency: Duration,
) -> WatcherHandle {
    let generation = watchers.next_generation();
    let state = Arc::new(WatcherState::default());
    let cancel = ctx.shutdown.child_token();

    tokio::spawn(run_watcher(
        ctx.clone(),
        watchers.clone(),
        device.to_string(),
        frequency,
        generation,
        state.clone(),
        cancel.clone(),
    ));

    WatcherHandle {
        device: device.to_string(),
        frequency,
        generation,
        state,
        cancel,
    }
}

async fn run_watcher(
    ctx: SchedulerContext,
    watchers: WatcherMap,
    device: String,
    frequency: Duration,
    generation: u64,
    state: Arc<WatcherState>,
    cancel: CancellationToken,
) {
    info!(device = %device, frequency_secs = frequency.as_secs(), generation, "watcher started");

    let mut interval = tokio::time::interval(frequency);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: Option<TickFuture> = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(device = %device, generation, "watcher cancelled");
                break;
            }

            outcome = poll_in_flight(&mut in_flight) => {
                in_flight = None;
                state.busy.store(false, Ordering::Relaxed);

                if let TickOutcome::Retire(reason) = outcome {
                    cancel.cancel();
                    watchers.remove_own(&device, generation);
                    info!(device = %device, generation, ?reason, "watcher retired");
                    break;
                }
            }

            _ = interval.tick() => {
                if in_flight.is_some() {
                    state.skipped.fetch_add(1, Ordering::Relaxed);
                    debug!(device = %device, "previous poll still running, tick skipped");
                } else {
                    state.busy.store(true, Ordering::Relaxed);
                    in_flight = Some(Box::pin(run_tick(ctx.clone(), device.clone(), state.clone())));
                }
            }
        }
    }

    state.busy.store(false, Ordering::Relaxed);
}

async fn poll_in_flight(in_flight: &mut Option<TickFuture>) -> TickOutcome {
    match in_flight.as_mut() {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn run_tick(ctx: SchedulerContext, device: String, state: Arc<WatcherState>) -> TickOutcome {
    let limit = ctx.settings.poll_timeout();

    let address = match bounded(limit, ctx.registry.get_device(&device)).await {
        Ok(Some(Device { status: DeviceStatus::Online, address: Some(address), .. })) => address,
        Ok(_) => {
            info!(device = %device, "device no longer online in registry");
            return TickOutcome::Retire(RetireReason::NotPollable);
        }
        Err(e) => {
            warn!(device = %device, error = %e, "registry read failed, tick skipped");
            return TickOutcome::Skipped;
        }
    };

    state.polls.fetch_add(1, Ordering::Relaxed);
    let result = match tokio::time::timeout(limit, ctx.client.sense(&address, OffsetDateTime::now_utc())).await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::Timeout(limit)),
    };

    match result {
        Ok(report) => {
            state.failures.store(0, Ordering::Relaxed);
            let reading = Reading {
                device: report.device,
                temperature: report.temperature,
                humidity: report.humidity,
                timestamp: OffsetDateTime::now_utc(),
            };
            match bounded(limit, ctx.readings.insert_reading(&reading)).await {
                Ok(()) => {
                    ctx.health.record_reading();
                    debug!(
                        device = %device,
                        reported = %reading.device,
                        temperature = reading.temperature,
                        humidity = reading.humidity,
                        "reading stored"
                    );
                }
                Err(e) => error!(device = %device, error = %e, "failed to store reading"),
            }
            TickOutcome::Polled
        }
        Err(e) => {
            ctx.health.record_poll_failure();
            let failures = state.failures.fetch_add(1, Ordering::Relaxed) + 1;
            let threshold = ctx.settings.failure_threshold();
            warn!(device = %device, address = %address, failures, threshold, error = %e, "poll failed");

            if failures < threshold {
                return TickOutcome::Failed;
            }

            let now = OffsetDateTime::now_utc();
            match bounded(limit, ctx.status.set_status(&device, DeviceStatus::Offline, now)).await {
                Ok(StatusChange::Changed { from, .. }) => {
                    warn!(device = %device, %from, failures, "device marked offline")
                }
                Ok(StatusChange::Unchanged) => debug!(device = %device, "device already offline"),
                Err(e) => error!(device = %device, error = %e, "failed to write offline status"),
            }
            TickOutcome::Retire(RetireReason::FailureThreshold)
        }
    }
}
