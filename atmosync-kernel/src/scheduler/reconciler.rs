//! Reconciler loop: registry -> watcher map convergence

use super::watcher::spawn_watcher;
use super::{bounded, SchedulerContext, WatcherMap};
use crate::models::{Device, DeviceFilter};
use crate::store::StoreError;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Résultat d'un cycle de réconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub restarted: Vec<String>,
    pub stopped: Vec<String>,
    pub unchanged: usize,
}

impl ReconcileReport {
    pub fn has_changes(&self) -> bool {
        !(self.started.is_empty() && self.restarted.is_empty() && self.stopped.is_empty())
    }
}

/// Un cycle : lit les capteurs pollables et aligne la table des watchers.
/// En cas d'échec de lecture du registre la table n'est pas touchée.
pub async fn reconcile_once(ctx: &SchedulerContext, watchers: &WatcherMap) -> Result<ReconcileReport, StoreError> {
    let devices = bounded(
        ctx.settings.poll_timeout(),
        ctx.registry.list_devices(&DeviceFilter::pollable()),
    )
    .await?;

    let desired: HashMap<String, Duration> = devices
        .iter()
        .filter(|d| d.is_pollable())
        .map(|d: &Device| (d.name.clone(), d.poll_interval()))
        .collect();

    let mut report = ReconcileReport::default();
    let mut entries = watchers.lock();

    entries.retain(|name, handle| {
        if desired.contains_key(name) {
            true
        } else {
            handle.cancel();
            report.stopped.push(name.clone());
            false
        }
    });

    for (name, frequency) in &desired {
        match entries.get(name) {
            Some(handle) if handle.frequency() == *frequency => {
                report.unchanged += 1;
            }
            Some(handle) => {
                // jamais de mutation en place : l'ancienne incarnation est annulée
                handle.cancel();
                let replacement = spawn_watcher(ctx, watchers, name, *frequency);
                entries.insert(name.clone(), replacement);
                report.restarted.push(name.clone());
            }
            None => {
                let handle = spawn_watcher(ctx, watchers, name, *frequency);
                entries.insert(name.clone(), handle);
                report.started.push(name.clone());
            }
        }
    }
    drop(entries);

    report.started.sort();
    report.restarted.sort();
    report.stopped.sort();
    Ok(report)
}

/// Démarre la boucle du reconciler (premier cycle immédiat)
pub fn spawn_reconciler(ctx: SchedulerContext, watchers: WatcherMap) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = ctx.settings.reconcile_interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_secs = period.as_secs(), "reconciler started");

        loop {
            tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match reconcile_once(&ctx, &watchers).await {
                Ok(report) => {
                    ctx.health.record_reconcile(true);
                    if report.has_changes() {
                        info!(
                            started = ?report.started,
                            restarted = ?report.restarted,
                            stopped = ?report.stopped,
                            unchanged = report.unchanged,
                            "watchers reconciled"
                        );
                    } else {
                        debug!(unchanged = report.unchanged, "watchers already in sync");
                    }
                }
                Err(e) => {
                    ctx.health.record_reconcile(false);
                    error!(error = %e, "registry unavailable, reconcile cycle skipped");
                }
            }
        }

        watchers.stop_all();
        info!("reconciler stopped");
    })
}
