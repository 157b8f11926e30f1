//! Echo prober
//!
//! Periodic liveness sweep over every addressed device, independent of the
//! watchers. It is the only path that brings an offline device back online.

use super::{bounded, SchedulerContext};
use crate::models::{Device, DeviceFilter, DeviceStatus};
use crate::store::{StatusChange, StoreError};
use futures::future::join_all;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub marked_online: Vec<String>,
    pub marked_offline: Vec<String>,
    pub write_failures: usize,
}

async fn probe(ctx: &SchedulerContext, device: &Device) -> bool {
    let Some(address) = device.address.as_deref() else {
        return false;
    };
    let limit = ctx.settings.echo_timeout();
    match tokio::time::timeout(limit, ctx.client.echo(address)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(device = %device.name, error = %e, "echo failed");
            false
        }
        Err(_) => {
            debug!(device = %device.name, "echo timed out");
            false
        }
    }
}

/// Un passage complet : sonde en parallèle les capteurs online et offline.
/// Si l'une des deux listes est illisible, rien n'est sondé.
pub async fn sweep_once(ctx: &SchedulerContext) -> Result<SweepReport, StoreError> {
    let limit = ctx.settings.echo_timeout();
    let online = bounded(limit, ctx.registry.list_devices(&DeviceFilter::reachable(DeviceStatus::Online))).await?;
    let offline = bounded(limit, ctx.registry.list_devices(&DeviceFilter::reachable(DeviceStatus::Offline))).await?;

    let targets: Vec<(&Device, DeviceStatus)> = online
        .iter()
        .map(|d| (d, DeviceStatus::Online))
        .chain(offline.iter().map(|d| (d, DeviceStatus::Offline)))
        .collect();

    let results = join_all(targets.iter().map(|(device, _)| probe(ctx, device))).await;

    let mut report = SweepReport {
        probed: targets.len(),
        ..Default::default()
    };

    for ((device, current), alive) in targets.into_iter().zip(results) {
        let next = match (current, alive) {
            (DeviceStatus::Online, false) => DeviceStatus::Offline,
            (DeviceStatus::Offline, true) => DeviceStatus::Online,
            _ => continue,
        };

        let now = OffsetDateTime::now_utc();
        match bounded(limit, ctx.status.set_status(&device.name, next, now)).await {
            Ok(StatusChange::Changed { from, to }) => match to {
                DeviceStatus::Online => {
                    info!(device = %device.name, %from, "echo answered, device back online");
                    report.marked_online.push(device.name.clone());
                }
                DeviceStatus::Offline => {
                    warn!(device = %device.name, %from, "echo unanswered, device marked offline");
                    report.marked_offline.push(device.name.clone());
                }
            },
            Ok(StatusChange::Unchanged) => debug!(device = %device.name, status = %next, "status already up to date"),
            Err(e) => {
                report.write_failures += 1;
                error!(device = %device.name, error = %e, "failed to write echo status");
            }
        }
    }

    Ok(report)
}

/// Démarre la boucle de l'echo prober (premier passage immédiat)
pub fn spawn_echo_prober(ctx: SchedulerContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = ctx.settings.echo_interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_secs = period.as_secs(), "echo prober started");

        loop {
            tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            // un passage en cours est abandonné à l'arrêt
            let outcome = tokio::select! {
                biased;
                _ = ctx.shutdown.cancelled() => break,
                outcome = sweep_once(&ctx) => outcome,
            };

            match outcome {
                Ok(report) => {
                    ctx.health.record_sweep(true);
                    debug!(
                        probed = report.probed,
                        online = report.marked_online.len(),
                        offline = report.marked_offline.len(),
                        "echo sweep done"
                    );
                }
                Err(e) => {
                    ctx.health.record_sweep(false);
                    error!(error = %e, "registry unavailable, echo sweep skipped");
                }
            }
        }

        info!("echo prober stopped");
    })
}
