/**
 * ATMOSYNC KERNEL - Point d'entrée du service de flotte de capteurs
 *
 * RÔLE : Bootstrap du système : config, registre JSON, client capteurs,
 * ordonnanceur (reconciler + echo prober + watchers) et API HTTP d'observation.
 *
 * ARCHITECTURE : Une tâche tokio par capteur online + deux boucles globales,
 * arrêt propre sur Ctrl-C via un jeton d'annulation racine.
 */

mod config;
mod device;
mod health;
mod http;
mod models;
mod scheduler;
mod store;

use crate::config::load_config;
use crate::device::HttpDeviceClient;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::scheduler::{spawn_echo_prober, spawn_reconciler, SchedulerContext, WatcherMap};
use crate::store::JsonStore;

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("atmosync_kernel=info")),
        )
        .init();

    let cfg = load_config().await;

    // registre + relevés
    let store = Arc::new(
        JsonStore::open(&cfg.store.data_dir)
            .await
            .with_context(|| format!("failed to open store in {}", cfg.store.data_dir))?,
    );
    let seeded = store.seed_devices(cfg.seed_devices()).await?;
    if seeded > 0 {
        info!(seeded, "devices added from config");
    }

    let health = HealthTracker::new();
    let shutdown = CancellationToken::new();
    let client = Arc::new(HttpDeviceClient::new(
        cfg.scheduler.poll_timeout(),
        cfg.scheduler.echo_timeout(),
    ));

    let ctx = SchedulerContext {
        registry: store.clone(),
        status: store.clone(),
        readings: store.clone(),
        client,
        settings: cfg.scheduler.clone(),
        health: health.clone(),
        shutdown: shutdown.clone(),
    };
    let watchers = WatcherMap::new();

    let reconciler = spawn_reconciler(ctx.clone(), watchers.clone());
    let prober = spawn_echo_prober(ctx);

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        store,
        watchers,
        health,
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    info!(addr = %cfg.http.bind, "listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
            signal.cancel();
        })
        .await?;

    // les boucles ont vu le jeton ; le reconciler arrête les watchers en sortant
    shutdown.cancel();
    for (name, handle) in [("reconciler", reconciler), ("echo prober", prober)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "scheduler task ended abnormally");
        }
    }
    info!("kernel stopped");
    Ok(())
}
