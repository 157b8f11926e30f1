/**
 * SCHEDULER - Ordonnancement dynamique des capteurs
 *
 * RÔLE :
 * Garder exactement un watcher de polling par capteur online, aligné sur la
 * fréquence voulue par le registre, et suivre les transitions online/offline.
 *
 * ARCHITECTURE :
 * - reconciler : boucle périodique registre -> start / restart / stop des watchers
 * - watcher : une tâche tokio par capteur (single-flight, compteur d'échecs, auto-retrait)
 * - prober : echo sweep indépendant, seul chemin de retour offline -> online
 * - WatcherMap : table nom -> handle, unique structure mutable partagée
 *
 * CONCURRENCE :
 * La table est protégée par un mutex synchrone jamais tenu à travers un `.await`.
 * Seuls le reconciler (create/replace/remove) et un watcher (retrait de sa propre
 * entrée, vérifié par numéro de génération) la modifient.
 */

pub mod prober;
pub mod reconciler;
pub mod watcher;

use crate::config::SchedulerConf;
use crate::device::DeviceClient;
use crate::health::HealthTracker;
use crate::store::{DeviceRegistry, ReadingSink, StatusWriter, StoreError};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use prober::spawn_echo_prober;
pub use reconciler::spawn_reconciler;
pub use watcher::{WatcherHandle, WatcherInfo};

/// Dépendances partagées par toutes les tâches de l'ordonnanceur
#[derive(Clone)]
pub struct SchedulerContext {
    pub registry: Arc<dyn DeviceRegistry>,
    pub status: Arc<dyn StatusWriter>,
    pub readings: Arc<dyn ReadingSink>,
    pub client: Arc<dyn DeviceClient>,
    pub settings: SchedulerConf,
    pub health: HealthTracker,
    /// Jeton racine : l'annuler arrête les boucles et tous les watchers
    pub shutdown: CancellationToken,
}

/// Borne un accès au store ; un dépassement est traité comme un store indisponible
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!("no answer within {:?}", limit))),
    }
}

/// Table nom de capteur -> watcher actif
#[derive(Clone, Default)]
pub struct WatcherMap {
    entries: Arc<Mutex<HashMap<String, WatcherHandle>>>,
    next_generation: Arc<AtomicU64>,
}

impl WatcherMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, device: &str) -> bool {
        self.entries.lock().contains_key(device)
    }

    #[cfg(test)]
    pub fn info(&self, device: &str) -> Option<WatcherInfo> {
        self.entries.lock().get(device).map(WatcherHandle::info)
    }

    /// Copie de l'état des watchers, triée par nom
    pub fn snapshot(&self) -> Vec<WatcherInfo> {
        let mut out: Vec<WatcherInfo> = self.entries.lock().values().map(WatcherHandle::info).collect();
        out.sort_by(|a, b| a.device.cmp(&b.device));
        out
    }

    /// Annule et retire le watcher d'un capteur
    #[cfg(test)]
    pub fn stop(&self, device: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(device) {
            Some(handle) => {
                handle.cancel();
                entries.remove(device);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let mut entries = self.entries.lock();
        for handle in entries.values() {
            handle.cancel();
        }
        let count = entries.len();
        entries.clear();
        if count > 0 {
            info!(count, "all watchers stopped");
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<String, WatcherHandle>> {
        self.entries.lock()
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Retrait par le watcher lui-même : seulement si l'entrée est encore la sienne
    pub(crate) fn remove_own(&self, device: &str, generation: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(device) {
            Some(handle) if handle.generation() == generation => {
                handle.cancel();
                entries.remove(device);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests {
    use super::reconciler::reconcile_once;
    use super::testing::{context_with, EchoScript, ScriptedClient, SenseScript};
    use super::*;
    use crate::device::HttpDeviceClient;
    use crate::models::{Device, DeviceStatus};
    use crate::store::{DeviceRegistry, JsonStore};
    use atmosync_devkit::{Behavior, FleetHarness, RequestKind};

    #[tokio::test(start_paused = true)]
    async fn test_offline_then_echo_recovery_scenario() {
        let store = Arc::new(JsonStore::in_memory());
        store.upsert_device(Device::new("sensorA", "10.0.0.5", 5)).await.unwrap();

        let client = Arc::new(ScriptedClient::new());
        client.push_sense("10.0.0.5", SenseScript::Hang);
        client.push_sense("10.0.0.5", SenseScript::Hang);
        client.set_sense("10.0.0.5", SenseScript::Reply("sensorA 1 22.0C 40.0%RH".into()));
        client.set_echo("10.0.0.5", EchoScript::Reply("ECHO-OK".into()));

        let mut ctx = context_with(store.clone(), client.clone());
        ctx.settings.poll_timeout_secs = 3;
        let watchers = WatcherMap::new();

        let reconciler = spawn_reconciler(ctx.clone(), watchers.clone());
        let prober = spawn_echo_prober(ctx.clone());

        // t=0 poll, t=3 timeout, t=5 poll, t=8 timeout -> offline
        tokio::time::sleep(Duration::from_secs(9)).await;
        let dev = store.get_device("sensorA").await.unwrap().unwrap();
        assert_eq!(dev.status, DeviceStatus::Offline);
        assert!(dev.last_connected.is_some());
        assert!(watchers.is_empty());

        // aucun troisième poll tant que le capteur est offline
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(client.sense_calls("10.0.0.5"), 2);

        // echo sweep à t=300 -> online, puis reconcile au plus tard à t=360
        tokio::time::sleep(Duration::from_secs(165)).await;
        let dev = store.get_device("sensorA").await.unwrap().unwrap();
        assert_eq!(dev.status, DeviceStatus::Online);

        let info = watchers.info("sensorA").expect("watcher restarted");
        assert_eq!(info.frequency_secs, 5);
        assert_eq!(info.failures, 0);
        assert!(client.sense_calls("10.0.0.5") > 2);
        assert!(store.latest_readings().await.contains_key("sensorA"));

        ctx.shutdown.cancel();
        reconciler.await.unwrap();
        prober.await.unwrap();
        assert!(watchers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_own_ignores_replacement() {
        let store = Arc::new(JsonStore::in_memory());
        store.upsert_device(Device::new("sensorA", "10.0.0.5", 5)).await.unwrap();
        let client = Arc::new(ScriptedClient::new());
        client.set_sense("10.0.0.5", SenseScript::Reply("sensorA 1 22.0C 40.0%RH".into()));
        let ctx = context_with(store.clone(), client);
        let watchers = WatcherMap::new();

        reconcile_once(&ctx, &watchers).await.unwrap();
        let first = watchers.info("sensorA").unwrap().generation;

        // le registre change de fréquence : l'entrée est remplacée
        store.upsert_device(Device::new("sensorA", "10.0.0.5", 10)).await.unwrap();
        reconcile_once(&ctx, &watchers).await.unwrap();
        let second = watchers.info("sensorA").unwrap().generation;
        assert_ne!(first, second);

        // l'ancienne incarnation ne peut pas retirer la nouvelle
        assert!(!watchers.remove_own("sensorA", first));
        assert!(watchers.contains("sensorA"));
        assert!(watchers.remove_own("sensorA", second));
        assert!(watchers.is_empty());
    }

    async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < limit {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_end_to_end_with_mock_devices() {
        let mut fleet = FleetHarness::new();
        let address = fleet.add_device("lab-1").await.unwrap();

        let store = Arc::new(JsonStore::in_memory());
        store.upsert_device(Device::new("lab-1", &address, 1)).await.unwrap();

        let settings = SchedulerConf {
            reconcile_interval_secs: 1,
            echo_interval_secs: 1,
            poll_timeout_secs: 1,
            echo_timeout_secs: 1,
            failure_threshold: 2,
        };
        let client = Arc::new(HttpDeviceClient::new(settings.poll_timeout(), settings.echo_timeout()));
        let mut ctx = context_with(store.clone(), client);
        ctx.settings = settings;
        let watchers = WatcherMap::new();

        let reconciler = spawn_reconciler(ctx.clone(), watchers.clone());
        let prober = spawn_echo_prober(ctx.clone());

        fleet
            .wait_for_requests("lab-1", RequestKind::Sense, 2, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(store.latest_readings().await.contains_key("lab-1"));

        // panne : deux échecs -> offline, plus de watcher
        fleet.device("lab-1").unwrap().set_behavior(Behavior::HttpError(500));
        let went_offline = wait_until(Duration::from_secs(10), || {
            let store = store.clone();
            async move {
                matches!(store.get_device("lab-1").await, Ok(Some(d)) if d.status == DeviceStatus::Offline)
            }
        })
        .await;
        assert!(went_offline);

        // retour : echo -> online -> reconcile -> nouveau watcher
        fleet.device("lab-1").unwrap().set_behavior(Behavior::Healthy);
        let recovered = wait_until(Duration::from_secs(10), || {
            let store = store.clone();
            let watchers = watchers.clone();
            async move {
                let online = matches!(store.get_device("lab-1").await, Ok(Some(d)) if d.status == DeviceStatus::Online);
                online && watchers.contains("lab-1")
            }
        })
        .await;
        assert!(recovered);

        fleet.get_stats().print();
        ctx.shutdown.cancel();
        reconciler.await.unwrap();
        prober.await.unwrap();
    }
}
