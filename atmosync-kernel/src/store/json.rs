/**
 * JSON STORE - Registre capteurs + relevés sur fichiers
 *
 * FONCTIONNEMENT :
 * - devices.json : map nom -> fiche capteur, relue à chaque requête registre
 *   (une édition externe du fichier est donc vue au cycle suivant)
 * - readings.jsonl : un relevé JSON par ligne, en append ; seul le dernier
 *   relevé de chaque capteur reste en mémoire, l'historique est relu du fichier
 * - mode mémoire (sans fichiers) pour les tests, historique borné
 */

use super::{DeviceRegistry, ReadingSink, StatusChange, StatusWriter, StoreError};
use crate::models::{Device, DeviceFilter, DeviceStatus, Reading};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DEVICES_FILE: &str = "devices.json";
const READINGS_FILE: &str = "readings.jsonl";
/// Relevés gardés en mode mémoire, les plus anciens sont oubliés
const MEMORY_HISTORY_CAP: usize = 10_000;

#[derive(Default)]
struct ReadingLog {
    latest: HashMap<String, Reading>,
    /// Historique du mode mémoire uniquement ; vide quand un fichier existe
    history: VecDeque<Reading>,
}

impl ReadingLog {
    fn record_latest(&mut self, reading: &Reading) {
        match self.latest.get(&reading.device) {
            Some(current) if current.timestamp > reading.timestamp => {}
            _ => {
                self.latest.insert(reading.device.clone(), reading.clone());
            }
        }
    }
}

pub struct JsonStore {
    devices_path: Option<PathBuf>,
    readings_path: Option<PathBuf>,
    devices: Mutex<BTreeMap<String, Device>>,
    /// Le verrou async sérialise aussi les appends fichier
    readings: Mutex<ReadingLog>,
}

fn in_range(reading: &Reading, device: &str, from: OffsetDateTime, to: OffsetDateTime) -> bool {
    reading.device == device && reading.timestamp >= from && reading.timestamp <= to
}

impl JsonStore {
    /// Store sans persistance
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            devices_path: None,
            readings_path: None,
            devices: Mutex::new(BTreeMap::new()),
            readings: Mutex::new(ReadingLog::default()),
        }
    }

    /// Ouvre (ou crée) le store dans `data_dir`
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        let dir = data_dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let store = Self {
            devices_path: Some(dir.join(DEVICES_FILE)),
            readings_path: Some(dir.join(READINGS_FILE)),
            devices: Mutex::new(BTreeMap::new()),
            readings: Mutex::new(ReadingLog::default()),
        };

        {
            let mut devices = store.devices.lock().await;
            store.refresh_devices(&mut devices).await?;
            info!(devices = devices.len(), dir = %dir.display(), "device registry loaded");
        }
        store.load_readings().await?;
        Ok(store)
    }

    /// Relit devices.json s'il existe ; sinon garde l'état courant
    async fn refresh_devices(&self, devices: &mut BTreeMap<String, Device>) -> Result<(), StoreError> {
        let Some(path) = &self.devices_path else { return Ok(()) };
        if !tokio::fs::try_exists(path).await? {
            return Ok(());
        }

        let content = tokio::fs::read_to_string(path).await?;
        if content.trim().is_empty() {
            devices.clear();
            return Ok(());
        }

        let loaded: BTreeMap<String, Device> = serde_json::from_str(&content)?;
        *devices = loaded
            .into_iter()
            .map(|(name, mut device)| {
                // la clé fait foi
                device.name = name.clone();
                (name, device)
            })
            .collect();
        Ok(())
    }

    async fn save_devices(&self, devices: &BTreeMap<String, Device>) -> Result<(), StoreError> {
        let Some(path) = &self.devices_path else { return Ok(()) };
        let content = serde_json::to_string_pretty(devices)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Parcourt readings.jsonl ligne à ligne sans le charger en entier
    async fn scan_readings<F>(&self, mut visit: F) -> Result<usize, StoreError>
    where
        F: FnMut(Reading),
    {
        let Some(path) = &self.readings_path else { return Ok(0) };
        if !tokio::fs::try_exists(path).await? {
            return Ok(0);
        }

        let file = tokio::fs::File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut idx = 0;
        let mut seen = 0;
        while let Some(line) = lines.next_line().await? {
            idx += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Reading>(&line) {
                Ok(reading) => {
                    seen += 1;
                    visit(reading);
                }
                Err(e) => warn!(line = idx, error = %e, "skipping corrupt reading"),
            }
        }
        Ok(seen)
    }

    /// Au démarrage : seul le dernier relevé de chaque capteur est gardé
    async fn load_readings(&self) -> Result<(), StoreError> {
        let mut log = self.readings.lock().await;
        let seen = self.scan_readings(|reading| log.record_latest(&reading)).await?;
        info!(readings = seen, devices = log.latest.len(), "readings index loaded");
        Ok(())
    }

    /// Ajoute les capteurs de la config absents du registre. Retourne le nombre ajouté.
    pub async fn seed_devices(&self, seeds: Vec<Device>) -> Result<usize, StoreError> {
        let mut devices = self.devices.lock().await;
        self.refresh_devices(&mut devices).await?;

        let mut added = 0;
        for device in seeds {
            if !devices.contains_key(&device.name) {
                debug!(device = %device.name, "seeding device");
                devices.insert(device.name.clone(), device);
                added += 1;
            }
        }
        if added > 0 {
            self.save_devices(&devices).await?;
        }
        Ok(added)
    }

    /// Crée ou remplace une fiche capteur
    #[cfg(test)]
    pub async fn upsert_device(&self, device: Device) -> Result<(), StoreError> {
        let mut devices = self.devices.lock().await;
        self.refresh_devices(&mut devices).await?;
        devices.insert(device.name.clone(), device);
        self.save_devices(&devices).await
    }

    #[cfg(test)]
    pub async fn remove_device(&self, name: &str) -> Result<Option<Device>, StoreError> {
        let mut devices = self.devices.lock().await;
        self.refresh_devices(&mut devices).await?;
        let removed = devices.remove(name);
        if removed.is_some() {
            self.save_devices(&devices).await?;
        }
        Ok(removed)
    }

    /// Dernier relevé connu par capteur
    pub async fn latest_readings(&self) -> HashMap<String, Reading> {
        self.readings.lock().await.latest.clone()
    }

    /// Relevés d'un capteur dans [from, to], triés par date croissante.
    /// Avec un fichier, l'historique est relu depuis readings.jsonl.
    pub async fn readings_between(
        &self,
        device: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<Reading>, StoreError> {
        let mut out: Vec<Reading> = if self.readings_path.is_some() {
            let mut found = Vec::new();
            self.scan_readings(|r| {
                if in_range(&r, device, from, to) {
                    found.push(r);
                }
            })
            .await?;
            found
        } else {
            let log = self.readings.lock().await;
            log.history.iter().filter(|r| in_range(r, device, from, to)).cloned().collect()
        };
        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }
}

#[async_trait]
impl DeviceRegistry for JsonStore {
    async fn list_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>, StoreError> {
        let mut devices = self.devices.lock().await;
        self.refresh_devices(&mut devices).await?;
        // BTreeMap : déjà trié par nom
        Ok(devices.values().filter(|d| filter.matches(d)).cloned().collect())
    }

    async fn get_device(&self, name: &str) -> Result<Option<Device>, StoreError> {
        let mut devices = self.devices.lock().await;
        self.refresh_devices(&mut devices).await?;
        Ok(devices.get(name).cloned())
    }
}

#[async_trait]
impl StatusWriter for JsonStore {
    async fn set_status(
        &self,
        name: &str,
        status: DeviceStatus,
        last_connected: OffsetDateTime,
    ) -> Result<StatusChange, StoreError> {
        let mut devices = self.devices.lock().await;
        self.refresh_devices(&mut devices).await?;

        let device = devices
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownDevice(name.to_string()))?;

        if device.status == status {
            return Ok(StatusChange::Unchanged);
        }

        let from = device.status;
        device.status = status;
        device.last_connected = Some(last_connected);
        self.save_devices(&devices).await?;

        Ok(StatusChange::Changed { from, to: status })
    }
}

#[async_trait]
impl ReadingSink for JsonStore {
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError> {
        let mut log = self.readings.lock().await;

        if let Some(path) = &self.readings_path {
            let mut line = serde_json::to_string(reading)?;
            line.push('\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        } else {
            if log.history.len() >= MEMORY_HISTORY_CAP {
                log.history.pop_front();
            }
            log.history.push_back(reading.clone());
        }

        log.record_latest(reading);
        Ok(())
    }
}
