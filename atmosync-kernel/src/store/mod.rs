/**
 * STORE - Interfaces de persistance consommées par l'ordonnanceur
 *
 * RÔLE :
 * Ce module définit les trois façades étroites que le kernel utilise pour
 * parler au stockage : lecture du registre, écriture du statut, ingestion
 * des relevés. L'ordonnanceur ne connaît que ces traits.
 *
 * FONCTIONNEMENT :
 * - DeviceRegistry = lecture seule des fiches capteurs (filtrées, triées par nom)
 * - StatusWriter = bascule online/offline idempotente, scoped par capteur
 * - ReadingSink = ajout d'un relevé (append-only)
 * - JsonStore = implémentation fichier (devices.json + readings.jsonl)
 *
 * Les écritures sont "fire-and-forget" côté ordonnanceur : une erreur est
 * loggée par l'appelant, jamais retentée.
 */

pub mod json;

use crate::models::{Device, DeviceFilter, DeviceStatus, Reading};
use async_trait::async_trait;
use time::OffsetDateTime;

pub use json::JsonStore;

/// Erreurs possibles lors des accès au stockage
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Device not found: {0}")]
    UnknownDevice(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Résultat d'une écriture de statut : le registre a-t-il réellement changé ?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Changed { from: DeviceStatus, to: DeviceStatus },
    Unchanged,
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Fiches capteurs correspondant au filtre, triées par nom
    async fn list_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>, StoreError>;

    /// Fiche d'un capteur, `None` s'il a disparu du registre
    async fn get_device(&self, name: &str) -> Result<Option<Device>, StoreError>;
}

#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Écrit le statut et la date de dernière connexion. Si le capteur a déjà
    /// ce statut, rien n'est modifié et `Unchanged` est retourné.
    async fn set_status(
        &self,
        name: &str,
        status: DeviceStatus,
        last_connected: OffsetDateTime,
    ) -> Result<StatusChange, StoreError>;
}

#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn insert_reading(&self, reading: &Reading) -> Result<(), StoreError>;
}
