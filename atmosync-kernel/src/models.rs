use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;

/// Statut de liaison d'un capteur tel que stocké dans le registre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Online => f.write_str("online"),
            DeviceStatus::Offline => f.write_str("offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_address")]
    pub address: Option<String>,        // ex: "10.0.0.5" ou "10.0.0.5:8080"
    pub frequency_secs: u64,
    pub status: DeviceStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_connected: Option<OffsetDateTime>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub location_id: Option<i64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub installed_at: Option<OffsetDateTime>,
}

impl Device {
    pub fn new(name: &str, address: &str, frequency_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            address: normalize_address(Some(address.to_string())),
            frequency_secs,
            status: DeviceStatus::Online,
            last_connected: None,
            mac: None,
            location_id: None,
            installed_at: None,
        }
    }

    /// Période de polling effective ; une fréquence nulle est ramenée à 1s.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.frequency_secs.max(1))
    }

    pub fn is_pollable(&self) -> bool {
        self.status == DeviceStatus::Online && self.address.is_some()
    }
}

/// Une adresse vide ou faite d'espaces équivaut à pas d'adresse.
fn normalize_address(address: Option<String>) -> Option<String> {
    address
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
}

fn deserialize_address<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(normalize_address)
}

/// Un relevé température / humidité, immuable une fois créé.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device: String,
    pub temperature: f64,
    pub humidity: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Sélection des capteurs côté registre.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub status: Option<DeviceStatus>,
    pub require_address: bool,
}

impl DeviceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Capteurs éligibles au polling : online avec une adresse.
    pub fn pollable() -> Self {
        Self::reachable(DeviceStatus::Online)
    }

    /// Capteurs d'un statut donné qui ont une adresse à sonder.
    pub fn reachable(status: DeviceStatus) -> Self {
        Self {
            status: Some(status),
            require_address: true,
        }
    }

    pub fn matches(&self, device: &Device) -> bool {
        if let Some(status) = self.status {
            if device.status != status {
                return false;
            }
        }
        !self.require_address || device.address.is_some()
    }
}
