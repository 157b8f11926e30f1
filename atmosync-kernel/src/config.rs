use crate::models::Device;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, time::Duration};
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct KernelConfig {
    #[serde(default)]
    pub http: HttpConf,
    #[serde(default)]
    pub store: StoreConf,
    #[serde(default)]
    pub scheduler: SchedulerConf,
    /// Capteurs ajoutés au registre au démarrage s'ils n'y sont pas déjà
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceSeed>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConf {
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConf {
    pub data_dir: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SchedulerConf {
    pub reconcile_interval_secs: u64,
    pub echo_interval_secs: u64,
    pub poll_timeout_secs: u64,
    pub echo_timeout_secs: u64,
    pub failure_threshold: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceSeed {
    pub address: String,
    pub frequency_secs: u64,
    pub mac: Option<String>,
    pub location_id: Option<i64>,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:3000".into() }
    }
}

impl Default for StoreConf {
    fn default() -> Self {
        Self { data_dir: "./data".into() }
    }
}

impl Default for SchedulerConf {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 60,
            echo_interval_secs: 300,
            poll_timeout_secs: 10,
            echo_timeout_secs: 10,
            failure_threshold: 2,
        }
    }
}

impl SchedulerConf {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn echo_interval(&self) -> Duration {
        Duration::from_secs(self.echo_interval_secs.max(1))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs.max(1))
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_secs(self.echo_timeout_secs.max(1))
    }

    /// Seuil d'échecs consécutifs avant passage offline (au moins 1)
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold.max(1)
    }
}

impl KernelConfig {
    pub fn seed_devices(&self) -> Vec<Device> {
        self.devices
            .iter()
            .map(|(name, seed)| {
                // adresse vide => None, le capteur reste hors polling
                let mut device = Device::new(name, &seed.address, seed.frequency_secs);
                device.mac = seed.mac.clone();
                device.location_id = seed.location_id;
                device.installed_at = Some(time::OffsetDateTime::now_utc());
                device
            })
            .collect()
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("ATMOSYNC_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!(path = %path, error = %e, "invalid config, using defaults");
            KernelConfig::default()
        })
    } else {
        warn!(path = %path, "no config file, using defaults");
        KernelConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceStatus;

    #[test]
    fn test_defaults() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.http.bind, "0.0.0.0:3000");
        assert_eq!(cfg.scheduler.reconcile_interval(), Duration::from_secs(60));
        assert_eq!(cfg.scheduler.echo_interval(), Duration::from_secs(300));
        assert_eq!(cfg.scheduler.failure_threshold(), 2);
        assert!(cfg.devices.is_empty());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
scheduler:
  failure_threshold: 3
  echo_interval_secs: 120
devices:
  sensorA:
    address: "10.0.0.5"
    frequency_secs: 5
"#;
        let cfg = parse_config(yaml).unwrap();
        assert_eq!(cfg.scheduler.failure_threshold, 3);
        assert_eq!(cfg.scheduler.echo_interval_secs, 120);
        // valeurs non précisées = défauts
        assert_eq!(cfg.scheduler.reconcile_interval_secs, 60);
        assert_eq!(cfg.store.data_dir, "./data");

        let seeds = cfg.seed_devices();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].name, "sensorA");
        assert_eq!(seeds[0].address.as_deref(), Some("10.0.0.5"));
        assert_eq!(seeds[0].status, DeviceStatus::Online);
    }

    #[test]
    fn test_blank_seed_address() {
        let yaml = r#"
devices:
  sensorA:
    address: ""
    frequency_secs: 5
  sensorB:
    address: "   "
    frequency_secs: 5
    mac: "aa:bb:cc:dd:ee:ff"
"#;
        let seeds = parse_config(yaml).unwrap().seed_devices();
        assert_eq!(seeds.len(), 2);
        assert!(seeds.iter().all(|d| d.address.is_none()));
        assert!(seeds.iter().all(|d| !d.is_pollable()));
        assert_eq!(seeds[1].mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert!(seeds[1].installed_at.is_some());
    }

    #[test]
    fn test_empty_and_invalid_yaml() {
        assert!(parse_config("   ").unwrap().devices.is_empty());
        assert!(parse_config("scheduler: [1, 2").is_err());
    }
}
