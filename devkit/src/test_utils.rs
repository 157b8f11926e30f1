/*!
Harness de flotte pour tests du kernel

Facilite l'écriture de tests bout-en-bout avec:
- Démarrage de plusieurs capteurs simulés
- Attente d'un nombre de requêtes avec timeout
- Statistiques de requêtes par capteur
*/

use crate::mock_device::{MockDevice, RequestKind};
use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;

/// Flotte de capteurs simulés, indexés par nom
pub struct FleetHarness {
    devices: HashMap<String, MockDevice>,
}

impl FleetHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        Self {
            devices: HashMap::new(),
        }
    }

    /// Démarre un capteur simulé et retourne son adresse
    pub async fn add_device(&mut self, name: &str) -> Result<String> {
        let device = MockDevice::start(name).await?;
        let address = device.address();
        self.devices.insert(name.to_string(), device);
        Ok(address)
    }

    pub fn device(&self, name: &str) -> Option<&MockDevice> {
        self.devices.get(name)
    }

    /// Arrête un capteur (le port ne répond plus)
    pub fn remove_device(&mut self, name: &str) -> bool {
        self.devices.remove(name).is_some()
    }

    /// Attend qu'un capteur ait reçu au moins `count` requêtes du type donné
    pub async fn wait_for_requests(
        &self,
        name: &str,
        kind: RequestKind,
        count: usize,
        timeout: Duration,
    ) -> Result<usize> {
        let device = self
            .devices
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown mock device: {}", name))?;

        let start = std::time::Instant::now();
        loop {
            let seen = device.count(kind);
            if seen >= count {
                log::info!("✅ {} received {} {:?} requests", name, seen, kind);
                return Ok(seen);
            }
            if start.elapsed() >= timeout {
                anyhow::bail!(
                    "Timeout waiting for {} {:?} requests on {}: got {}",
                    count, kind, name, seen
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Stats sur les requêtes reçues
    pub fn get_stats(&self) -> FleetStats {
        let mut per_device = HashMap::new();
        let mut total_requests = 0;
        for (name, device) in &self.devices {
            let n = device.requests().len();
            total_requests += n;
            per_device.insert(name.clone(), n);
        }
        FleetStats {
            total_requests,
            per_device,
        }
    }
}

impl Default for FleetHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct FleetStats {
    pub total_requests: usize,
    pub per_device: HashMap<String, usize>,
}

impl FleetStats {
    pub fn print(&self) {
        println!("📊 Fleet Statistics:");
        println!("  Total requests: {}", self.total_requests);
        for (name, count) in &self.per_device {
            println!("    {}: {} requests", name, count);
        }
    }
}
