/*!
# AtmoSync DevKit - Capteurs simulés et utilitaires de test

Bibliothèque facilitant le développement et les tests du kernel AtmoSync:
- Capteur HTTP simulé parlant le protocole `SENSE` / `ECHO`
- Pannes scriptables (réponse invalide, lenteur, HTTP 500, corps vide)
- Harness de flotte pour attendre des requêtes avec timeout
*/

pub mod mock_device;
pub mod test_utils;

pub use mock_device::{Behavior, MockDevice, RecordedRequest, RequestKind};
pub use test_utils::FleetHarness;
