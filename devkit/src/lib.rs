/*!
# Acquisition DevKit - Stubs et Utilitaires pour Tests

Bibliothèque facilitant les tests de l'agent d'acquisition avec:
- Coordinateur simulé (endpoint de réponse TCP qui collecte le JSON reçu)
- Instruments TCP simulés (réponse fixe, délai configurable)
- Builders pour les ordres du coordinateur
*/

pub mod coordinator_stub;
pub mod orders;
pub mod test_utils;

pub use coordinator_stub::{MockCoordinator, MockInstrument};
pub use orders::{send_order, send_raw_line, OrderBuilder};
pub use test_utils::TestHarness;
