/*!
Test Harness pour l'agent d'acquisition

Facilite l'écriture de tests d'intégration avec:
- Setup automatique du coordinateur simulé
- Expectations sur le nombre de réponses par ordre
- Assertions sur les champs des réponses
*/

use crate::coordinator_stub::MockCoordinator;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;

/// Harness de test: un coordinateur simulé et des expectations
pub struct TestHarness {
    pub coordinator: MockCoordinator,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    order: String,
    expected_count: usize,
}

impl TestHarness {
    /// Crée un nouveau harness de test
    pub async fn new() -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        Ok(Self {
            coordinator: MockCoordinator::start().await?,
            expectations: Vec::new(),
        })
    }

    /// Port de réponse à placer dans `sendBack`/`sendBackPort`
    pub fn reply_port(&self) -> u16 {
        self.coordinator.port()
    }

    /// Ajoute une expectation: exactement N réponses `order`
    pub fn expect_replies(&mut self, order: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            order: order.to_string(),
            expected_count: count,
        });
        self
    }

    /// Vérifie toutes les expectations après `settle_ms`
    pub async fn verify_expectations(&self, settle_ms: u64) -> Result<()> {
        log::info!("🔍 Verifying {} expectations...", self.expectations.len());
        tokio::time::sleep(std::time::Duration::from_millis(settle_ms)).await;

        for expectation in &self.expectations {
            let actual_count = self.coordinator.messages_with_order(&expectation.order).len();

            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for '{}': expected {} replies, got {}",
                    expectation.order,
                    expectation.expected_count,
                    actual_count
                );
            }

            log::info!("✅ '{}': {} replies as expected", expectation.order, actual_count);
        }

        Ok(())
    }

    /// Attend une réponse `order` (5 s max)
    pub async fn wait_for_reply(&self, order: &str) -> Result<Value> {
        self.coordinator
            .wait_for_order(order, 5000)
            .await
            .ok_or_else(|| anyhow::anyhow!("No {} reply received", order))
    }

    /// Assert qu'un champ existe dans la dernière réponse `order`
    pub fn assert_field_exists(&self, order: &str, field_path: &str) -> Result<()> {
        if let Some(msg) = self.coordinator.messages_with_order(order).last() {
            if get_nested_field(msg, field_path).is_some() {
                return Ok(());
            }
        }

        anyhow::bail!("Field '{}' not found in latest {} reply", field_path, order);
    }

    /// Assert qu'un champ a une valeur spécifique
    pub fn assert_field_equals(&self, order: &str, field_path: &str, expected: &Value) -> Result<()> {
        if let Some(msg) = self.coordinator.messages_with_order(order).last() {
            if let Some(actual) = get_nested_field(msg, field_path) {
                if actual == expected {
                    log::info!("✅ Field '{}' = {} in {}", field_path, expected, order);
                    return Ok(());
                }
                anyhow::bail!(
                    "Field '{}' mismatch: expected {}, got {}",
                    field_path,
                    expected,
                    actual
                );
            }
        }

        anyhow::bail!("Field '{}' not found for comparison in {}", field_path, order);
    }

    /// Nombre de réponses reçues par ordre
    pub fn reply_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for msg in self.coordinator.messages() {
            let order = msg["order"].as_str().unwrap_or("?").to_string();
            *counts.entry(order).or_insert(0) += 1;
        }
        counts
    }
}

/// Champ imbriqué par chemin pointé (`details.ram.total`, `errors.0`)
pub fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;

    for part in path.split('.') {
        current = match current {
            Value::Object(obj) => obj.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}
