//! Name-keyed factory registries for statically linked adapters.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::{BrokerAdapter, BrokerResult, DataProviderAdapter, ProviderResult};

static BROKERS: Lazy<RwLock<HashMap<String, Arc<dyn BrokerFactory>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));
static PROVIDERS: Lazy<RwLock<HashMap<String, Arc<dyn DataProviderFactory>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Builds broker adapters from an opaque JSON configuration payload.
#[async_trait]
pub trait BrokerFactory: Send + Sync {
    /// Canonical name the factory is registered under (e.g. `paper`).
    fn name(&self) -> &'static str;

    /// Construct a configured adapter instance.
    async fn create(&self, config: &Value) -> BrokerResult<Arc<dyn BrokerAdapter>>;
}

/// Builds data-provider adapters from an opaque JSON configuration payload.
#[async_trait]
pub trait DataProviderFactory: Send + Sync {
    /// Canonical name the factory is registered under (e.g. `demo`).
    fn name(&self) -> &'static str;

    /// Construct a configured provider instance.
    async fn create(&self, config: &Value) -> ProviderResult<Arc<dyn DataProviderAdapter>>;
}

/// Register a broker factory, replacing any previous registration.
pub fn register_broker_factory(factory: Arc<dyn BrokerFactory>) {
    let name = normalize(factory.name());
    let mut map = BROKERS.write().expect("broker registry poisoned");
    if map.insert(name, factory.clone()).is_some() {
        tracing::warn!(
            broker = factory.name(),
            "duplicate broker factory registration; overriding previous"
        );
    }
}

/// Register a data-provider factory, replacing any previous registration.
pub fn register_data_provider_factory(factory: Arc<dyn DataProviderFactory>) {
    let name = normalize(factory.name());
    let mut map = PROVIDERS.write().expect("provider registry poisoned");
    if map.insert(name, factory.clone()).is_some() {
        tracing::warn!(
            provider = factory.name(),
            "duplicate provider factory registration; overriding previous"
        );
    }
}

/// Look up a broker factory by name.
pub fn broker_factory(name: &str) -> Option<Arc<dyn BrokerFactory>> {
    let map = BROKERS.read().expect("broker registry poisoned");
    map.get(&normalize(name)).cloned()
}

/// Look up a data-provider factory by name.
pub fn data_provider_factory(name: &str) -> Option<Arc<dyn DataProviderFactory>> {
    let map = PROVIDERS.read().expect("provider registry poisoned");
    map.get(&normalize(name)).cloned()
}

/// Names of every registered broker factory, sorted.
pub fn registered_brokers() -> Vec<String> {
    let map = BROKERS.read().expect("broker registry poisoned");
    let mut names: Vec<String> = map.keys().cloned().collect();
    names.sort_unstable();
    names
}

/// Names of every registered data-provider factory, sorted.
pub fn registered_data_providers() -> Vec<String> {
    let map = PROVIDERS.read().expect("provider registry poisoned");
    let mut names: Vec<String> = map.keys().cloned().collect();
    names.sort_unstable();
    names
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}
