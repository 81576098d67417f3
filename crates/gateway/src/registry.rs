// BSD-2-Clause

//! Adapter factory registry: turns the `{adapters: [...]}` section of the
//! gateway document into a running [`AggregatingAdapter`], and the
//! `{agents: [...]}` section into a set of enabled agent surfaces.
//!
//! Every adapter kind is registered under a name at startup; the config
//! document then only needs to name a kind plus its constructor args, so
//! adding a new transport never touches the config schema itself.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::adapter::aggregating::AggregatingAdapter;
use crate::adapter::virtual_device::VirtualDeviceAdapter;
use crate::adapter::DeviceAdapter;
use crate::config::{AdapterEntry, GatewayDocument};
use crate::error::{unknown_adapter, GatewayResult};

/// Builds one named adapter kind from its config entry.
type AdapterFactory = fn(&AdapterEntry) -> GatewayResult<Arc<dyn DeviceAdapter>>;

/// Maps adapter kind names to their factories, and turns a config document
/// into the aggregated runtime adapter the rest of the gateway talks to.
pub struct AdapterRegistry {
    factories: HashMap<&'static str, AdapterFactory>,
}

impl AdapterRegistry {
    /// A registry pre-populated with every adapter kind this build ships.
    pub fn with_builtins() -> Self {
        let mut registry = Self { factories: HashMap::new() };
        registry.register("virtual", build_virtual_adapter);
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: AdapterFactory) {
        self.factories.insert(name, factory);
    }

    /// Instantiate every adapter named in `document`, then wrap them in one
    /// [`AggregatingAdapter`] so the session layer sees a single device space
    /// regardless of how many underlying transports are configured.
    pub fn build(&self, document: &GatewayDocument, max_connect_retries: u32) -> GatewayResult<Arc<dyn DeviceAdapter>> {
        let mut adapters = Vec::with_capacity(document.adapters.len());
        for entry in &document.adapters {
            let factory = self
                .factories
                .get(entry.name.as_str())
                .ok_or_else(|| unknown_adapter(format!("no adapter factory registered for '{}'", entry.name)))?;
            info!(adapter = %entry.name, "constructing adapter");
            adapters.push(factory(entry)?);
        }
        if adapters.is_empty() {
            info!("no adapters configured; falling back to an in-process virtual device host");
            adapters.push(build_virtual_adapter(&AdapterEntry {
                name: "virtual".to_string(),
                port: None,
                args: HashMap::new(),
            })?);
        }
        Ok(Arc::new(AggregatingAdapter::new(adapters, max_connect_retries)))
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn build_virtual_adapter(_entry: &AdapterEntry) -> GatewayResult<Arc<dyn DeviceAdapter>> {
    Ok(Arc::new(VirtualDeviceAdapter::new()))
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
