use std::collections::BTreeMap;
use std::sync::Arc;

use kvx_consul::ConsulStore;
use kvx_core::{ErrorKind, Store, StoreError};
use tracing::{debug, info};

/// Builds a store from opaque, backend-specific connection options.
pub type StoreConstructor =
    Arc<dyn Fn(serde_json::Value) -> Result<Arc<dyn Store>, StoreError> + Send + Sync>;

/// Maps backend names to store constructors.
///
/// The default registry knows `"consul"`. Other adapters register under
/// their own name.
#[derive(Clone)]
pub struct StoreRegistry {
    constructors: BTreeMap<String, StoreConstructor>,
}

impl StoreRegistry {
    /// A registry with no backend at all.
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Register (or replace) the constructor for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(serde_json::Value) -> Result<Arc<dyn Store>, StoreError> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Registering store backend {}", name);
        self.constructors.insert(name, Arc::new(constructor));
        self
    }

    /// Names of the registered backends, sorted.
    pub fn backends(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Build a store for backend `name`.
    ///
    /// Fails `BackendNotSupported` when `name` is unknown; the error detail
    /// lists the supported names.
    pub fn create(
        &self,
        name: &str,
        options: serde_json::Value,
    ) -> Result<Arc<dyn Store>, StoreError> {
        let Some(constructor) = self.constructors.get(name) else {
            return Err(StoreError::with_detail(
                ErrorKind::BackendNotSupported,
                format!("{} (supported: {})", name, self.backends().join(", ")),
            ));
        };
        let store = constructor(options)?;
        info!("Created {} store", store.backend());
        Ok(store)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(kvx_consul::BACKEND_NAME, |options| {
            Ok(Arc::new(ConsulStore::from_options(options)?) as Arc<dyn Store>)
        });
        registry
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("backends", &self.backends())
            .finish()
    }
}
