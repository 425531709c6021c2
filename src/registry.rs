use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::provider::Provider;
use crate::{CalciferError, Result};

/// Provider dispatch table: a name table plus a model reverse index, both
/// guarded by one lock so readers always see a consistent snapshot.
///
/// Registration happens at startup and is rare; lookups are per-request.
/// When two providers claim the same model the later registration wins,
/// which operators should keep in mind when ordering registrations.
pub struct ProviderRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    providers: HashMap<String, Arc<dyn Provider>>,
    model_to_provider: HashMap<String, String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn register(&self, provider: Arc<dyn Provider>) -> Result<()> {
        let name = provider.name().to_string();
        if name.is_empty() {
            return Err(CalciferError::InvalidArgument(
                "provider name cannot be empty".to_string(),
            ));
        }

        let models = provider.supported_models();

        let mut inner = self.inner.write();
        if inner.providers.contains_key(&name) {
            return Err(CalciferError::InvalidArgument(format!(
                "provider {name} already registered"
            )));
        }

        inner.providers.insert(name.clone(), provider);
        for model in models {
            if let Some(previous) = inner.model_to_provider.insert(model.clone(), name.clone()) {
                if previous != name {
                    tracing::debug!(
                        model,
                        from = previous,
                        to = name,
                        "model re-routed by later registration"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, provider_name: &str) -> Result<Arc<dyn Provider>> {
        if provider_name.is_empty() {
            return Err(CalciferError::InvalidArgument(
                "provider name cannot be empty".to_string(),
            ));
        }

        let inner = self.inner.read();
        inner
            .providers
            .get(provider_name)
            .cloned()
            .ok_or_else(|| CalciferError::NotFound(format!("provider {provider_name}")))
    }

    /// Resolve a provider by model via the reverse index, falling back to a
    /// linear `is_model_supported` scan for models a provider accepts without
    /// enumerating them at registration.
    pub fn get_by_model(&self, model: &str) -> Result<Arc<dyn Provider>> {
        if model.is_empty() {
            return Err(CalciferError::InvalidArgument(
                "model cannot be empty".to_string(),
            ));
        }

        let inner = self.inner.read();
        if let Some(name) = inner.model_to_provider.get(model) {
            if let Some(provider) = inner.providers.get(name) {
                return Ok(provider.clone());
            }
        }

        inner
            .providers
            .values()
            .find(|provider| provider.is_model_supported(model))
            .cloned()
            .ok_or_else(|| CalciferError::NotFound(format!("no provider for model {model}")))
    }

    pub fn list(&self) -> Vec<String> {
        self.inner.read().providers.keys().cloned().collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
