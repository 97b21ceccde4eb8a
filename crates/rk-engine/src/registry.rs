//! Named set of metadata providers, passed to the gateway at construction.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::provider::MetadataProvider;

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn MetadataProvider>>,
    primary: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider under its own name, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn MetadataProvider>) {
        let name = provider.name().to_lowercase();
        tracing::debug!(provider = %name, "Registered metadata provider");
        self.providers.insert(name, provider);
    }

    pub fn with(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Provider used when a job does not name one.
    pub fn set_primary(&mut self, name: impl Into<String>) {
        self.primary = Some(name.into().to_lowercase());
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MetadataProvider>> {
        self.providers.get(&name.to_lowercase()).cloned()
    }

    /// The configured primary provider, else the first by name.
    pub fn primary(&self) -> Option<&str> {
        match &self.primary {
            Some(name) if self.providers.contains_key(name) => Some(name.as_str()),
            _ => self.providers.keys().next().map(String::as_str),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
