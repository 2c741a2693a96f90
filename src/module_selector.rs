//! Module selection
//!
//! Resolves configured provider ids and compatibility requirements to registered module
//! implementations. Selection is deterministic and never panics: a missing implementation is a
//! `ModuleNotFound` error that callers treat as "skip this target".

use crate::errors::{ModuleKind, SelectionError};
use crate::traits::{
    CompatibilityModule, PassthroughCompatibility, ProviderFactory, ProviderModule, ProviderSlot,
    SystemPromptInlining,
};
use crate::target::ProviderConfig;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Adapts a closure into a `ProviderFactory`.
struct FnFactory<F>(F);

impl<F> ProviderFactory for FnFactory<F>
where
    F: Fn(ProviderSlot<'_>) -> Result<Arc<dyn ProviderModule>, SelectionError> + Send + Sync,
{
    fn create(&self, slot: ProviderSlot<'_>) -> Result<Arc<dyn ProviderModule>, SelectionError> {
        (self.0)(slot)
    }
}

/// Registry of provider factories and compatibility modules.
#[derive(Clone, Default)]
pub struct ModuleSelector {
    /// Keyed by provider id or provider type.
    providers: HashMap<String, Arc<dyn ProviderFactory>>,
    /// Kept in registration order, which is the fallback search order.
    compatibility: Vec<Arc<dyn CompatibilityModule>>,
}

impl fmt::Debug for ModuleSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut providers: Vec<_> = self.providers.keys().collect();
        providers.sort();
        f.debug_struct("ModuleSelector")
            .field("providers", &providers)
            .field(
                "compatibility",
                &self.compatibility.iter().map(|m| m.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ModuleSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A selector with the built-in compatibility modules registered.
    pub fn with_builtin_compatibility() -> Self {
        let mut selector = Self::new();
        selector.register_compatibility(Arc::new(PassthroughCompatibility));
        selector.register_compatibility(Arc::new(SystemPromptInlining));
        selector
    }

    /// Register a provider factory under a provider id or a provider type.
    /// Registering the same key twice replaces the earlier factory.
    pub fn register_provider(&mut self, key: impl Into<String>, factory: Arc<dyn ProviderFactory>) {
        let key = key.into();
        debug!("Registering provider factory '{}'", key);
        self.providers.insert(key, factory);
    }

    pub fn register_provider_fn<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(ProviderSlot<'_>) -> Result<Arc<dyn ProviderModule>, SelectionError>
            + Send
            + Sync
            + 'static,
    {
        self.register_provider(key, Arc::new(FnFactory(factory)));
    }

    pub fn register_compatibility(&mut self, module: Arc<dyn CompatibilityModule>) {
        debug!("Registering compatibility module '{}'", module.id());
        self.compatibility.push(module);
    }

    /// Select the factory for a provider: exact id match first, then the provider's `type`.
    pub fn select_provider(
        &self,
        provider_id: &str,
        provider: &ProviderConfig,
    ) -> Result<Arc<dyn ProviderFactory>, SelectionError> {
        if let Some(factory) = self.providers.get(provider_id) {
            trace!(provider_id, "Selected provider factory by id");
            return Ok(Arc::clone(factory));
        }

        if let Some(kind) = provider.kind.as_deref()
            && let Some(factory) = self.providers.get(kind)
        {
            trace!(provider_id, kind, "Selected provider factory by type");
            return Ok(Arc::clone(factory));
        }

        Err(SelectionError::ModuleNotFound {
            kind: ModuleKind::Provider,
            id: provider_id.to_string(),
        })
    }

    /// Select a compatibility module covering every requirement.
    ///
    /// A module whose id equals one of the requirements wins. Otherwise the first registered
    /// module supporting all requirements is returned.
    pub fn select_compatibility_module(
        &self,
        requirements: &[String],
    ) -> Result<Arc<dyn CompatibilityModule>, SelectionError> {
        let by_id = requirements
            .iter()
            .find_map(|req| self.compatibility.iter().find(|m| m.id() == req));
        if let Some(module) = by_id {
            return Ok(Arc::clone(module));
        }

        self.compatibility
            .iter()
            .find(|m| {
                requirements
                    .iter()
                    .all(|req| m.supports().contains(&req.as_str()))
            })
            .cloned()
            .ok_or_else(|| SelectionError::ModuleNotFound {
                kind: ModuleKind::Compatibility,
                id: requirements.join(","),
            })
    }
}
