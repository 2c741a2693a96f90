//! Built-in provider modules

mod openai;

pub use openai::{OpenAiCompatibleProvider, OpenAiProviderFactory};

use crate::client::HttpClient;
use crate::module_selector::ModuleSelector;
use std::sync::Arc;

/// Provider `type` values served by the OpenAI-compatible module.
pub const OPENAI_COMPATIBLE_TYPES: &[&str] = &["openai", "openai-compatible", "azure-openai"];

/// Register the built-in providers under their `type` names.
pub fn register_builtin(selector: &mut ModuleSelector, client: Arc<dyn HttpClient>) {
    let factory = Arc::new(OpenAiProviderFactory::new(client));
    for kind in OPENAI_COMPATIBLE_TYPES {
        selector.register_provider(*kind, factory.clone());
    }
}
