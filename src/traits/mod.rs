//! Capability traits the core dispatches through
//!
//! The scheduler never depends on a concrete provider. Pipelines hold trait objects:
//!
//! - **ProviderModule**: executes a request against one provider and reports its health
//! - **ProviderFactory**: builds provider modules from configuration at assembly time
//! - **CompatibilityModule**: adapts requests/responses for providers that need it

mod compatibility;
mod provider;

pub use compatibility::{CompatibilityModule, PassthroughCompatibility, SystemPromptInlining};
pub use provider::{ProviderFactory, ProviderHealth, ProviderModule, ProviderSlot};
