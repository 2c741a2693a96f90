//! Provider capability traits
//!
//! Implement `ProviderModule` to make a provider routable, and `ProviderFactory` to let the
//! assembler create it from a configuration table entry.

use crate::errors::{ProviderError, SelectionError};
use crate::models::{ChatRequest, ChatResponse};
use crate::target::{ProviderConfig, TargetConfig};
use async_trait::async_trait;
use std::sync::Arc;

/// Availability reported by a provider's health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderHealth {
    Healthy,
    Unhealthy(String),
}

impl ProviderHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProviderHealth::Healthy)
    }
}

/// A provider bound to one concrete model and credential slot.
///
/// # Example
///
/// ```ignore
/// use arbiter::traits::{ProviderHealth, ProviderModule};
/// use arbiter::{ChatRequest, ChatResponse, ProviderError};
/// use async_trait::async_trait;
///
/// struct Echo;
///
/// #[async_trait]
/// impl ProviderModule for Echo {
///     fn id(&self) -> &str {
///         "echo"
///     }
///
///     async fn process(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
///         Ok(ChatResponse { model: request.model, ..Default::default() })
///     }
///
///     async fn health(&self) -> ProviderHealth {
///         ProviderHealth::Healthy
///     }
/// }
/// ```
#[async_trait]
pub trait ProviderModule: Send + Sync {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    /// Execute a request. `request.model` already holds the concrete model id.
    async fn process(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Current availability. Called by background health checks, never on the request path.
    async fn health(&self) -> ProviderHealth;
}

/// Everything a factory needs to build a provider module for one target.
#[derive(Debug, Clone, Copy)]
pub struct ProviderSlot<'a> {
    pub provider_id: &'a str,
    pub provider: &'a ProviderConfig,
    pub target: &'a TargetConfig,
}

impl ProviderSlot<'_> {
    /// The credential selected by the target's `key_index`.
    pub fn api_key(&self) -> Option<&str> {
        self.provider.api_key(self.target.key_index)
    }
}

/// Creates provider modules during assembly.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, slot: ProviderSlot<'_>) -> Result<Arc<dyn ProviderModule>, SelectionError>;
}
