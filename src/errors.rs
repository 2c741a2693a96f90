//! Error types for module selection, provider execution, routing and the
//! pool/blacklist coordinator.
use std::fmt;
use std::time::Duration;

/// Failures while resolving a configured target to concrete modules.
///
/// These are assembly-time errors. The assembler records them as warnings and
/// skips the offending target rather than aborting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("no {kind} module registered for '{id}'")]
    ModuleNotFound { kind: ModuleKind, id: String },

    #[error("invalid target {provider_id}.{model_id}: {reason}")]
    InvalidTarget {
        provider_id: String,
        model_id: String,
        reason: String,
    },
}

/// The kind of module a selection was looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Provider,
    Compatibility,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Provider => write!(f, "provider"),
            ModuleKind::Compatibility => write!(f, "compatibility"),
        }
    }
}

/// Errors returned by a single pipeline execution.
///
/// Every variant is retryable from the scheduler's point of view: the failed
/// pipeline is penalized and the request fails over to another target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream returned status {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Short, stable label used in metrics and attempt summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Upstream { .. } => "upstream",
            ProviderError::Transport(_) => "transport",
            ProviderError::InvalidResponse(_) => "invalid_response",
            ProviderError::Unavailable(_) => "unavailable",
        }
    }
}

/// One failed attempt within a routing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub pipeline_id: String,
    pub provider_id: String,
    pub model_id: String,
    pub error: ProviderError,
}

/// Errors surfaced to the caller of `route_request`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RoutingError {
    #[error("virtual model '{0}' not found")]
    VirtualModelNotFound(String),

    #[error(
        "no available target for virtual model '{virtual_model}' ({} targets attempted)",
        .attempted.len()
    )]
    NoAvailableTarget {
        virtual_model: String,
        attempted: Vec<AttemptFailure>,
    },
}

/// Errors from pool/blacklist mutations. A failed mutation never leaves
/// partial state behind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid model id '{0}': expected 'provider.model'")]
    InvalidModelId(String),

    /// The id names a provider that is not configured.
    #[error("unknown model '{0}': provider is not configured")]
    UnknownModel(String),

    #[error("'{0}' would be present in both the pool and the blacklist")]
    InvariantViolation(String),
}
