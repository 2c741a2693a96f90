//! Pipelines and the pipeline pool
//!
//! A pipeline is the executable binding of one target: the provider module, an optional
//! compatibility module and the live health state the scheduler scores against. Each virtual
//! model gets its own pipeline instances, so failure counters never leak between virtual
//! models that share a provider.

use crate::errors::ProviderError;
use crate::models::{ChatRequest, ChatResponse};
use crate::traits::{CompatibilityModule, ProviderHealth, ProviderModule};
use crate::target::{AuthType, TargetConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Mutable health bookkeeping, guarded by the pipeline's mutex.
#[derive(Debug, Clone, Default)]
struct HealthState {
    healthy: bool,
    consecutive_failures: u32,
    last_checked: Option<Instant>,
    last_failure: Option<Instant>,
    last_error: Option<String>,
}

/// A point-in-time copy of a pipeline's health, used for scoring and reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_checked: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub last_error: Option<String>,
}

pub struct Pipeline {
    /// `{virtual_model}:{provider}.{model}#{key_index}`
    id: String,
    target: TargetConfig,
    capabilities: BTreeSet<String>,
    endpoint: String,
    auth: Result<AuthType, String>,
    has_credential: bool,
    provider: Arc<dyn ProviderModule>,
    compatibility: Option<Arc<dyn CompatibilityModule>>,
    health: Mutex<HealthState>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("capabilities", &self.capabilities)
            .field("provider", &self.provider.id())
            .field(
                "compatibility",
                &self.compatibility.as_ref().map(|c| c.id().to_string()),
            )
            .field("health", &self.health_snapshot())
            .finish()
    }
}

/// Inputs for constructing a pipeline.
pub struct PipelineParts {
    pub virtual_model_id: String,
    pub target: TargetConfig,
    pub capabilities: BTreeSet<String>,
    pub endpoint: String,
    pub auth: Result<AuthType, String>,
    pub has_credential: bool,
    pub provider: Arc<dyn ProviderModule>,
    pub compatibility: Option<Arc<dyn CompatibilityModule>>,
}

impl Pipeline {
    pub fn new(parts: PipelineParts) -> Self {
        let id = format!(
            "{}:{}#{}",
            parts.virtual_model_id,
            parts.target.key(),
            parts.target.key_index
        );
        Self {
            id,
            target: parts.target,
            capabilities: parts.capabilities,
            endpoint: parts.endpoint,
            auth: parts.auth,
            has_credential: parts.has_credential,
            provider: parts.provider,
            compatibility: parts.compatibility,
            health: Mutex::new(HealthState {
                healthy: true,
                ..Default::default()
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn auth(&self) -> Result<AuthType, &str> {
        self.auth.as_ref().copied().map_err(String::as_str)
    }

    pub fn has_credential(&self) -> bool {
        self.has_credential
    }

    pub fn compatibility_id(&self) -> Option<&str> {
        self.compatibility.as_ref().map(|c| c.id())
    }

    /// Effective weight, never zero so the pipeline stays selectable.
    pub fn weight(&self) -> u32 {
        self.target.weight.max(1)
    }

    fn lock_health(&self) -> std::sync::MutexGuard<'_, HealthState> {
        self.health.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let state = self.lock_health();
        HealthSnapshot {
            healthy: state.healthy,
            consecutive_failures: state.consecutive_failures,
            last_checked: state.last_checked,
            last_failure: state.last_failure,
            last_error: state.last_error.clone(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.lock_health().healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock_health().consecutive_failures
    }

    pub fn mark_unhealthy(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(pipeline = %self.id, %reason, "Marking pipeline unhealthy");
        let mut state = self.lock_health();
        state.healthy = false;
        state.last_checked = Some(Instant::now());
        state.last_error = Some(reason);
    }

    pub fn record_success(&self) {
        let mut state = self.lock_health();
        state.healthy = true;
        state.consecutive_failures = 0;
        state.last_checked = Some(Instant::now());
        state.last_error = None;
    }

    /// Count a failure. The pipeline turns unhealthy once consecutive failures exceed
    /// `failure_threshold`. Returns the new failure count.
    pub fn record_failure(&self, error: &ProviderError, failure_threshold: u32) -> u32 {
        let mut state = self.lock_health();
        let now = Instant::now();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_checked = Some(now);
        state.last_failure = Some(now);
        state.last_error = Some(error.to_string());
        if state.consecutive_failures > failure_threshold && state.healthy {
            debug!(
                pipeline = %self.id,
                failures = state.consecutive_failures,
                "Failure threshold exceeded"
            );
            state.healthy = false;
        }
        state.consecutive_failures
    }

    /// Apply the result of a background health probe.
    ///
    /// A healthy probe restores the pipeline but keeps its failure count, so a flaky target
    /// still scores below a clean one until it serves a request successfully.
    pub fn apply_probe(&self, health: &ProviderHealth) {
        let mut state = self.lock_health();
        state.last_checked = Some(Instant::now());
        match health {
            ProviderHealth::Healthy => {
                state.healthy = true;
            }
            ProviderHealth::Unhealthy(reason) => {
                state.healthy = false;
                state.last_error = Some(reason.clone());
            }
        }
    }

    /// Copy the health state of another pipeline, used when a reload rebuilds an unchanged
    /// target.
    pub fn inherit_health(&self, other: &Pipeline) {
        let source = other.lock_health().clone();
        *self.lock_health() = source;
    }

    /// Run the request through the compatibility module and provider, bounded by `timeout`.
    pub async fn process(
        &self,
        mut request: ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, ProviderError> {
        request.model = self.target.model_id.clone();

        if let Some(compatibility) = &self.compatibility {
            request = compatibility.transform_request(request)?;
        }

        let response = match tokio::time::timeout(timeout, self.provider.process(request)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(ProviderError::Timeout(timeout)),
        };

        match &self.compatibility {
            Some(compatibility) => compatibility.transform_response(response),
            None => Ok(response),
        }
    }

    pub async fn probe(&self) -> ProviderHealth {
        self.provider.health().await
    }
}

/// Pipelines assembled for one virtual model.
#[derive(Debug, Clone)]
pub struct PoolEntrySet {
    pub enabled: bool,
    pub priority: i32,
    pub pipelines: Vec<Arc<Pipeline>>,
}

/// Virtual model id → ordered pipelines.
#[derive(Debug, Clone, Default)]
pub struct PipelinePool {
    entries: BTreeMap<String, PoolEntrySet>,
}

impl PipelinePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, virtual_model_id: impl Into<String>, entry: PoolEntrySet) {
        self.entries.insert(virtual_model_id.into(), entry);
    }

    pub fn get(&self, virtual_model_id: &str) -> Option<&PoolEntrySet> {
        self.entries.get(virtual_model_id)
    }

    pub fn pipelines(&self, virtual_model_id: &str) -> Option<&[Arc<Pipeline>]> {
        self.entries
            .get(virtual_model_id)
            .map(|entry| entry.pipelines.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PoolEntrySet)> {
        self.entries.iter()
    }

    pub fn contains(&self, virtual_model_id: &str) -> bool {
        self.entries.contains_key(virtual_model_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
