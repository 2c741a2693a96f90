//! Per-virtual-model scheduling
//!
//! A `VirtualModelScheduler` owns the live pipeline list of one virtual model. Each routing
//! call walks a small state machine:
//!
//! ```text
//! Idle -> Selecting -> Executing -> Succeeded
//!             ^            |
//!             +-- FailedOver <-+     (bounded by max_attempts and the pipeline count)
//!             |
//!             +-> Exhausted
//! ```
//!
//! Selection scores every qualified pipeline against the request features and hands the
//! candidates to the configured strategy. None of the strategies use randomness, so the same
//! inputs always produce the same sequence of decisions.

use crate::analyzer::RequestFeatures;
use crate::errors::{AttemptFailure, RoutingError};
use crate::models::{ChatRequest, ChatResponse};
use crate::pipeline::Pipeline;
use crate::traits::ProviderHealth;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Multiplier applied per consecutive failure when scoring.
const FAILURE_PENALTY_BASE: f64 = 0.5;

/// Resolution used to turn fractional effective weights into integers for round-robin.
const WEIGHT_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    /// Smooth weighted round-robin over the best-matching candidates.
    #[default]
    Weighted,
    /// Always the highest score.
    Priority,
    /// Equal rotation over the best-matching candidates.
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub strategy: LoadBalancingStrategy,
    /// Upper bound on pipelines tried per request. Also capped by the pipeline count.
    pub max_attempts: usize,
    /// A pipeline is marked unhealthy once its consecutive failures exceed this count.
    /// Zero means the first failure.
    pub failure_threshold: u32,
    /// Per-call provider timeout.
    pub request_timeout_ms: u64,
    /// When false, a request whose inferred capabilities no pipeline satisfies is routed
    /// without the capability filter instead of failing.
    pub strict_capabilities: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::Weighted,
            max_attempts: 3,
            failure_threshold: 3,
            request_timeout_ms: 30_000,
            strict_capabilities: false,
        }
    }
}

impl SchedulerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// States of a single routing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Selecting,
    Executing,
    Succeeded,
    FailedOver,
    Exhausted,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Selecting => "selecting",
            SchedulerState::Executing => "executing",
            SchedulerState::Succeeded => "succeeded",
            SchedulerState::FailedOver => "failed_over",
            SchedulerState::Exhausted => "exhausted",
        };
        write!(f, "{name}")
    }
}

/// A pipeline that passed the capability filter, with its score.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    /// Declaration order within the virtual model.
    pub index: usize,
    pub pipeline: Arc<Pipeline>,
    pub matched_capabilities: usize,
    pub score: f64,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
}

impl ScoredCandidate {
    /// Tie-break order: higher score, higher weight, fewer failures, earlier declaration.
    fn rank(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.pipeline.weight().cmp(&other.pipeline.weight()))
            .then(Reverse(self.consecutive_failures).cmp(&Reverse(other.consecutive_failures)))
            .then(Reverse(self.index).cmp(&Reverse(other.index)))
    }

    /// Weight after the failure penalty, scaled to an integer.
    fn effective_weight(&self) -> i64 {
        let penalty = FAILURE_PENALTY_BASE.powi(self.consecutive_failures.min(64) as i32);
        ((self.pipeline.weight() as f64) * penalty * WEIGHT_SCALE)
            .round()
            .max(1.0) as i64
    }
}

/// The pipeline picked by `select`.
#[derive(Debug, Clone)]
pub struct Selection {
    pub pipeline: Arc<Pipeline>,
    /// True when no healthy pipeline was left and an unhealthy one is used as a last resort.
    pub degraded: bool,
}

/// A successful routing result.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub response: ChatResponse,
    pub virtual_model: String,
    pub pipeline_id: String,
    pub provider_id: String,
    pub model_id: String,
    /// Pipelines tried, including the one that succeeded.
    pub attempts: usize,
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub id: String,
    pub provider_id: String,
    pub model_id: String,
    pub weight: u32,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_checked_secs_ago: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VirtualModelHealth {
    pub virtual_model: String,
    pub healthy_targets: usize,
    pub total_targets: usize,
    pub pipelines: Vec<PipelineStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VirtualModelMetrics {
    pub virtual_model: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub failovers: u64,
    /// Successful requests over completed requests. 1.0 before any request completes.
    pub success_rate: f64,
    /// Mean wall time of completed requests, failovers included.
    pub average_latency_ms: f64,
    pub healthy_targets: usize,
    pub total_targets: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    failovers: AtomicU64,
    latency_micros: AtomicU64,
}

impl Counters {
    fn record_completion(&self, started: Instant, success: bool) {
        let elapsed = started.elapsed().as_micros().min(u64::MAX as u128) as u64;
        self.latency_micros.fetch_add(elapsed, AtomicOrdering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.failed.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }
}

pub struct VirtualModelScheduler {
    virtual_model_id: String,
    priority: i32,
    settings: SchedulerSettings,
    /// Swapped wholesale on reload; in-flight calls keep the list they started with.
    pipelines: RwLock<Arc<[Arc<Pipeline>]>>,
    /// Smooth weighted round-robin state, keyed by pipeline id.
    current_weights: Mutex<HashMap<String, i64>>,
    round_robin_cursor: AtomicUsize,
    counters: Counters,
}

impl fmt::Debug for VirtualModelScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualModelScheduler")
            .field("virtual_model_id", &self.virtual_model_id)
            .field("settings", &self.settings)
            .field("pipelines", &self.snapshot().len())
            .finish()
    }
}

impl VirtualModelScheduler {
    pub fn new(
        virtual_model_id: impl Into<String>,
        pipelines: Vec<Arc<Pipeline>>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            virtual_model_id: virtual_model_id.into(),
            priority: 0,
            settings,
            pipelines: RwLock::new(pipelines.into()),
            current_weights: Mutex::new(HashMap::new()),
            round_robin_cursor: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn virtual_model_id(&self) -> &str {
        &self.virtual_model_id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// The current pipeline list. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<[Arc<Pipeline>]> {
        let guard = self
            .pipelines
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in a new pipeline list. Pipelines whose id already existed keep their health.
    pub fn replace_pipelines(&self, pipelines: Vec<Arc<Pipeline>>) {
        let previous = self.snapshot();
        for pipeline in &pipelines {
            if let Some(old) = previous.iter().find(|old| old.id() == pipeline.id()) {
                pipeline.inherit_health(old);
            }
        }

        let ids: HashSet<&str> = pipelines.iter().map(|p| p.id()).collect();
        self.current_weights
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|id, _| ids.contains(id.as_str()));

        info!(
            virtual_model = %self.virtual_model_id,
            before = previous.len(),
            after = pipelines.len(),
            "Replacing pipelines"
        );
        let mut guard = self
            .pipelines
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = pipelines.into();
    }

    fn enter(&self, from: SchedulerState, to: SchedulerState) -> SchedulerState {
        trace!(virtual_model = %self.virtual_model_id, %from, %to, "Scheduler transition");
        to
    }

    /// Score the pipelines that are not excluded and carry every required capability.
    /// With `enforce_capabilities` false, nothing is disqualified.
    pub fn score(
        &self,
        features: &RequestFeatures,
        pipelines: &[Arc<Pipeline>],
        excluded: &HashSet<String>,
        enforce_capabilities: bool,
    ) -> Vec<ScoredCandidate> {
        pipelines
            .iter()
            .enumerate()
            .filter(|(_, pipeline)| !excluded.contains(pipeline.id()))
            .filter_map(|(index, pipeline)| {
                let capabilities = pipeline.capabilities();
                let matched = features
                    .required_capabilities
                    .iter()
                    .filter(|c| capabilities.contains(*c))
                    .count();
                if enforce_capabilities && matched < features.required_capabilities.len() {
                    return None;
                }

                let health = pipeline.health_snapshot();
                let penalty =
                    FAILURE_PENALTY_BASE.powi(health.consecutive_failures.min(64) as i32);
                let score = (1 + matched) as f64 * pipeline.weight() as f64 * penalty;

                Some(ScoredCandidate {
                    index,
                    pipeline: Arc::clone(pipeline),
                    matched_capabilities: matched,
                    score,
                    healthy: health.healthy,
                    consecutive_failures: health.consecutive_failures,
                    last_failure: health.last_failure,
                })
            })
            .collect()
    }

    /// Pick the next pipeline to try, or `None` when nothing is left.
    pub fn select(
        &self,
        features: &RequestFeatures,
        pipelines: &[Arc<Pipeline>],
        excluded: &HashSet<String>,
    ) -> Option<Selection> {
        let mut candidates = self.score(features, pipelines, excluded, true);
        if candidates.is_empty()
            && !self.settings.strict_capabilities
            && !features.required_capabilities.is_empty()
        {
            debug!(
                virtual_model = %self.virtual_model_id,
                required = ?features.required_capabilities,
                "No pipeline satisfies the inferred capabilities, relaxing"
            );
            candidates = self.score(features, pipelines, excluded, false);
        }

        let (healthy, unhealthy): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|c| c.healthy);

        if !healthy.is_empty() {
            let chosen = match self.settings.strategy {
                LoadBalancingStrategy::Priority => pick_highest(&healthy),
                LoadBalancingStrategy::Weighted => self.pick_weighted(top_tier(&healthy)),
                LoadBalancingStrategy::RoundRobin => self.pick_round_robin(top_tier(&healthy)),
            };
            return chosen.map(|pipeline| Selection {
                pipeline,
                degraded: false,
            });
        }

        // Every remaining pipeline is unhealthy: use the one that failed longest ago. Pipelines
        // that never failed (marked unhealthy by validation or probes) sort first.
        let last_resort = unhealthy
            .iter()
            .min_by(|a, b| a.last_failure.cmp(&b.last_failure).then(a.index.cmp(&b.index)))?;
        warn!(
            virtual_model = %self.virtual_model_id,
            pipeline = %last_resort.pipeline.id(),
            "No healthy pipeline left, using least recently failed"
        );
        Some(Selection {
            pipeline: Arc::clone(&last_resort.pipeline),
            degraded: true,
        })
    }

    fn pick_weighted(&self, candidates: Vec<&ScoredCandidate>) -> Option<Arc<Pipeline>> {
        if candidates.len() <= 1 {
            return candidates.first().map(|c| Arc::clone(&c.pipeline));
        }

        let mut weights = self
            .current_weights
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut total = 0;
        let mut best: Option<(i64, &ScoredCandidate)> = None;
        for candidate in candidates.iter().copied() {
            let effective = candidate.effective_weight();
            total += effective;
            let current = weights
                .entry(candidate.pipeline.id().to_string())
                .or_insert(0);
            *current += effective;
            // Strictly greater keeps the earliest declared candidate on ties
            if best.is_none_or(|(value, _)| *current > value) {
                best = Some((*current, candidate));
            }
        }

        let (_, chosen) = best?;
        if let Some(current) = weights.get_mut(chosen.pipeline.id()) {
            *current -= total;
        }
        Some(Arc::clone(&chosen.pipeline))
    }

    fn pick_round_robin(&self, candidates: Vec<&ScoredCandidate>) -> Option<Arc<Pipeline>> {
        if candidates.is_empty() {
            return None;
        }
        let slot = self.round_robin_cursor.fetch_add(1, AtomicOrdering::Relaxed) % candidates.len();
        Some(Arc::clone(&candidates[slot].pipeline))
    }

    /// Route one request: select, execute, fail over on error until a pipeline succeeds or
    /// the attempt budget is spent.
    #[instrument(skip(self, request, features), fields(virtual_model = %self.virtual_model_id))]
    pub async fn route(
        &self,
        request: ChatRequest,
        features: &RequestFeatures,
    ) -> Result<RoutedResponse, RoutingError> {
        let pipelines = self.snapshot();
        let started = Instant::now();
        let timeout = self.settings.request_timeout();
        let max_attempts = self.settings.max_attempts.max(1).min(pipelines.len());
        self.counters.total.fetch_add(1, AtomicOrdering::Relaxed);

        let mut state = SchedulerState::Idle;
        let mut excluded = HashSet::new();
        let mut attempted: Vec<AttemptFailure> = Vec::new();

        loop {
            state = self.enter(state, SchedulerState::Selecting);
            if attempted.len() >= max_attempts {
                break;
            }
            let Some(selection) = self.select(features, &pipelines, &excluded) else {
                break;
            };
            let pipeline = selection.pipeline;

            state = self.enter(state, SchedulerState::Executing);
            debug!(pipeline = %pipeline.id(), degraded = selection.degraded, "Executing pipeline");

            match pipeline.process(request.clone(), timeout).await {
                Ok(response) => {
                    pipeline.record_success();
                    self.counters.record_completion(started, true);
                    self.enter(state, SchedulerState::Succeeded);

                    let target = pipeline.target();
                    return Ok(RoutedResponse {
                        response,
                        virtual_model: self.virtual_model_id.clone(),
                        pipeline_id: pipeline.id().to_string(),
                        provider_id: target.provider_id.clone(),
                        model_id: target.model_id.clone(),
                        attempts: attempted.len() + 1,
                        degraded: selection.degraded,
                    });
                }
                Err(error) => {
                    let failures = pipeline.record_failure(&error, self.settings.failure_threshold);
                    warn!(
                        pipeline = %pipeline.id(),
                        error = %error,
                        failures,
                        "Pipeline failed, failing over"
                    );
                    self.counters.failovers.fetch_add(1, AtomicOrdering::Relaxed);
                    excluded.insert(pipeline.id().to_string());

                    let target = pipeline.target();
                    attempted.push(AttemptFailure {
                        pipeline_id: pipeline.id().to_string(),
                        provider_id: target.provider_id.clone(),
                        model_id: target.model_id.clone(),
                        error,
                    });
                    state = self.enter(state, SchedulerState::FailedOver);
                }
            }
        }

        self.enter(state, SchedulerState::Exhausted);
        self.counters.record_completion(started, false);
        warn!(
            attempts = attempted.len(),
            pipelines = pipelines.len(),
            "No available target"
        );
        Err(RoutingError::NoAvailableTarget {
            virtual_model: self.virtual_model_id.clone(),
            attempted,
        })
    }

    /// Probe every pipeline's provider concurrently and apply the results. Each probe is
    /// bounded by the request timeout; one that runs out counts as unhealthy.
    pub async fn check_health(&self) {
        let pipelines = self.snapshot();
        let limit = self.settings.request_timeout();
        let probes = pipelines.iter().map(|pipeline| async move {
            let health = match tokio::time::timeout(limit, pipeline.probe()).await {
                Ok(health) => health,
                Err(_) => {
                    debug!(pipeline = %pipeline.id(), ?limit, "Health probe timed out");
                    ProviderHealth::Unhealthy(format!("health probe timed out after {limit:?}"))
                }
            };
            pipeline.apply_probe(&health);
            trace!(pipeline = %pipeline.id(), ?health, "Health probe");
        });
        join_all(probes).await;
    }

    pub fn healthy_count(&self) -> usize {
        self.snapshot().iter().filter(|p| p.is_healthy()).count()
    }

    pub fn health_status(&self) -> VirtualModelHealth {
        let pipelines = self.snapshot();
        let statuses: Vec<PipelineStatus> = pipelines
            .iter()
            .map(|pipeline| {
                let health = pipeline.health_snapshot();
                let target = pipeline.target();
                PipelineStatus {
                    id: pipeline.id().to_string(),
                    provider_id: target.provider_id.clone(),
                    model_id: target.model_id.clone(),
                    weight: pipeline.weight(),
                    healthy: health.healthy,
                    consecutive_failures: health.consecutive_failures,
                    last_error: health.last_error,
                    last_checked_secs_ago: health.last_checked.map(|t| t.elapsed().as_secs()),
                }
            })
            .collect();

        VirtualModelHealth {
            virtual_model: self.virtual_model_id.clone(),
            healthy_targets: statuses.iter().filter(|s| s.healthy).count(),
            total_targets: statuses.len(),
            pipelines: statuses,
        }
    }

    pub fn metrics(&self) -> VirtualModelMetrics {
        let total = self.counters.total.load(AtomicOrdering::Relaxed);
        let succeeded = self.counters.succeeded.load(AtomicOrdering::Relaxed);
        let failed = self.counters.failed.load(AtomicOrdering::Relaxed);
        let completed = succeeded + failed;
        let latency = self.counters.latency_micros.load(AtomicOrdering::Relaxed);

        let (success_rate, average_latency_ms) = if completed == 0 {
            (1.0, 0.0)
        } else {
            (
                succeeded as f64 / completed as f64,
                latency as f64 / completed as f64 / 1000.0,
            )
        };

        let pipelines = self.snapshot();
        VirtualModelMetrics {
            virtual_model: self.virtual_model_id.clone(),
            total_requests: total,
            successful_requests: succeeded,
            failed_requests: failed,
            failovers: self.counters.failovers.load(AtomicOrdering::Relaxed),
            success_rate,
            average_latency_ms,
            healthy_targets: pipelines.iter().filter(|p| p.is_healthy()).count(),
            total_targets: pipelines.len(),
        }
    }
}

fn pick_highest(candidates: &[ScoredCandidate]) -> Option<Arc<Pipeline>> {
    candidates
        .iter()
        .max_by(|a, b| a.rank(b))
        .map(|c| Arc::clone(&c.pipeline))
}

/// Candidates matching the most required capabilities, in declaration order.
fn top_tier(candidates: &[ScoredCandidate]) -> Vec<&ScoredCandidate> {
    let best = candidates
        .iter()
        .map(|c| c.matched_capabilities)
        .max()
        .unwrap_or(0);
    candidates
        .iter()
        .filter(|c| c.matched_capabilities == best)
        .collect()
}
