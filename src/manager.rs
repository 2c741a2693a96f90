//! Routing entry point
//!
//! Holds one `VirtualModelScheduler` per enabled virtual model in the pool. Schedulers live in
//! a `DashMap` so reloads can swap individual entries while requests keep flowing.

use crate::analyzer::{AnalyzerConfig, RequestFeatureAnalyzer};
use crate::errors::RoutingError;
use crate::models::ChatRequest;
use crate::pipeline::PipelinePool;
use crate::scheduler::{
    RoutedResponse, SchedulerSettings, VirtualModelHealth, VirtualModelMetrics,
    VirtualModelScheduler,
};
use dashmap::DashMap;
use futures_util::future::join_all;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace};

#[derive(Debug)]
pub struct SchedulerManager {
    schedulers: DashMap<String, Arc<VirtualModelScheduler>>,
    analyzer: RwLock<Arc<RequestFeatureAnalyzer>>,
}

impl SchedulerManager {
    pub fn from_pool(
        pool: &PipelinePool,
        settings: &SchedulerSettings,
        analyzer: RequestFeatureAnalyzer,
    ) -> Self {
        let manager = Self {
            schedulers: DashMap::new(),
            analyzer: RwLock::new(Arc::new(analyzer)),
        };
        manager.apply_pool(pool, settings);
        manager
    }

    pub fn analyzer(&self) -> Arc<RequestFeatureAnalyzer> {
        let guard = self
            .analyzer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn set_analyzer_config(&self, config: AnalyzerConfig) {
        if self.analyzer().config() == &config {
            return;
        }
        let mut guard = self
            .analyzer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(RequestFeatureAnalyzer::new(config));
    }

    pub fn scheduler(&self, virtual_model_id: &str) -> Option<Arc<VirtualModelScheduler>> {
        self.schedulers
            .get(virtual_model_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Ids of routable virtual models, highest priority first.
    pub fn virtual_models(&self) -> Vec<String> {
        self.ordered()
            .into_iter()
            .map(|s| s.virtual_model_id().to_string())
            .collect()
    }

    fn ordered(&self) -> Vec<Arc<VirtualModelScheduler>> {
        let mut schedulers: Vec<_> = self
            .schedulers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        schedulers.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.virtual_model_id().cmp(b.virtual_model_id()))
        });
        schedulers
    }

    /// Bring the scheduler set in line with a freshly assembled pool.
    ///
    /// New and changed entries are written before stale ones are removed, so a virtual model
    /// that survives the reload is routable throughout. Pipelines that kept their id keep
    /// their health.
    pub fn apply_pool(&self, pool: &PipelinePool, settings: &SchedulerSettings) {
        for (id, entry) in pool.iter().filter(|(_, entry)| entry.enabled) {
            let existing = self.scheduler(id);
            match existing {
                Some(scheduler)
                    if scheduler.settings() == settings
                        && scheduler.priority() == entry.priority =>
                {
                    scheduler.replace_pipelines(entry.pipelines.clone());
                }
                previous => {
                    let scheduler =
                        VirtualModelScheduler::new(id.clone(), Vec::new(), settings.clone())
                            .with_priority(entry.priority);
                    if let Some(previous) = previous {
                        scheduler.replace_pipelines(previous.snapshot().to_vec());
                    }
                    scheduler.replace_pipelines(entry.pipelines.clone());
                    debug!(virtual_model = %id, "Installing scheduler");
                    self.schedulers.insert(id.clone(), Arc::new(scheduler));
                }
            }
        }

        self.schedulers.retain(|id, _| {
            let keep = pool.get(id).is_some_and(|entry| entry.enabled);
            if !keep {
                info!(virtual_model = %id, "Removing scheduler");
            }
            keep
        });
    }

    /// Analyze the request and route it through the virtual model's scheduler.
    #[instrument(skip(self, request))]
    pub async fn route_request(
        &self,
        virtual_model_id: &str,
        request: ChatRequest,
    ) -> Result<RoutedResponse, RoutingError> {
        let scheduler = self
            .scheduler(virtual_model_id)
            .ok_or_else(|| RoutingError::VirtualModelNotFound(virtual_model_id.to_string()))?;

        let features = self.analyzer().analyze(&request);
        debug!(?features, "Analyzed request");
        scheduler.route(request, &features).await
    }

    pub fn health_status(&self) -> Vec<VirtualModelHealth> {
        self.ordered().iter().map(|s| s.health_status()).collect()
    }

    pub fn metrics(&self) -> Vec<VirtualModelMetrics> {
        self.ordered().iter().map(|s| s.metrics()).collect()
    }

    pub async fn check_health(&self) {
        let schedulers = self.ordered();
        join_all(schedulers.iter().map(|s| s.check_health())).await;
    }

    /// Probe all providers every `interval`. The task ends once the manager is dropped.
    pub fn spawn_health_checks(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                trace!("Running background health checks");
                manager.check_health().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatMessage;
    use crate::pipeline::PoolEntrySet;
    use crate::test_utils::{MockProvider, mock_pipeline};

    fn pool(entries: Vec<(&str, bool, Vec<(&str, MockProvider)>)>) -> PipelinePool {
        let mut pool = PipelinePool::new();
        for (id, enabled, targets) in entries {
            pool.insert(
                id,
                PoolEntrySet {
                    enabled,
                    priority: 0,
                    pipelines: targets
                        .into_iter()
                        .map(|(provider, mock)| mock_pipeline(id, provider, "m", 1, mock))
                        .collect(),
                },
            );
        }
        pool
    }

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            model: "default".into(),
            messages: vec![ChatMessage::new("user", text)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_route_request_to_known_virtual_model() {
        let manager = SchedulerManager::from_pool(
            &pool(vec![("default", true, vec![("a", MockProvider::ok("a"))])]),
            &SchedulerSettings::default(),
            RequestFeatureAnalyzer::default(),
        );

        let routed = manager.route_request("default", request("hi")).await.unwrap();
        assert_eq!(routed.virtual_model, "default");
        assert_eq!(routed.response.model, "m");
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_virtual_models_are_not_found() {
        let manager = SchedulerManager::from_pool(
            &pool(vec![("off", false, vec![("a", MockProvider::ok("a"))])]),
            &SchedulerSettings::default(),
            RequestFeatureAnalyzer::default(),
        );

        for id in ["missing", "off"] {
            let err = manager.route_request(id, request("hi")).await.unwrap_err();
            assert!(matches!(err, RoutingError::VirtualModelNotFound(ref v) if v == id));
        }
    }

    #[test]
    fn test_virtual_models_are_listed_by_priority_then_id() {
        let mut pool = pool(vec![
            ("b", true, vec![("p", MockProvider::ok("p"))]),
            ("c", true, vec![("p", MockProvider::ok("p"))]),
        ]);
        pool.insert(
            "a",
            PoolEntrySet {
                enabled: true,
                priority: 5,
                pipelines: vec![mock_pipeline("a", "p", "m", 1, MockProvider::ok("p"))],
            },
        );

        let manager = SchedulerManager::from_pool(
            &pool,
            &SchedulerSettings::default(),
            RequestFeatureAnalyzer::default(),
        );

        assert_eq!(manager.virtual_models(), vec!["a", "b", "c"]);
        let health: Vec<_> = manager
            .health_status()
            .into_iter()
            .map(|h| h.virtual_model)
            .collect();
        assert_eq!(health, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_apply_pool_swaps_without_losing_health() {
        let settings = SchedulerSettings::default();
        let manager = SchedulerManager::from_pool(
            &pool(vec![
                ("keep", true, vec![("a", MockProvider::ok("a"))]),
                ("drop", true, vec![("b", MockProvider::ok("b"))]),
            ]),
            &settings,
            RequestFeatureAnalyzer::default(),
        );
        let kept = manager.scheduler("keep").unwrap();
        kept.snapshot()[0].mark_unhealthy("probe failed");

        manager.apply_pool(
            &pool(vec![
                ("keep", true, vec![("a", MockProvider::ok("a")), ("c", MockProvider::ok("c"))]),
                ("new", true, vec![("d", MockProvider::ok("d"))]),
            ]),
            &settings,
        );

        assert_eq!(manager.virtual_models(), vec!["keep", "new"]);
        let keep = manager.scheduler("keep").unwrap();
        assert!(Arc::ptr_eq(&kept, &keep), "unchanged settings reuse the scheduler");
        let status = keep.health_status();
        assert_eq!(status.total_targets, 2);
        assert_eq!(status.healthy_targets, 1);
    }

    #[tokio::test]
    async fn test_apply_pool_with_new_settings_rebuilds_scheduler() {
        let manager = SchedulerManager::from_pool(
            &pool(vec![("default", true, vec![("a", MockProvider::ok("a"))])]),
            &SchedulerSettings::default(),
            RequestFeatureAnalyzer::default(),
        );
        let before = manager.scheduler("default").unwrap();
        before.snapshot()[0].mark_unhealthy("down");

        let settings = SchedulerSettings {
            max_attempts: 1,
            ..Default::default()
        };
        manager.apply_pool(
            &pool(vec![("default", true, vec![("a", MockProvider::ok("a"))])]),
            &settings,
        );

        let after = manager.scheduler("default").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.settings().max_attempts, 1);
        assert_eq!(after.healthy_count(), 0);
    }

    #[tokio::test]
    async fn test_health_and_metrics_are_aggregated() {
        let manager = SchedulerManager::from_pool(
            &pool(vec![
                ("a", true, vec![("p", MockProvider::ok("p"))]),
                ("b", true, vec![("q", MockProvider::failing("q"))]),
            ]),
            &SchedulerSettings::default(),
            RequestFeatureAnalyzer::default(),
        );

        manager.route_request("a", request("hi")).await.unwrap();
        manager.route_request("b", request("hi")).await.unwrap_err();

        let metrics = manager.metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].virtual_model, "a");
        assert!((metrics[0].success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(metrics[1].successful_requests, 0);
        assert!(metrics[1].success_rate.abs() < f64::EPSILON);

        let health = manager.health_status();
        assert_eq!(health[0].healthy_targets, 1);
        assert_eq!(health[1].pipelines[0].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_background_health_checks_update_pipelines() {
        let provider = MockProvider::ok("a");
        let manager = Arc::new(SchedulerManager::from_pool(
            &pool(vec![("default", true, vec![("a", provider.clone())])]),
            &SchedulerSettings::default(),
            RequestFeatureAnalyzer::default(),
        ));
        provider.set_health(false);

        let handle = manager.spawn_health_checks(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.scheduler("default").unwrap().healthy_count(), 0);
        handle.abort();
    }
}
