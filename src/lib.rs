//! Arbiter - A virtual-model routing gateway for LLM providers
//!
//! Callers address *virtual models*. Each virtual model is backed by one or more provider
//! targets; the gateway assembles those into pipelines, scores them against the features of
//! each request, and fails over between them when a provider errors or times out. A
//! coordinator keeps the pool and blacklist of provider models mutually exclusive, and every
//! committed change is re-assembled into the live scheduler set.
//!
//! ```ignore
//! use arbiter::{ConfigTable, Gateway, ModuleSelector};
//!
//! let table = ConfigTable::from_config_file("gateway.json".as_ref()).await?;
//! let mut selector = ModuleSelector::with_builtin_compatibility();
//! arbiter::providers::register_builtin(&mut selector, client);
//!
//! let gateway = Gateway::new(table, selector);
//! let routed = gateway.route_request("default", request).await?;
//! ```

use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

pub mod analyzer;
pub mod assembler;
pub mod client;
pub mod dedup;
pub mod errors;
pub mod manager;
pub mod models;
pub mod module_selector;
pub mod pipeline;
pub mod providers;
pub mod scheduler;
pub mod target;
pub mod traits;

pub use analyzer::{AnalyzerConfig, Complexity, Priority, RequestFeatureAnalyzer, RequestFeatures};
pub use assembler::{Assembly, AssemblyWarning, PipelineAssembler, SkipReason};
pub use dedup::{CoordinatorOutcome, DeduplicationCoordinator};
pub use errors::{
    AttemptFailure, CoordinatorError, ModuleKind, ProviderError, RoutingError, SelectionError,
};
pub use manager::SchedulerManager;
pub use models::{ChatMessage, ChatRequest, ChatResponse, MessageContent};
pub use module_selector::ModuleSelector;
pub use pipeline::{Pipeline, PipelinePool};
pub use scheduler::{
    LoadBalancingStrategy, RoutedResponse, SchedulerSettings, VirtualModelHealth,
    VirtualModelMetrics, VirtualModelScheduler,
};
pub use target::{
    ConfigStream, ConfigTable, ModelKey, ProviderConfig, TargetConfig, VirtualModelConfig,
    WatchedFile,
};

/// The assembled gateway: coordinator, assembler and scheduler manager wired together.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone, Debug)]
pub struct Gateway {
    coordinator: Arc<DeduplicationCoordinator>,
    assembler: Arc<PipelineAssembler>,
    manager: Arc<SchedulerManager>,
    warnings: Arc<RwLock<Vec<AssemblyWarning>>>,
    /// Serializes re-assembly so an older table can never be applied after a newer one.
    assembly_lock: Arc<Mutex<()>>,
}

impl Gateway {
    pub fn new(table: ConfigTable, selector: ModuleSelector) -> Self {
        let coordinator = DeduplicationCoordinator::new(table);
        let snapshot = coordinator.snapshot();
        let assembler = PipelineAssembler::new(Arc::new(selector));

        let assembly = assembler.assemble(&snapshot);
        let manager = SchedulerManager::from_pool(
            &assembly.pool,
            &snapshot.scheduler,
            RequestFeatureAnalyzer::new(snapshot.analyzer.clone()),
        );

        Self {
            coordinator: Arc::new(coordinator),
            assembler: Arc::new(assembler),
            manager: Arc::new(manager),
            warnings: Arc::new(RwLock::new(assembly.warnings)),
            assembly_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn manager(&self) -> &Arc<SchedulerManager> {
        &self.manager
    }

    pub fn coordinator(&self) -> &DeduplicationCoordinator {
        &self.coordinator
    }

    pub fn assembler(&self) -> &PipelineAssembler {
        &self.assembler
    }

    /// The current, coordinator-validated configuration table.
    pub fn table(&self) -> Arc<ConfigTable> {
        self.coordinator.snapshot()
    }

    /// Targets skipped by the most recent assembly.
    pub fn warnings(&self) -> Vec<AssemblyWarning> {
        self.warnings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn route_request(
        &self,
        virtual_model_id: &str,
        request: ChatRequest,
    ) -> Result<RoutedResponse, RoutingError> {
        self.manager.route_request(virtual_model_id, request).await
    }

    pub fn health_status(&self) -> Vec<VirtualModelHealth> {
        self.manager.health_status()
    }

    pub fn metrics(&self) -> Vec<VirtualModelMetrics> {
        self.manager.metrics()
    }

    pub fn add_to_blacklist(
        &self,
        id: &str,
        reason: &str,
    ) -> Result<Arc<ConfigTable>, CoordinatorError> {
        let outcome = self.coordinator.add_to_blacklist(id, reason)?;
        Ok(self.commit(outcome))
    }

    pub fn add_to_pool(
        &self,
        provider_id: &str,
        model_id: &str,
    ) -> Result<Arc<ConfigTable>, CoordinatorError> {
        let outcome = self.coordinator.add_to_pool(provider_id, model_id)?;
        Ok(self.commit(outcome))
    }

    pub fn remove_from_pool(&self, id: &str) -> Result<Arc<ConfigTable>, CoordinatorError> {
        let outcome = self.coordinator.remove_from_pool(id)?;
        Ok(self.commit(outcome))
    }

    pub fn remove_from_blacklist(&self, id: &str) -> Result<Arc<ConfigTable>, CoordinatorError> {
        let outcome = self.coordinator.remove_from_blacklist(id)?;
        Ok(self.commit(outcome))
    }

    /// Replace the configuration table wholesale and re-assemble.
    pub fn reload(&self, table: ConfigTable) -> Arc<ConfigTable> {
        let table = self.coordinator.replace_table(table);
        self.reassemble();
        table
    }

    fn commit(&self, outcome: CoordinatorOutcome) -> Arc<ConfigTable> {
        if outcome.changed {
            self.reassemble();
        }
        outcome.table
    }

    #[instrument(skip(self))]
    fn reassemble(&self) {
        let _guard = self
            .assembly_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let table = self.coordinator.snapshot();
        let assembly = self.assembler.assemble(&table);

        self.manager.set_analyzer_config(table.analyzer.clone());
        self.manager.apply_pool(&assembly.pool, &table.scheduler);

        *self
            .warnings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = assembly.warnings;
    }

    /// Apply every table received from `stream` until it closes. Failed reads are logged and
    /// the previous table stays in effect.
    pub async fn receive_updates<W: ConfigStream + Send + 'static>(
        &self,
        stream: W,
    ) -> Result<JoinHandle<()>, anyhow::Error> {
        let mut rx = stream.receive().await?;
        let gateway = self.clone();

        Ok(tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(table) => {
                        info!("Configuration changed, re-assembling pipelines");
                        gateway.reload(table);
                    }
                    Err(e) => {
                        error!("Failed to reload config: {}", e);
                    }
                }
            }
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{ProviderModelConfig, capability};
    use crate::test_utils::mock_selector;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    fn table() -> ConfigTable {
        let mut models = BTreeMap::new();
        models.insert("gpt-4o".to_string(), ProviderModelConfig::default());
        models.insert("gpt-4.1".to_string(), ProviderModelConfig::default());

        ConfigTable::builder()
            .providers(BTreeMap::from([(
                "openai".to_string(),
                ProviderConfig::builder()
                    .kind("mock")
                    .endpoint("https://api.openai.com/v1")
                    .api_keys(vec!["sk-test".to_string()])
                    .models(models)
                    .build(),
            )]))
            .virtual_models(vec![
                VirtualModelConfig::builder()
                    .id("default")
                    .capabilities(vec![capability::CHAT.to_string()])
                    .targets(vec![
                        TargetConfig::builder()
                            .provider_id("openai")
                            .model_id("gpt-4o")
                            .build(),
                        TargetConfig::builder()
                            .provider_id("openai")
                            .model_id("gpt-4.1")
                            .build(),
                    ])
                    .build(),
            ])
            .build()
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "default".into(),
            messages: vec![ChatMessage::new("user", "Hello")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_blacklisting_removes_target_from_routing() {
        let gateway = Gateway::new(table(), mock_selector(&["mock"]));
        assert_eq!(gateway.health_status()[0].total_targets, 2);

        let table = gateway.add_to_blacklist("openai.gpt-4o", "quota").unwrap();
        assert!(table.is_blacklisted("openai.gpt-4o"));

        let status = gateway.health_status();
        assert_eq!(status[0].total_targets, 1);
        assert_eq!(status[0].pipelines[0].model_id, "gpt-4.1");
        assert_eq!(gateway.warnings().len(), 1);

        for _ in 0..5 {
            let routed = gateway.route_request("default", request()).await.unwrap();
            assert_eq!(routed.model_id, "gpt-4.1");
        }

        gateway.add_to_pool("openai", "gpt-4o").unwrap();
        assert_eq!(gateway.health_status()[0].total_targets, 2);
        assert!(gateway.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_target_without_model_record_can_be_blacklisted() {
        let mut table = table();
        if let Some(provider) = table.providers.get_mut("openai") {
            provider.models.remove("gpt-4o");
        }
        let gateway = Gateway::new(table, mock_selector(&["mock"]));
        assert_eq!(gateway.health_status()[0].total_targets, 2);

        let table = gateway.add_to_blacklist("openai.gpt-4o", "quota").unwrap();
        assert!(table.is_blacklisted("openai.gpt-4o"));

        assert_eq!(gateway.health_status()[0].total_targets, 1);
        for _ in 0..3 {
            let routed = gateway.route_request("default", request()).await.unwrap();
            assert_eq!(routed.model_id, "gpt-4.1");
        }
    }

    #[tokio::test]
    async fn test_rejected_mutation_keeps_routing_state() {
        let gateway = Gateway::new(table(), mock_selector(&["mock"]));
        let before = gateway.table();

        assert!(gateway.add_to_blacklist("azure.gpt-4o", "x").is_err());

        assert!(Arc::ptr_eq(&before, &gateway.table()));
        assert_eq!(gateway.health_status()[0].total_targets, 2);
    }

    struct MockConfigStream {
        tables: Vec<Result<ConfigTable, anyhow::Error>>,
    }

    #[async_trait::async_trait]
    impl ConfigStream for MockConfigStream {
        async fn receive(
            &self,
        ) -> Result<mpsc::Receiver<Result<ConfigTable, anyhow::Error>>, anyhow::Error> {
            let (tx, rx) = mpsc::channel(10);
            let tables: Vec<_> = self
                .tables
                .iter()
                .map(|t| match t {
                    Ok(table) => Ok(table.clone()),
                    Err(e) => Err(anyhow::anyhow!("{}", e)),
                })
                .collect();
            tokio::spawn(async move {
                for table in tables {
                    if tx.send(table).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn test_receive_updates_reassembles_on_change() {
        let gateway = Gateway::new(table(), mock_selector(&["mock"]));

        let mut updated = table();
        updated.virtual_models[0].targets.truncate(1);
        updated.virtual_models.push(
            VirtualModelConfig::builder()
                .id("second")
                .targets(vec![
                    TargetConfig::builder()
                        .provider_id("openai")
                        .model_id("gpt-4.1")
                        .build(),
                ])
                .build(),
        );

        let handle = gateway
            .receive_updates(MockConfigStream {
                tables: vec![Err(anyhow::anyhow!("parse error")), Ok(updated)],
            })
            .await
            .unwrap();
        handle.await.unwrap();

        assert_eq!(gateway.manager().virtual_models(), vec!["default", "second"]);
        assert_eq!(gateway.health_status()[0].total_targets, 1);
        assert!(gateway.route_request("second", request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_reload_keeps_health_of_unchanged_targets() {
        let gateway = Gateway::new(table(), mock_selector(&["mock"]));
        let scheduler = gateway.manager().scheduler("default").unwrap();
        scheduler.snapshot()[0].mark_unhealthy("probe failed");

        gateway.reload(table());

        let status = gateway.health_status();
        assert_eq!(status[0].healthy_targets, 1);
        assert_eq!(
            status[0].pipelines[0].last_error.as_deref(),
            Some("probe failed")
        );
        gateway.manager().check_health().await;
        assert_eq!(gateway.health_status()[0].healthy_targets, 2);
    }
}
