//! Pipeline assembly
//!
//! Turns a configuration table into a `PipelinePool`. Assembly never fails as a whole: every
//! target that cannot be resolved is skipped and reported as an `AssemblyWarning`, so one
//! misconfigured provider cannot take the rest of the gateway down.

use crate::errors::SelectionError;
use crate::module_selector::ModuleSelector;
use crate::pipeline::{Pipeline, PipelineParts, PipelinePool, PoolEntrySet};
use crate::target::{ConfigTable, ModelKey, TargetConfig, VirtualModelConfig, capability};
use crate::traits::ProviderSlot;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Why a target was left out of the pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("model is blacklisted")]
    Blacklisted,

    #[error("provider '{0}' is not configured")]
    UnknownProvider(String),

    #[error("key index {index} out of range ({available} keys configured)")]
    KeyIndexOutOfRange { index: usize, available: usize },

    #[error("duplicate target")]
    DuplicateTarget,

    #[error("duplicate virtual model id")]
    DuplicateVirtualModel,

    #[error(transparent)]
    Selection(#[from] SelectionError),
}

/// A target skipped during assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyWarning {
    pub virtual_model: String,
    /// `provider.model`, or `None` when the whole virtual model was skipped.
    pub target: Option<ModelKey>,
    pub reason: SkipReason,
}

impl fmt::Display for AssemblyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{} -> {}: {}", self.virtual_model, target, self.reason),
            None => write!(f, "{}: {}", self.virtual_model, self.reason),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Assembly {
    pub pool: PipelinePool,
    pub warnings: Vec<AssemblyWarning>,
}

#[derive(Debug, Clone)]
pub struct PipelineAssembler {
    selector: Arc<ModuleSelector>,
}

impl PipelineAssembler {
    pub fn new(selector: Arc<ModuleSelector>) -> Self {
        Self { selector }
    }

    pub fn selector(&self) -> &ModuleSelector {
        &self.selector
    }

    /// Build a pool from the table. Disabled targets are ignored silently; unresolvable ones
    /// are skipped with a warning. Virtual models keep their place in the pool even when none
    /// of their targets resolve.
    #[instrument(skip_all, fields(virtual_models = table.virtual_models.len()))]
    pub fn assemble(&self, table: &ConfigTable) -> Assembly {
        let mut pool = PipelinePool::new();
        let mut warnings = Vec::new();

        for virtual_model in &table.virtual_models {
            if pool.contains(&virtual_model.id) {
                warn!(virtual_model = %virtual_model.id, "Duplicate virtual model id, skipping");
                warnings.push(AssemblyWarning {
                    virtual_model: virtual_model.id.clone(),
                    target: None,
                    reason: SkipReason::DuplicateVirtualModel,
                });
                continue;
            }

            let base_capabilities = virtual_model.effective_capabilities();
            let mut seen = HashSet::new();
            let mut pipelines = Vec::new();

            for target in virtual_model.targets.iter().filter(|t| t.enabled) {
                let result = if seen.insert((target.key(), target.key_index)) {
                    self.build_pipeline(table, virtual_model, &base_capabilities, target)
                } else {
                    Err(SkipReason::DuplicateTarget)
                };

                match result {
                    Ok(pipeline) => {
                        self.validate_pipeline_health(&pipeline);
                        debug!(pipeline = %pipeline.id(), "Assembled pipeline");
                        pipelines.push(Arc::new(pipeline));
                    }
                    Err(reason) => {
                        warn!(
                            virtual_model = %virtual_model.id,
                            target = %target.key(),
                            %reason,
                            "Skipping target"
                        );
                        warnings.push(AssemblyWarning {
                            virtual_model: virtual_model.id.clone(),
                            target: Some(target.key()),
                            reason,
                        });
                    }
                }
            }

            if pipelines.is_empty() && virtual_model.enabled {
                warn!(virtual_model = %virtual_model.id, "Virtual model has no usable targets");
            }

            pool.insert(
                virtual_model.id.clone(),
                PoolEntrySet {
                    enabled: virtual_model.enabled,
                    priority: virtual_model.priority,
                    pipelines,
                },
            );
        }

        info!(
            "Assembled {} virtual models with {} warnings",
            pool.len(),
            warnings.len()
        );
        Assembly { pool, warnings }
    }

    fn build_pipeline(
        &self,
        table: &ConfigTable,
        virtual_model: &VirtualModelConfig,
        base_capabilities: &BTreeSet<String>,
        target: &TargetConfig,
    ) -> Result<Pipeline, SkipReason> {
        if target.provider_id.is_empty() || target.model_id.is_empty() {
            return Err(SelectionError::InvalidTarget {
                provider_id: target.provider_id.clone(),
                model_id: target.model_id.clone(),
                reason: "provider and model ids must not be empty".to_string(),
            }
            .into());
        }

        let key = target.key();
        let model_record = table.provider_model(&key);
        if table.is_blacklisted(&key.to_string()) || model_record.is_some_and(|m| m.blacklisted) {
            return Err(SkipReason::Blacklisted);
        }

        let provider = table
            .providers
            .get(&target.provider_id)
            .ok_or_else(|| SkipReason::UnknownProvider(target.provider_id.clone()))?;

        // A provider without keys still has the implicit slot 0
        let available = provider.api_keys.len();
        if target.key_index >= available.max(1) {
            return Err(SkipReason::KeyIndexOutOfRange {
                index: target.key_index,
                available,
            });
        }

        let factory = self.selector.select_provider(&target.provider_id, provider)?;
        let compatibility = if provider.compatibility.is_empty() {
            None
        } else {
            Some(
                self.selector
                    .select_compatibility_module(&provider.compatibility)?,
            )
        };

        let module = factory.create(ProviderSlot {
            provider_id: &target.provider_id,
            provider,
            target,
        })?;

        let mut capabilities: BTreeSet<String> =
            match model_record.and_then(|m| m.capabilities.as_ref()) {
                Some(configured) => configured.iter().cloned().collect(),
                None => base_capabilities.clone(),
            };
        capabilities.extend(capability::infer_from_model_id(&target.model_id));

        Ok(Pipeline::new(PipelineParts {
            virtual_model_id: virtual_model.id.clone(),
            target: target.clone(),
            capabilities,
            endpoint: provider.endpoint.clone(),
            auth: provider.auth_type(),
            has_credential: provider
                .api_key(target.key_index)
                .is_some_and(|key| !key.is_empty()),
            provider: module,
            compatibility,
        }))
    }

    /// Check a pipeline's static configuration. An invalid pipeline is marked unhealthy but
    /// stays in the pool. Returns whether the pipeline passed.
    pub fn validate_pipeline_health(&self, pipeline: &Pipeline) -> bool {
        let problem = if pipeline.endpoint().is_empty() {
            Some("missing endpoint".to_string())
        } else if let Err(e) = url::Url::parse(pipeline.endpoint()) {
            Some(format!("invalid endpoint '{}': {}", pipeline.endpoint(), e))
        } else {
            match pipeline.auth() {
                Err(reason) => Some(reason.to_string()),
                Ok(auth) if auth.requires_key() && !pipeline.has_credential() => {
                    Some("auth type requires a credential but none is configured".to_string())
                }
                Ok(_) => None,
            }
        };

        match problem {
            Some(reason) => {
                pipeline.mark_unhealthy(reason);
                false
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ModuleKind;
    use crate::target::{BlacklistEntry, ProviderConfig, ProviderModelConfig};
    use crate::test_utils::mock_selector;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn provider(endpoint: &str) -> ProviderConfig {
        ProviderConfig::builder()
            .kind("mock")
            .endpoint(endpoint)
            .api_keys(vec!["sk-1".to_string(), "sk-2".to_string()])
            .build()
    }

    fn target(provider: &str, model: &str) -> TargetConfig {
        TargetConfig::builder()
            .provider_id(provider)
            .model_id(model)
            .build()
    }

    fn table(
        providers: Vec<(&str, ProviderConfig)>,
        virtual_models: Vec<VirtualModelConfig>,
    ) -> ConfigTable {
        ConfigTable::builder()
            .providers(
                providers
                    .into_iter()
                    .map(|(id, p)| (id.to_string(), p))
                    .collect::<BTreeMap<_, _>>(),
            )
            .virtual_models(virtual_models)
            .build()
    }

    #[test]
    fn test_unregistered_provider_is_skipped_with_one_warning() {
        let selector = mock_selector(&["openai"]);
        let assembler = PipelineAssembler::new(Arc::new(selector));
        let unknown = ProviderConfig::builder()
            .kind("carrier-pigeon")
            .endpoint("https://example.com")
            .build();
        let table = table(
            vec![("openai", provider("https://api.openai.com/v1")), ("pigeon", unknown)],
            vec![
                VirtualModelConfig::builder()
                    .id("default")
                    .targets(vec![target("pigeon", "coo"), target("openai", "gpt-4o")])
                    .build(),
            ],
        );

        let assembly = assembler.assemble(&table);

        assert_eq!(assembly.warnings.len(), 1);
        assert_eq!(
            assembly.warnings[0].reason,
            SkipReason::Selection(SelectionError::ModuleNotFound {
                kind: ModuleKind::Provider,
                id: "pigeon".to_string()
            })
        );
        let pipelines = assembly.pool.pipelines("default").unwrap();
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].target().provider_id, "openai");
    }

    #[test]
    fn test_virtual_model_without_resolvable_targets_stays_in_pool() {
        let assembler = PipelineAssembler::new(Arc::new(mock_selector(&[])));
        let table = table(
            vec![("openai", provider("https://api.openai.com/v1"))],
            vec![
                VirtualModelConfig::builder()
                    .id("default")
                    .targets(vec![target("openai", "gpt-4o"), target("missing", "m")])
                    .build(),
            ],
        );

        let assembly = assembler.assemble(&table);

        assert_eq!(assembly.warnings.len(), 2);
        assert!(matches!(
            assembly.warnings[1].reason,
            SkipReason::UnknownProvider(ref id) if id == "missing"
        ));
        assert_eq!(assembly.pool.pipelines("default").map(<[_]>::len), Some(0));
    }

    #[test]
    fn test_disabled_and_blacklisted_targets_are_left_out() {
        let assembler = PipelineAssembler::new(Arc::new(mock_selector(&["mock"])));
        let mut config = table(
            vec![("openai", provider("https://api.openai.com/v1"))],
            vec![
                VirtualModelConfig::builder()
                    .id("default")
                    .targets(vec![
                        TargetConfig::builder()
                            .provider_id("openai")
                            .model_id("gpt-4o")
                            .enabled(false)
                            .build(),
                        target("openai", "gpt-3.5"),
                        target("openai", "gpt-4.1"),
                    ])
                    .build(),
            ],
        );
        config.blacklist.push(BlacklistEntry {
            id: "openai.gpt-3.5".to_string(),
            reason: "deprecated".to_string(),
            blacklisted_at: Utc::now(),
        });

        let assembly = assembler.assemble(&config);

        let pipelines = assembly.pool.pipelines("default").unwrap();
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].target().model_id, "gpt-4.1");
        assert_eq!(assembly.warnings.len(), 1);
        assert_eq!(assembly.warnings[0].reason, SkipReason::Blacklisted);
        assert_eq!(
            assembly.warnings[0].to_string(),
            "default -> openai.gpt-3.5: model is blacklisted"
        );
    }

    #[test]
    fn test_target_with_empty_model_id_is_invalid() {
        let assembler = PipelineAssembler::new(Arc::new(mock_selector(&["mock"])));
        let table = table(
            vec![("openai", provider("https://api.openai.com/v1"))],
            vec![
                VirtualModelConfig::builder()
                    .id("default")
                    .targets(vec![target("openai", ""), target("openai", "gpt-4o")])
                    .build(),
            ],
        );

        let assembly = assembler.assemble(&table);

        assert_eq!(assembly.pool.pipelines("default").unwrap().len(), 1);
        assert_eq!(
            assembly.warnings[0].reason,
            SkipReason::Selection(SelectionError::InvalidTarget {
                provider_id: "openai".to_string(),
                model_id: String::new(),
                reason: "provider and model ids must not be empty".to_string(),
            })
        );
    }

    #[test]
    fn test_key_index_out_of_range() {
        let assembler = PipelineAssembler::new(Arc::new(mock_selector(&["mock"])));
        let table = table(
            vec![("openai", provider("https://api.openai.com/v1"))],
            vec![
                VirtualModelConfig::builder()
                    .id("default")
                    .targets(vec![
                        TargetConfig::builder()
                            .provider_id("openai")
                            .model_id("gpt-4o")
                            .key_index(1)
                            .build(),
                        TargetConfig::builder()
                            .provider_id("openai")
                            .model_id("gpt-4o")
                            .key_index(2)
                            .build(),
                    ])
                    .build(),
            ],
        );

        let assembly = assembler.assemble(&table);

        assert_eq!(assembly.pool.pipelines("default").unwrap().len(), 1);
        assert_eq!(
            assembly.warnings[0].reason,
            SkipReason::KeyIndexOutOfRange {
                index: 2,
                available: 2
            }
        );
    }

    #[test]
    fn test_invalid_configuration_marks_pipeline_unhealthy() {
        let assembler = PipelineAssembler::new(Arc::new(mock_selector(&["mock"])));
        let keyless = ProviderConfig::builder()
            .kind("mock")
            .endpoint("https://api.example.com")
            .auth("bearer")
            .build();
        let table = table(
            vec![("no-endpoint", provider("")), ("keyless", keyless)],
            vec![
                VirtualModelConfig::builder()
                    .id("default")
                    .targets(vec![target("no-endpoint", "m"), target("keyless", "m")])
                    .build(),
            ],
        );

        let assembly = assembler.assemble(&table);

        let pipelines = assembly.pool.pipelines("default").unwrap();
        assert_eq!(pipelines.len(), 2, "invalid pipelines are kept");
        assert!(pipelines.iter().all(|p| !p.is_healthy()));
        assert_eq!(
            pipelines[0].health_snapshot().last_error.as_deref(),
            Some("missing endpoint")
        );
    }

    #[test]
    fn test_capabilities_prefer_model_record_and_add_inferred() {
        let assembler = PipelineAssembler::new(Arc::new(mock_selector(&["mock"])));
        let mut openai = provider("https://api.openai.com/v1");
        openai.models.insert(
            "qwen-coder".to_string(),
            ProviderModelConfig {
                capabilities: Some(vec![capability::TOOLS.to_string()]),
                ..Default::default()
            },
        );
        let table = table(
            vec![("openai", openai)],
            vec![
                VirtualModelConfig::builder()
                    .id("default")
                    .capabilities(vec![capability::VISION.to_string()])
                    .targets(vec![target("openai", "qwen-coder"), target("openai", "plain")])
                    .build(),
            ],
        );

        let assembly = assembler.assemble(&table);
        let pipelines = assembly.pool.pipelines("default").unwrap();

        let first = pipelines[0].capabilities();
        assert!(first.contains(capability::TOOLS));
        assert!(first.contains(capability::CODE_GENERATION));
        assert!(!first.contains(capability::VISION));

        let second = pipelines[1].capabilities();
        assert!(second.contains(capability::VISION));
        assert!(second.contains(capability::CHAT));
    }

    #[test]
    fn test_compatibility_requirements_are_resolved() {
        let assembler = PipelineAssembler::new(Arc::new(mock_selector(&["mock"])));
        let mut strict = provider("https://api.example.com");
        strict.compatibility = vec!["no-system-role".to_string()];
        let mut exotic = provider("https://api.example.com");
        exotic.compatibility = vec!["smoke-signals".to_string()];

        let table = table(
            vec![("strict", strict), ("exotic", exotic)],
            vec![
                VirtualModelConfig::builder()
                    .id("default")
                    .targets(vec![target("strict", "m"), target("exotic", "m")])
                    .build(),
            ],
        );

        let assembly = assembler.assemble(&table);

        let pipelines = assembly.pool.pipelines("default").unwrap();
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].compatibility_id(), Some("system-prompt-inlining"));
        assert!(matches!(
            assembly.warnings[0].reason,
            SkipReason::Selection(SelectionError::ModuleNotFound {
                kind: ModuleKind::Compatibility,
                ..
            })
        ));
    }

    #[test]
    fn test_pipelines_are_not_shared_across_virtual_models() {
        let assembler = PipelineAssembler::new(Arc::new(mock_selector(&["mock"])));
        let table = table(
            vec![("openai", provider("https://api.openai.com/v1"))],
            vec![
                VirtualModelConfig::builder()
                    .id("a")
                    .targets(vec![target("openai", "gpt-4o")])
                    .build(),
                VirtualModelConfig::builder()
                    .id("b")
                    .enabled(false)
                    .targets(vec![target("openai", "gpt-4o")])
                    .build(),
            ],
        );

        let assembly = assembler.assemble(&table);

        let a = &assembly.pool.pipelines("a").unwrap()[0];
        let b = &assembly.pool.pipelines("b").unwrap()[0];
        assert!(!Arc::ptr_eq(a, b));
        assert_ne!(a.id(), b.id());
        assert!(!assembly.pool.get("b").unwrap().enabled);
    }
}
