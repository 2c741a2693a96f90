//! The configuration table: providers, the virtual models they back, and the pool/blacklist
//! bookkeeping sets. It is read from a JSON file and can be re-read when the file changes.
//!
//! The table is the single record the rest of the gateway derives state from. Administrative
//! mutations go through the `DeduplicationCoordinator`, which hands back updated copies of it
//! for the caller to persist.
use crate::analyzer::AnalyzerConfig;
use crate::scheduler::SchedulerSettings;
use anyhow::anyhow;
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Well-known capability tags.
pub mod capability {
    pub const CHAT: &str = "chat";
    pub const LONG_CONTEXT: &str = "long-context";
    pub const THINKING: &str = "thinking";
    pub const CODE_GENERATION: &str = "code-generation";
    pub const MULTILINGUAL: &str = "multilingual";
    pub const VISION: &str = "vision";
    pub const TOOLS: &str = "tools";

    /// Infer capability tags from a model identifier.
    ///
    /// Every model can chat; the rest is guessed from naming conventions
    /// (`deepseek-r1`, `qwen-coder`, `claude-3-200k`, ...).
    pub fn infer_from_model_id(model_id: &str) -> Vec<String> {
        let id = model_id.to_lowercase();
        let mut capabilities = vec![CHAT.to_string()];

        let has = |needles: &[&str]| needles.iter().any(|n| id.contains(n));

        if has(&["think", "reason", "-r1", "o1", "o3"]) {
            capabilities.push(THINKING.to_string());
        }
        if has(&["code", "coder", "codex", "devstral"]) {
            capabilities.push(CODE_GENERATION.to_string());
        }
        if has(&["long", "128k", "200k", "1m", "32k"]) {
            capabilities.push(LONG_CONTEXT.to_string());
        }
        if has(&["vision", "-vl", "4o"]) {
            capabilities.push(VISION.to_string());
        }
        if has(&["qwen", "glm", "multilingual", "aya"]) {
            capabilities.push(MULTILINGUAL.to_string());
        }
        capabilities
    }
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

/// A concrete provider+model a virtual model can forward to.
///
/// Identity is `(provider_id, model_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct TargetConfig {
    #[builder(into)]
    pub provider_id: String,
    #[builder(into)]
    pub model_id: String,
    /// Which of the provider's credential slots to use.
    #[serde(default)]
    #[builder(default)]
    pub key_index: usize,
    /// Relative share of traffic. Targets without an explicit weight participate equally.
    #[serde(default = "default_weight")]
    #[builder(default = 1)]
    pub weight: u32,
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub enabled: bool,
}

impl TargetConfig {
    pub fn key(&self) -> ModelKey {
        ModelKey::new(&self.provider_id, &self.model_id)
    }
}

/// A user-facing model identifier backed by one or more targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct VirtualModelConfig {
    #[builder(into)]
    pub id: String,
    #[serde(default)]
    #[builder(default, into)]
    pub name: String,
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub enabled: bool,
    /// Capability tags. Inferred from the id when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    #[builder(default)]
    pub targets: Vec<TargetConfig>,
    /// Tie-break weight between virtual models. It only orders listings: higher priority
    /// sorts first in `SchedulerManager::virtual_models`, health and metrics output. It does
    /// not affect target selection.
    #[serde(default)]
    #[builder(default)]
    pub priority: i32,
}

impl VirtualModelConfig {
    /// The configured capabilities, or those inferred from the id.
    pub fn effective_capabilities(&self) -> BTreeSet<String> {
        match &self.capabilities {
            Some(capabilities) => capabilities.iter().cloned().collect(),
            None => capability::infer_from_model_id(&self.id).into_iter().collect(),
        }
    }
}

/// Whether a provider model is usable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    #[default]
    Active,
    Blacklisted,
}

/// The per-model record inside a provider. The status fields are only ever written by the
/// `DeduplicationCoordinator`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub blacklisted: bool,
    #[serde(default)]
    pub status: ModelStatus,
    #[serde(default)]
    pub blacklist_reason: Option<String>,
}

/// How a provider expects credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    None,
    ApiKey,
    Bearer,
}

impl AuthType {
    pub fn requires_key(&self) -> bool {
        !matches!(self, AuthType::None)
    }
}

impl FromStr for AuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(AuthType::None),
            "api-key" | "apikey" | "api_key" => Ok(AuthType::ApiKey),
            "bearer" => Ok(AuthType::Bearer),
            other => Err(format!("unrecognized auth type '{other}'")),
        }
    }
}

/// A provider endpoint with its credential slots and model records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct ProviderConfig {
    /// Module kind, used to select an implementation when no module is registered under the
    /// provider's own id.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub kind: Option<String>,
    #[serde(default)]
    #[builder(default, into)]
    pub endpoint: String,
    /// `none`, `api-key` or `bearer`. Defaults to `bearer` when keys are configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub auth: Option<String>,
    #[serde(default)]
    #[builder(default)]
    pub api_keys: Vec<String>,
    /// Compatibility requirements. A non-empty list means targets on this provider need a
    /// compatibility module covering all of them.
    #[serde(default)]
    #[builder(default)]
    pub compatibility: Vec<String>,
    #[serde(default)]
    #[builder(default)]
    pub models: BTreeMap<String, ProviderModelConfig>,
}

impl ProviderConfig {
    /// The configured auth type. Unrecognized values are returned as an error so that
    /// validation can flag them.
    pub fn auth_type(&self) -> Result<AuthType, String> {
        match &self.auth {
            Some(auth) => auth.parse(),
            None if self.api_keys.is_empty() => Ok(AuthType::None),
            None => Ok(AuthType::Bearer),
        }
    }

    pub fn api_key(&self, key_index: usize) -> Option<&str> {
        self.api_keys.get(key_index).map(String::as_str)
    }
}

/// `provider.model` identifier shared by pool and blacklist entries.
///
/// Provider ids never contain a `.`, model ids may (`gpt-4.1`), so parsing splits at the first
/// dot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModelKey {
    pub provider: String,
    pub model: String,
}

impl ModelKey {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.provider, self.model)
    }
}

impl FromStr for ModelKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                Ok(ModelKey::new(provider, model))
            }
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub id: String,
    pub reason: String,
    pub blacklisted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub id: String,
    pub added_at: DateTime<Utc>,
}

/// The whole configuration record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Builder)]
pub struct ConfigTable {
    #[serde(default)]
    #[builder(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    #[builder(default)]
    pub virtual_models: Vec<VirtualModelConfig>,
    #[serde(default)]
    #[builder(default)]
    pub pool: Vec<PoolEntry>,
    #[serde(default)]
    #[builder(default)]
    pub blacklist: Vec<BlacklistEntry>,
    #[serde(default)]
    #[builder(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    #[builder(default)]
    pub analyzer: AnalyzerConfig,
}

impl ConfigTable {
    pub async fn from_config_file(config_path: &Path) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            anyhow!(
                "Failed to read config file {}: {}",
                config_path.display(),
                e
            )
        })?;

        let table: ConfigTable = serde_json::from_str(&contents).map_err(|e| {
            anyhow!(
                "Failed to parse config file {}: {}",
                config_path.display(),
                e
            )
        })?;

        info!(
            "Loaded {} providers and {} virtual models from {}",
            table.providers.len(),
            table.virtual_models.len(),
            config_path.display()
        );
        Ok(table)
    }

    pub fn provider_model(&self, key: &ModelKey) -> Option<&ProviderModelConfig> {
        self.providers.get(&key.provider)?.models.get(&key.model)
    }

    pub fn provider_model_mut(&mut self, key: &ModelKey) -> Option<&mut ProviderModelConfig> {
        self.providers
            .get_mut(&key.provider)?
            .models
            .get_mut(&key.model)
    }

    pub fn virtual_model(&self, id: &str) -> Option<&VirtualModelConfig> {
        self.virtual_models.iter().find(|vm| vm.id == id)
    }

    pub fn is_blacklisted(&self, id: &str) -> bool {
        self.blacklist.iter().any(|entry| entry.id == id)
    }

    pub fn is_pooled(&self, id: &str) -> bool {
        self.pool.iter().any(|entry| entry.id == id)
    }
}

/// A source of configuration table updates, used for hot-reload.
#[async_trait]
pub trait ConfigStream {
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<ConfigTable, anyhow::Error>>, anyhow::Error>;
}

pub struct WatchedFile(pub PathBuf);

#[async_trait]
impl ConfigStream for WatchedFile {
    /// Watches a file for changes and returns a stream of re-read tables.
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<ConfigTable, anyhow::Error>>, anyhow::Error> {
        let (table_tx, table_rx) = mpsc::channel(100);
        let (file_tx, mut file_rx) = mpsc::channel(100);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = file_tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )?;

        watcher.watch(&self.0, RecursiveMode::NonRecursive)?;

        let config_path = self.0.clone();
        tokio::spawn(async move {
            // The watcher stops emitting events once dropped
            let _watcher = watcher;
            while let Some(res) = file_rx.recv().await {
                match res {
                    Ok(event) => {
                        if !event.kind.is_modify() {
                            continue;
                        }
                        debug!("Config file changed, re-reading {}", config_path.display());
                        let result = ConfigTable::from_config_file(&config_path).await;
                        if let Err(e) = &result {
                            error!("Failed to reload config: {}", e);
                        }
                        if table_tx.send(result).await.is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Err(e) => {
                        error!("Watch error: {}", e);
                        if table_tx
                            .send(Err(anyhow!("Watch error: {}", e)))
                            .await
                            .is_err()
                        {
                            break; // Receiver dropped
                        }
                    }
                }
            }
        });

        Ok(table_rx)
    }
}
