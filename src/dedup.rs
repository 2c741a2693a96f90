//! Pool/blacklist coordination
//!
//! The pool and the blacklist are mutually exclusive: a `provider.model` id is in at most one
//! of them, and the provider's model record (`blacklisted`, `status`, `blacklist_reason`)
//! always agrees with the blacklist. Every mutation runs as clone → mutate → verify → swap
//! under a single writer lock, so a failed mutation leaves the published table untouched and
//! readers only ever see complete snapshots.

use crate::errors::CoordinatorError;
use crate::target::{
    BlacklistEntry, ConfigTable, ModelKey, ModelStatus, PoolEntry, ProviderModelConfig,
};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

const IMPORTED_REASON: &str = "blacklisted in model record";

/// Result of a committed (or no-op) mutation.
#[derive(Debug, Clone)]
pub struct CoordinatorOutcome {
    pub table: Arc<ConfigTable>,
    /// False when the operation was a no-op.
    pub changed: bool,
}

#[derive(Debug)]
pub struct DeduplicationCoordinator {
    table: RwLock<Arc<ConfigTable>>,
    writer: Mutex<()>,
}

impl DeduplicationCoordinator {
    /// Take ownership of a table, normalizing any conflicts it contains.
    pub fn new(table: ConfigTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(normalize(table))),
            writer: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<ConfigTable> {
        let guard = self
            .table
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn is_blacklisted(&self, id: &str) -> bool {
        self.snapshot().is_blacklisted(id)
    }

    pub fn is_pooled(&self, id: &str) -> bool {
        self.snapshot().is_pooled(id)
    }

    /// Replace the whole table, e.g. after the configuration file changed.
    pub fn replace_table(&self, table: ConfigTable) -> Arc<ConfigTable> {
        let _writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let table = Arc::new(normalize(table));
        self.publish(Arc::clone(&table));
        table
    }

    /// Move a model to the blacklist, removing it from the pool.
    #[instrument(skip(self))]
    pub fn add_to_blacklist(
        &self,
        id: &str,
        reason: &str,
    ) -> Result<CoordinatorOutcome, CoordinatorError> {
        let key = parse_id(id)?;
        self.transact(|table| {
            let listed = table.is_blacklisted(id);
            let pooled = table.is_pooled(id);
            let record = model_record(table, &key, id)?;
            if listed && !pooled {
                return Ok(false);
            }

            record.blacklisted = true;
            record.status = ModelStatus::Blacklisted;
            record.blacklist_reason = Some(reason.to_string());

            table.pool.retain(|entry| entry.id != id);
            if !listed {
                table.blacklist.push(BlacklistEntry {
                    id: id.to_string(),
                    reason: reason.to_string(),
                    blacklisted_at: Utc::now(),
                });
            }
            Ok(true)
        })
    }

    /// Move a model to the pool, removing it from the blacklist.
    #[instrument(skip(self))]
    pub fn add_to_pool(
        &self,
        provider_id: &str,
        model_id: &str,
    ) -> Result<CoordinatorOutcome, CoordinatorError> {
        let key = ModelKey::new(provider_id, model_id);
        let id = key.to_string();
        if provider_id.is_empty() || model_id.is_empty() || provider_id.contains('.') {
            return Err(CoordinatorError::InvalidModelId(id));
        }

        self.transact(|table| {
            let pooled = table.is_pooled(&id);
            let listed = table.is_blacklisted(&id);
            let record = model_record(table, &key, &id)?;
            if pooled && !listed {
                return Ok(false);
            }

            record.blacklisted = false;
            record.status = ModelStatus::Active;
            record.blacklist_reason = None;

            table.blacklist.retain(|entry| entry.id != id);
            if !pooled {
                table.pool.push(PoolEntry {
                    id: id.clone(),
                    added_at: Utc::now(),
                });
            }
            Ok(true)
        })
    }

    #[instrument(skip(self))]
    pub fn remove_from_pool(&self, id: &str) -> Result<CoordinatorOutcome, CoordinatorError> {
        parse_id(id)?;
        self.transact(|table| {
            let before = table.pool.len();
            table.pool.retain(|entry| entry.id != id);
            Ok(table.pool.len() != before)
        })
    }

    /// Drop a blacklist entry. The model record returns to `active`.
    #[instrument(skip(self))]
    pub fn remove_from_blacklist(&self, id: &str) -> Result<CoordinatorOutcome, CoordinatorError> {
        let key = parse_id(id)?;
        self.transact(|table| {
            let before = table.blacklist.len();
            table.blacklist.retain(|entry| entry.id != id);
            if table.blacklist.len() == before {
                return Ok(false);
            }
            if let Some(record) = table.provider_model_mut(&key) {
                record.blacklisted = false;
                record.status = ModelStatus::Active;
                record.blacklist_reason = None;
            }
            Ok(true)
        })
    }

    fn transact<F>(&self, mutate: F) -> Result<CoordinatorOutcome, CoordinatorError>
    where
        F: FnOnce(&mut ConfigTable) -> Result<bool, CoordinatorError>,
    {
        let _writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let current = self.snapshot();

        let mut next = ConfigTable::clone(&current);
        if !mutate(&mut next)? {
            debug!("Mutation is a no-op");
            return Ok(CoordinatorOutcome {
                table: current,
                changed: false,
            });
        }

        verify(&next)?;
        let table = Arc::new(next);
        self.publish(Arc::clone(&table));
        info!(
            pool = table.pool.len(),
            blacklist = table.blacklist.len(),
            "Committed pool/blacklist change"
        );
        Ok(CoordinatorOutcome {
            table,
            changed: true,
        })
    }

    fn publish(&self, table: Arc<ConfigTable>) {
        let mut guard = self
            .table
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = table;
    }
}

fn parse_id(id: &str) -> Result<ModelKey, CoordinatorError> {
    id.parse()
        .map_err(|_| CoordinatorError::InvalidModelId(id.to_string()))
}

/// The record for `key`, created with defaults when the provider exists but does not list
/// the model.
fn model_record<'a>(
    table: &'a mut ConfigTable,
    key: &ModelKey,
    id: &str,
) -> Result<&'a mut ProviderModelConfig, CoordinatorError> {
    let provider = table
        .providers
        .get_mut(&key.provider)
        .ok_or_else(|| CoordinatorError::UnknownModel(id.to_string()))?;
    Ok(provider.models.entry(key.model.clone()).or_default())
}

/// Check the pool/blacklist invariant on a candidate table.
pub fn verify(table: &ConfigTable) -> Result<(), CoordinatorError> {
    let mut pooled = HashSet::new();
    for entry in &table.pool {
        if !pooled.insert(entry.id.as_str()) {
            return Err(CoordinatorError::InvariantViolation(entry.id.clone()));
        }
    }

    let mut blacklisted = HashSet::new();
    for entry in &table.blacklist {
        if pooled.contains(entry.id.as_str()) || !blacklisted.insert(entry.id.as_str()) {
            return Err(CoordinatorError::InvariantViolation(entry.id.clone()));
        }
    }

    for (provider_id, provider) in &table.providers {
        for (model_id, record) in &provider.models {
            let id = ModelKey::new(provider_id, model_id).to_string();
            let listed = blacklisted.contains(id.as_str());
            let status_matches = (record.status == ModelStatus::Blacklisted) == listed;
            if record.blacklisted != listed || !status_matches {
                return Err(CoordinatorError::InvariantViolation(id));
            }
        }
    }
    Ok(())
}

/// Resolve conflicts in an externally supplied table. The blacklist wins: an id present in
/// both sets, or flagged in its model record, ends up blacklisted only.
pub fn normalize(mut table: ConfigTable) -> ConfigTable {
    let mut seen = HashSet::new();
    table.blacklist.retain(|entry| seen.insert(entry.id.clone()));

    for (provider_id, provider) in &table.providers {
        for (model_id, record) in &provider.models {
            let id = ModelKey::new(provider_id, model_id).to_string();
            let flagged = record.blacklisted || record.status == ModelStatus::Blacklisted;
            if flagged && !seen.contains(&id) {
                warn!(%id, "Model record is blacklisted without a blacklist entry, adding one");
                table.blacklist.push(BlacklistEntry {
                    reason: record
                        .blacklist_reason
                        .clone()
                        .unwrap_or_else(|| IMPORTED_REASON.to_string()),
                    id: id.clone(),
                    blacklisted_at: Utc::now(),
                });
                seen.insert(id);
            }
        }
    }

    let mut pooled = HashSet::new();
    table.pool.retain(|entry| {
        if seen.contains(&entry.id) {
            warn!(id = %entry.id, "Id is both pooled and blacklisted, keeping blacklist entry");
            return false;
        }
        pooled.insert(entry.id.clone())
    });

    let reasons: Vec<(String, String)> = table
        .blacklist
        .iter()
        .map(|entry| (entry.id.clone(), entry.reason.clone()))
        .collect();
    for (provider_id, provider) in table.providers.iter_mut() {
        for (model_id, record) in provider.models.iter_mut() {
            let id = ModelKey::new(provider_id, model_id).to_string();
            match reasons.iter().find(|(listed, _)| *listed == id) {
                Some((_, reason)) => {
                    record.blacklisted = true;
                    record.status = ModelStatus::Blacklisted;
                    record.blacklist_reason = Some(reason.clone());
                }
                None => {
                    record.blacklisted = false;
                    record.status = ModelStatus::Active;
                    record.blacklist_reason = None;
                }
            }
        }
    }

    table
}
