//! Rule store: the scheduler's only source of rules.
//!
//! The daemon reads rules through the async [`RuleStore`] trait once per
//! cycle. Two backends ship with the crate:
//! - [`JsonRuleStore`] re-reads a JSON file on every call, so edits take
//!   effect on the next cycle
//! - [`MemoryRuleStore`] keeps rules in memory and enforces the
//!   one-rule-per-route constraint on insert

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::rules::model::{Rule, RuleRecord};

/// Source of routing rules.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Every rule, in insertion order.
    async fn get_all_rules(&self) -> Result<Vec<Rule>, StoreError>;
}

/// Drop rules that repeat an earlier `(user, source, target)` route.
fn dedup_routes(rules: Vec<Rule>) -> Vec<Rule> {
    let mut kept: Vec<Rule> = Vec::with_capacity(rules.len());
    for rule in rules {
        if kept.iter().any(|k| k.same_route(&rule)) {
            tracing::warn!(
                user = %rule.user,
                source = %rule.source_folder,
                target = %rule.target_folder,
                "Ignoring duplicate rule"
            );
            continue;
        }
        kept.push(rule);
    }
    kept
}

// ── JSON file ───────────────────────────────────────────────────────

/// Rules stored as a JSON array of [`RuleRecord`]s.
#[derive(Debug, Clone)]
pub struct JsonRuleStore {
    path: PathBuf,
}

impl JsonRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RuleStore for JsonRuleStore {
    async fn get_all_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "Rules file not found");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.display().to_string(),
                    source,
                });
            }
        };

        let records: Vec<RuleRecord> =
            serde_json::from_slice(&raw).map_err(|source| StoreError::Parse {
                path: self.path.display().to_string(),
                source,
            })?;

        Ok(dedup_routes(records.into_iter().map(Rule::from).collect()))
    }
}

// ── In memory ───────────────────────────────────────────────────────

/// In-memory rule store.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: RwLock<Vec<Rule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule. Fails if the user already routes the same folders.
    pub async fn add_rule(&self, rule: Rule) -> Result<Uuid, StoreError> {
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.same_route(&rule)) {
            return Err(StoreError::Duplicate {
                user: rule.user,
                source_folder: rule.source_folder,
                target_folder: rule.target_folder,
            });
        }
        let id = rule.id;
        rules.push(rule);
        Ok(id)
    }

    /// Replace the rule with the given id, keeping its position.
    pub async fn update_rule(&self, id: Uuid, mut rule: Rule) -> Result<(), StoreError> {
        let mut rules = self.rules.write().await;
        if rules.iter().any(|r| r.id != id && r.same_route(&rule)) {
            return Err(StoreError::Duplicate {
                user: rule.user,
                source_folder: rule.source_folder,
                target_folder: rule.target_folder,
            });
        }
        let slot = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        rule.id = id;
        *slot = rule;
        Ok(())
    }

    pub async fn delete_rule(&self, id: Uuid) -> Result<(), StoreError> {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.id != id);
        if rules.len() == before {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn get_all_rules(&self) -> Result<Vec<Rule>, StoreError> {
        Ok(self.rules.read().await.clone())
    }
}
