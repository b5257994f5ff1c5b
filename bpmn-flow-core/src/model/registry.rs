use super::validate::{error_summary, validate_definition, Severity};
use super::yaml::parse_definition_yaml;
use super::ProcessDefinition;
use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Source of deployed process definitions, consulted by call activities and
/// when a new process instance is created.
pub trait DefinitionProvider: Send + Sync {
    /// Highest deployed version for `key`, or `None` when nothing is deployed.
    fn resolve_latest(&self, key: &str) -> Result<Option<Arc<ProcessDefinition>>>;
}

/// One deployed version of a definition.
#[derive(Debug, Clone)]
pub struct DeployedDefinition {
    pub process_key: String,
    pub version: u32,
    pub content_hash: [u8; 32],
    pub definition: Arc<ProcessDefinition>,
}

/// SHA-256 over the canonical JSON form of a definition.
pub fn compute_hash(def: &ProcessDefinition) -> Result<[u8; 32]> {
    let bytes = serde_json::to_vec(def).context("Failed to serialise definition")?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().into())
}

// ── MemoryDefinitionCache ──

/// In-memory definition cache.
///
/// Versions start at 1 and grow per key. Redeploying content identical to the
/// latest version returns that version instead of creating a new one.
pub struct MemoryDefinitionCache {
    inner: RwLock<HashMap<String, Vec<DeployedDefinition>>>,
}

impl MemoryDefinitionCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and deploy. Validation errors reject the deployment;
    /// warnings are logged.
    pub fn deploy(&self, def: ProcessDefinition) -> Result<DeployedDefinition> {
        let issues = validate_definition(&def);
        if let Some(summary) = error_summary(&issues) {
            return Err(anyhow!(
                "Definition '{}' failed validation:\n{}",
                def.key,
                summary
            ));
        }
        for issue in issues.iter().filter(|i| i.severity == Severity::Warning) {
            tracing::warn!(process_key = %def.key, rule = %issue.rule, "{}", issue.message);
        }

        let content_hash = compute_hash(&def)?;
        let mut store = self.inner.write().map_err(|e| anyhow!("Lock: {}", e))?;
        let versions = store.entry(def.key.clone()).or_default();

        if let Some(latest) = versions.last() {
            if latest.content_hash == content_hash {
                tracing::debug!(
                    process_key = %def.key,
                    version = latest.version,
                    "Identical redeploy"
                );
                return Ok(latest.clone());
            }
        }

        let deployed = DeployedDefinition {
            process_key: def.key.clone(),
            version: versions.last().map(|d| d.version + 1).unwrap_or(1),
            content_hash,
            definition: Arc::new(def),
        };
        tracing::info!(
            process_key = %deployed.process_key,
            version = deployed.version,
            "Definition deployed"
        );
        versions.push(deployed.clone());
        Ok(deployed)
    }

    pub fn deploy_yaml(&self, yaml: &str) -> Result<DeployedDefinition> {
        self.deploy(parse_definition_yaml(yaml)?)
    }

    pub fn get(&self, key: &str, version: u32) -> Result<Option<DeployedDefinition>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store
            .get(key)
            .and_then(|v| v.iter().find(|d| d.version == version))
            .cloned())
    }

    /// Deployed version numbers for `key`, ascending.
    pub fn versions(&self, key: &str) -> Result<Vec<u32>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(store
            .get(key)
            .map(|v| v.iter().map(|d| d.version).collect())
            .unwrap_or_default())
    }
}

impl Default for MemoryDefinitionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionProvider for MemoryDefinitionCache {
    fn resolve_latest(&self, key: &str) -> Result<Option<Arc<ProcessDefinition>>> {
        let store = self.inner.read().map_err(|e| anyhow!("Lock: {}", e))?;
        let latest = store
            .get(key)
            .and_then(|v| v.iter().max_by_key(|d| d.version))
            .map(|d| Arc::clone(&d.definition));
        Ok(latest)
    }
}
