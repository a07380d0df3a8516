use super::Schema;
use crate::error::{RebacError, Result};
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// A published schema version
#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub schema: Arc<Schema>,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: AHashMap<String, SchemaEntry>,
    /// Publication order, head last
    order: Vec<String>,
}

/// Registry of compiled schema versions.
///
/// Published versions are never mutated. Callers resolve a version once per
/// request and keep the `Arc<Schema>` for the rest of the evaluation, so a
/// concurrent publish never changes the schema an in-flight request sees.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    state: RwLock<RegistryState>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a compiled schema and make it the head. Re-publishing an
    /// existing version keeps its original entry and moves the head to it.
    pub fn publish(&self, schema: Schema) -> SchemaEntry {
        let mut state = self.state.write();
        let version = schema.version.clone();
        state.order.retain(|v| v != &version);
        state.order.push(version.clone());

        if let Some(existing) = state.entries.get(&version) {
            debug!(version = %version, "Schema version already published");
            return existing.clone();
        }

        let entry = SchemaEntry {
            schema: Arc::new(schema),
            published_at: Utc::now(),
        };
        state.entries.insert(version.clone(), entry.clone());
        info!(version = %version, total = state.order.len(), "Published schema version");
        entry
    }

    /// Resolve a version; the empty string resolves to the head.
    pub fn get(&self, version: &str) -> Result<Arc<Schema>> {
        self.entry(version).map(|entry| entry.schema)
    }

    pub fn entry(&self, version: &str) -> Result<SchemaEntry> {
        let state = self.state.read();
        let key = if version.is_empty() {
            state
                .order
                .last()
                .ok_or_else(|| RebacError::NotFound("no schema has been published".to_string()))?
                .as_str()
        } else {
            version
        };
        state
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| RebacError::NotFound(format!("schema version '{key}'")))
    }

    pub fn head(&self) -> Option<Arc<Schema>> {
        let state = self.state.read();
        let version = state.order.last()?;
        state.entries.get(version).map(|entry| entry.schema.clone())
    }

    /// Versions in publication order, oldest first
    pub fn versions(&self) -> Vec<String> {
        self.state.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a version. Requests already holding it are unaffected.
    pub fn evict(&self, version: &str) -> bool {
        let mut state = self.state.write();
        let removed = state.entries.remove(version).is_some();
        if removed {
            state.order.retain(|v| v != version);
            info!(version = %version, "Evicted schema version");
        }
        removed
    }

    /// Keep the `keep` most recently published versions, returning the evicted ones.
    pub fn retain_latest(&self, keep: usize) -> Vec<String> {
        let mut state = self.state.write();
        let excess = state.order.len().saturating_sub(keep.max(1));
        let evicted: Vec<String> = state.order.drain(..excess).collect();
        for version in &evicted {
            state.entries.remove(version);
        }
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), kept = state.order.len(), "Pruned schema versions");
        }
        evicted
    }
}
