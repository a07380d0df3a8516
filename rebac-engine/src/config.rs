use crate::error::{RebacError, Result};
use crate::schema::SchemaLimits;
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration.
///
/// Loaded from an optional YAML/TOML file layered under `REBAC_*`
/// environment variables (`REBAC_MAX_DEPTH=32`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-path recursion budget of a check
    pub max_depth: u32,
    /// Total recursive steps one check may take across all branches
    pub max_descents: u32,
    pub max_concurrent_branches: usize,
    /// How many subject-set and chain hops lookup unrolls
    pub lookup_depth: u32,
    pub check_timeout_ms: Option<u64>,
    /// Logical tuple table referenced by generated lookup queries
    pub tuple_table: String,
    pub max_entities: usize,
    pub max_members_per_entity: usize,
    /// Keep only this many schema versions after each publish
    pub retained_versions: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let limits = SchemaLimits::default();
        Self {
            max_depth: 20,
            max_descents: 10_000,
            max_concurrent_branches: 10,
            lookup_depth: 8,
            check_timeout_ms: None,
            tuple_table: "relation_tuples".to_string(),
            max_entities: limits.max_entities,
            max_members_per_entity: limits.max_members_per_entity,
            retained_versions: None,
        }
    }
}

impl EngineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: Self = builder
            .add_source(Environment::with_prefix("REBAC").try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(RebacError::Config("max_depth must be non-zero".to_string()));
        }
        if self.max_descents == 0 {
            return Err(RebacError::Config("max_descents must be non-zero".to_string()));
        }
        if self.max_concurrent_branches == 0 {
            return Err(RebacError::Config(
                "max_concurrent_branches must be non-zero".to_string(),
            ));
        }
        if self.max_entities == 0 || self.max_members_per_entity == 0 {
            return Err(RebacError::Config("schema limits must be non-zero".to_string()));
        }
        if self.retained_versions == Some(0) {
            return Err(RebacError::Config(
                "retained_versions must keep at least one version".to_string(),
            ));
        }
        let valid_table = !self.tuple_table.is_empty()
            && self
                .tuple_table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid_table {
            return Err(RebacError::Config(format!(
                "tuple_table '{}' is not a plain table name",
                self.tuple_table
            )));
        }
        Ok(())
    }

    pub fn schema_limits(&self) -> SchemaLimits {
        SchemaLimits {
            max_entities: self.max_entities,
            max_members_per_entity: self.max_members_per_entity,
        }
    }

    pub fn check_timeout(&self) -> Option<Duration> {
        self.check_timeout_ms.map(Duration::from_millis)
    }
}
