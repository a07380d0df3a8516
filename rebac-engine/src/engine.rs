use crate::{
    check::PermissionChecker,
    config::EngineConfig,
    error::Result,
    expand::SubjectExpander,
    graph::SchemaGraph,
    lookup::LookupEngine,
    models::*,
    repository::{InMemoryTupleRepository, TupleRepository},
    schema::{Schema, SchemaRegistry},
};
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Core authorization engine
pub struct AuthorizationEngine {
    /// Storage for relationship tuples
    repository: Arc<dyn TupleRepository>,

    /// Published schema versions
    registry: Arc<SchemaRegistry>,

    /// Permission checker for authorization queries
    checker: Arc<PermissionChecker>,

    /// Subject expander for permission trees
    expander: Arc<SubjectExpander>,

    /// Predicate compiler for lookups
    lookup: Arc<LookupEngine>,

    config: EngineConfig,
}

impl AuthorizationEngine {
    /// Create a new authorization engine with the given repository
    pub fn new(repository: Arc<dyn TupleRepository>) -> Self {
        Self::build(repository, EngineConfig::default())
    }

    /// Create an engine from validated configuration
    pub fn from_config(repository: Arc<dyn TupleRepository>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(repository, config))
    }

    /// Engine backed by an in-memory tuple store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryTupleRepository::new()))
    }

    fn build(repository: Arc<dyn TupleRepository>, config: EngineConfig) -> Self {
        let checker = Arc::new(PermissionChecker::new(repository.clone(), &config));
        let expander = Arc::new(SubjectExpander::new(repository.clone(), &config));
        let lookup = Arc::new(LookupEngine::new(&config));

        Self {
            repository,
            registry: Arc::new(SchemaRegistry::new()),
            checker,
            expander,
            lookup,
            config,
        }
    }

    /// Share a schema registry with other engines
    pub fn with_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> Arc<SchemaRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =============================================================================
    // Schema Management
    // =============================================================================

    /// Compile and publish schema text, returning its version.
    #[instrument(skip(self, text), fields(bytes = text.len()))]
    pub fn write_schema(&self, text: &str) -> Result<String> {
        let schema = Schema::compile(text, &self.config.schema_limits()).inspect_err(|e| {
            warn!(error = %e, "Rejected schema");
        })?;
        let entry = self.registry.publish(schema);

        if let Some(keep) = self.config.retained_versions {
            self.registry.retain_latest(keep);
        }
        Ok(entry.schema.version.clone())
    }

    /// Compiled schema for a version; empty selects the latest.
    #[instrument(skip(self))]
    pub fn read_schema(&self, version: &str) -> Result<Arc<Schema>> {
        self.registry.get(version)
    }

    #[instrument(skip(self))]
    pub fn read_schema_graph(&self, version: &str) -> Result<SchemaGraph> {
        let schema = self.registry.get(version)?;
        Ok(SchemaGraph::build(&schema))
    }

    // =============================================================================
    // Tuple Management
    // =============================================================================

    /// Write a relationship tuple after validating it against a schema version.
    #[instrument(skip(self, tuple), fields(tuple = %tuple))]
    pub async fn write_tuple(&self, tuple: Tuple, version: &str) -> Result<()> {
        let schema = self.registry.get(version)?;
        schema.validate_tuple(&tuple)?;

        self.repository.write_tuple(tuple).await?;
        info!(version = %schema.version, "Wrote tuple");
        Ok(())
    }

    /// Delete a relationship tuple. Deleting an absent tuple succeeds.
    #[instrument(skip(self, tuple), fields(tuple = %tuple))]
    pub async fn delete_tuple(&self, tuple: Tuple) -> Result<()> {
        self.repository.delete_tuple(tuple).await?;
        info!("Deleted tuple");
        Ok(())
    }

    /// Apply writes then deletes; writes are validated against the schema version first.
    #[instrument(skip(self, request), fields(writes = request.writes.len(), deletes = request.deletes.len()))]
    pub async fn batch_write(&self, request: WriteRequest, version: &str) -> Result<()> {
        let schema = self.registry.get(version)?;
        for tuple in &request.writes {
            schema.validate_tuple(tuple)?;
        }

        self.repository.batch_write(request).await?;
        info!(version = %schema.version, "Applied batch write");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn read_tuples(&self, filter: &TupleFilter) -> Result<Vec<Tuple>> {
        self.repository.read_tuples(filter).await
    }

    // =============================================================================
    // Core Authorization Operations
    // =============================================================================

    /// Check if a subject holds an action on an entity
    pub async fn check(&self, request: &CheckRequest) -> Result<CheckResponse> {
        self.check_with_cancel(request, CancellationToken::new()).await
    }

    #[instrument(skip(self, request, cancel), fields(entity = %request.entity, action = %request.action, subject = %request.subject))]
    pub async fn check_with_cancel(
        &self,
        request: &CheckRequest,
        cancel: CancellationToken,
    ) -> Result<CheckResponse> {
        let schema = self.registry.get(&request.schema_version)?;
        let response = self.checker.check(schema, request, cancel).await;
        match response {
            Ok(ref response) => debug!(decision = ?response.decision, steps = response.steps, "Checked"),
            Err(ref e) => warn!(error = %e, code = e.error_code(), "Check failed"),
        }
        response
    }

    /// Run checks concurrently; results keep the order of the requests.
    #[instrument(skip(self, requests), fields(count = requests.len()))]
    pub async fn batch_check(&self, requests: &[CheckRequest]) -> Vec<Result<CheckResponse>> {
        join_all(requests.iter().map(|request| self.check(request))).await
    }

    // =============================================================================
    // Permission Expansion
    // =============================================================================

    pub async fn expand(&self, request: &ExpandRequest) -> Result<ExpandTree> {
        self.expand_with_cancel(request, CancellationToken::new()).await
    }

    #[instrument(skip(self, request, cancel), fields(entity = %request.entity, name = %request.name))]
    pub async fn expand_with_cancel(
        &self,
        request: &ExpandRequest,
        cancel: CancellationToken,
    ) -> Result<ExpandTree> {
        let schema = self.registry.get(&request.schema_version)?;
        self.expander.expand(schema, request, cancel).await
    }

    /// Direct subjects reachable from an entity member, sorted and deduplicated
    #[instrument(skip(self, request), fields(entity = %request.entity, name = %request.name))]
    pub async fn list_subjects(&self, request: &ExpandRequest) -> Result<Vec<Subject>> {
        let schema = self.registry.get(&request.schema_version)?;
        self.expander
            .list_subjects(schema, request, CancellationToken::new())
            .await
    }

    // =============================================================================
    // Lookup
    // =============================================================================

    /// Compile the predicate selecting every entity the subject can act on
    pub async fn lookup(&self, request: &LookupRequest) -> Result<LookupResponse> {
        self.lookup_with_cancel(request, CancellationToken::new()).await
    }

    #[instrument(skip(self, request, cancel), fields(entity_type = %request.entity_type, action = %request.action, subject = %request.subject))]
    pub async fn lookup_with_cancel(
        &self,
        request: &LookupRequest,
        cancel: CancellationToken,
    ) -> Result<LookupResponse> {
        let schema = self.registry.get(&request.schema_version)?;
        let response = self.lookup.lookup(&schema, request, &cancel)?;
        debug!(args = response.args.len(), "Compiled lookup");
        Ok(response)
    }
}
