use crate::{
    config::EngineConfig,
    error::{RebacError, Result},
    models::*,
    repository::TupleRepository,
    schema::{Expression, Member, RelationDefinition, Schema},
};
use dashmap::DashMap;
use futures::{
    future::BoxFuture,
    stream::{FuturesUnordered, StreamExt},
    FutureExt,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Permission checker performs authorization checks with support for:
/// - Direct relations
/// - Subject sets (e.g. "members of group:eng are viewers")
/// - Relation chains (e.g. `parent.view`)
/// - Union, intersection and exclusion over the above
///
/// Every call evaluates against one immutable schema snapshot with its own
/// memoization cache and depth budget.
pub struct PermissionChecker {
    repository: Arc<dyn TupleRepository>,
    max_depth: u32,
    max_descents: u32,
    max_concurrent_branches: usize,
    timeout: Option<Duration>,
}

impl PermissionChecker {
    pub fn new(repository: Arc<dyn TupleRepository>, config: &EngineConfig) -> Self {
        Self {
            repository,
            max_depth: config.max_depth,
            max_descents: config.max_descents,
            max_concurrent_branches: config.max_concurrent_branches.max(1),
            timeout: config.check_timeout(),
        }
    }

    /// Check whether `request.subject` holds `request.action` on `request.entity`.
    pub async fn check(
        &self,
        schema: Arc<Schema>,
        request: &CheckRequest,
        cancel: CancellationToken,
    ) -> Result<CheckResponse> {
        request.entity.validate()?;
        request.subject.validate()?;

        let defined = schema
            .entity(&request.entity.entity_type)
            .is_some_and(|entity| entity.has_member(&request.action));
        if !defined {
            return Err(RebacError::undefined_action(
                &request.entity.entity_type,
                &request.action,
            ));
        }

        let cancel = cancel.child_token();
        let call = CheckCall {
            repository: self.repository.clone(),
            schema,
            subject: request.subject.clone(),
            memo: DashMap::with_hasher(ahash::RandomState::new()),
            descents: AtomicU32::new(self.max_descents),
            steps: AtomicU32::new(0),
            cuts: AtomicU32::new(0),
            max_depth: request.depth.unwrap_or(self.max_depth),
            max_descents: self.max_descents,
            branch_limit: self.max_concurrent_branches,
            cancel: cancel.clone(),
        };

        let evaluation = call.check_member(
            request.entity.clone(),
            request.action.clone(),
            Hop::Root,
            call.max_depth,
            Trail::default(),
        );
        let decision = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, evaluation).await {
                Ok(result) => result,
                Err(_) => {
                    cancel.cancel();
                    warn!(timeout_ms = limit.as_millis() as u64, "Check timed out");
                    Err(RebacError::Canceled)
                }
            },
            None => evaluation.await,
        }?;

        let steps = call.steps.load(Ordering::Relaxed);
        debug!(decision = ?decision, steps, "Check complete");
        Ok(CheckResponse { decision, steps })
    }
}

/// How an evaluation step was reached from its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hop {
    Root,
    /// Through tuple data: a subject set or a relation chain
    Data,
    /// Through a leaf of a permission expression on the same entity
    Reference,
}

/// Persistent list of the (entity, member) pairs on the current evaluation
/// path, shared between sibling branches without copying.
#[derive(Debug, Clone, Default)]
struct Trail(Option<Arc<TrailNode>>);

#[derive(Debug)]
struct TrailNode {
    entity: Entity,
    name: String,
    hop: Hop,
    parent: Trail,
}

impl Trail {
    fn push(&self, entity: Entity, name: String, hop: Hop) -> Self {
        Self(Some(Arc::new(TrailNode {
            entity,
            name,
            hop,
            parent: self.clone(),
        })))
    }

    /// If `(entity, name)` is already on the path, whether the cycle closed
    /// by `hop` passes through tuple data.
    fn reentry(&self, entity: &Entity, name: &str, hop: Hop) -> Option<bool> {
        let mut through_data = hop == Hop::Data;
        let mut cursor = self.0.as_deref();
        while let Some(node) = cursor {
            if node.entity == *entity && node.name == name {
                return Some(through_data);
            }
            through_data |= node.hop == Hop::Data;
            cursor = node.parent.0.as_deref();
        }
        None
    }
}

type MemoKey = (Entity, String);

/// State of one top-level check, shared by every branch of its fan-out.
struct CheckCall {
    repository: Arc<dyn TupleRepository>,
    schema: Arc<Schema>,
    subject: Subject,
    /// Decided results only; dropped with the call
    memo: DashMap<MemoKey, Decision, ahash::RandomState>,
    descents: AtomicU32,
    steps: AtomicU32,
    /// Bumped whenever a same-entity reference cycle is cut
    cuts: AtomicU32,
    max_depth: u32,
    max_descents: u32,
    branch_limit: usize,
    cancel: CancellationToken,
}

impl CheckCall {
    fn step(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RebacError::Canceled);
        }
        self.steps.fetch_add(1, Ordering::Relaxed);
        self.descents
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .map_err(|_| {
                warn!(budget = self.max_descents, "Descent budget exhausted");
                RebacError::DepthExceeded {
                    depth: self.max_descents,
                }
            })?;
        Ok(())
    }

    async fn read(&self, filter: TupleFilter) -> Result<Vec<Tuple>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RebacError::Canceled),
            tuples = self.repository.read_tuples(&filter) => tuples,
        }
    }

    fn check_member(
        &self,
        entity: Entity,
        name: String,
        hop: Hop,
        depth: u32,
        trail: Trail,
    ) -> BoxFuture<'_, Result<Decision>> {
        async move {
            self.step()?;

            match trail.reentry(&entity, &name, hop) {
                Some(true) => {
                    warn!(entity = %entity, name = %name, "Cycle through tuple data");
                    return Err(RebacError::DepthExceeded {
                        depth: self.max_depth,
                    });
                }
                Some(false) => {
                    self.cuts.fetch_add(1, Ordering::Relaxed);
                    return Ok(Decision::Deny);
                }
                None => {}
            }

            let key = (entity, name);
            if let Some(decision) = self.memo.get(&key) {
                return Ok(*decision);
            }
            if depth == 0 {
                warn!(entity = %key.0, name = %key.1, "Depth budget exhausted");
                return Err(RebacError::DepthExceeded {
                    depth: self.max_depth,
                });
            }

            let (entity, name) = &key;
            let member = self
                .schema
                .member(&entity.entity_type, name)
                .ok_or_else(|| RebacError::undefined_action(&entity.entity_type, name))?;
            debug!(entity = %entity, name = %name, depth, "Evaluating member");

            let cuts = self.cuts.load(Ordering::Relaxed);
            let trail = trail.push(entity.clone(), name.clone(), hop);
            let decision = match member {
                Member::Relation(relation) => self.check_relation(entity, relation, depth, &trail).await?,
                Member::Permission(permission) => {
                    self.evaluate(entity, &permission.expression, depth, &trail).await?
                }
            };

            if self.cuts.load(Ordering::Relaxed) == cuts {
                self.memo.insert(key, decision);
            }
            Ok(decision)
        }
        .boxed()
    }

    async fn check_relation(
        &self,
        entity: &Entity,
        relation: &RelationDefinition,
        depth: u32,
        trail: &Trail,
    ) -> Result<Decision> {
        let tuples = self.read(TupleFilter::relation_of(entity, &relation.name)).await?;

        let mut nested = Vec::new();
        for tuple in tuples {
            // Subject types the schema no longer declares are ignored.
            if !relation.allows(&tuple.subject) {
                continue;
            }
            if tuple.subject == self.subject {
                return Ok(Decision::Allow);
            }
            if let Some(ref subject_relation) = tuple.subject.relation {
                nested.push(self.check_member(
                    tuple.subject.entity(),
                    subject_relation.clone(),
                    Hop::Data,
                    depth - 1,
                    trail.clone(),
                ));
            }
        }
        self.first_decisive(nested, Decision::Allow).await
    }

    fn evaluate<'a>(
        &'a self,
        entity: &'a Entity,
        expression: &'a Expression,
        depth: u32,
        trail: &'a Trail,
    ) -> BoxFuture<'a, Result<Decision>> {
        async move {
            match expression {
                Expression::Leaf { name } => {
                    self.check_member(entity.clone(), name.clone(), Hop::Reference, depth - 1, trail.clone())
                        .await
                }
                Expression::Chain { relation, target } => {
                    self.check_chain(entity, relation, target, depth, trail).await
                }
                Expression::Union { children } => {
                    let branches = children
                        .iter()
                        .map(|child| self.evaluate(entity, child, depth, trail))
                        .collect();
                    self.first_decisive(branches, Decision::Allow).await
                }
                Expression::Intersection { children } => {
                    let branches = children
                        .iter()
                        .map(|child| self.evaluate(entity, child, depth, trail))
                        .collect();
                    self.first_decisive(branches, Decision::Deny).await
                }
                Expression::Exclusion { base, excluded } => {
                    if self.evaluate(entity, base, depth, trail).await? == Decision::Deny {
                        return Ok(Decision::Deny);
                    }
                    Ok(self.evaluate(entity, excluded, depth, trail).await?.negate())
                }
            }
        }
        .boxed()
    }

    async fn check_chain(
        &self,
        entity: &Entity,
        relation: &str,
        target: &str,
        depth: u32,
        trail: &Trail,
    ) -> Result<Decision> {
        let Some(definition) = self
            .schema
            .entity(&entity.entity_type)
            .and_then(|e| e.relation(relation))
        else {
            return Ok(Decision::Deny);
        };

        let tuples = self.read(TupleFilter::relation_of(entity, relation)).await?;
        let mut related: Vec<Entity> = tuples
            .into_iter()
            .filter(|t| !t.subject.is_subject_set() && definition.allows(&t.subject))
            .map(|t| t.subject.entity())
            .filter(|e| self.schema.member(&e.entity_type, target).is_some())
            .collect();
        related.sort();
        related.dedup();

        let branches = related
            .into_iter()
            .map(|e| self.check_member(e, target.to_string(), Hop::Data, depth - 1, trail.clone()))
            .collect();
        self.first_decisive(branches, Decision::Allow).await
    }

    /// Run branches concurrently, at most `branch_limit` at a time, and stop at
    /// the first `decisive` answer. Errors other than cancellation only win
    /// when no branch is decisive.
    async fn first_decisive(
        &self,
        branches: Vec<BoxFuture<'_, Result<Decision>>>,
        decisive: Decision,
    ) -> Result<Decision> {
        let mut pending = branches.into_iter();
        let mut running: FuturesUnordered<_> = pending.by_ref().take(self.branch_limit).collect();
        let mut deferred = None;

        while let Some(result) = running.next().await {
            match result {
                Ok(decision) if decision == decisive => return Ok(decision),
                Ok(_) => {}
                Err(RebacError::Canceled) => return Err(RebacError::Canceled),
                Err(err) => {
                    deferred.get_or_insert(err);
                }
            }
            if let Some(next) = pending.next() {
                running.push(next);
            }
        }

        match deferred {
            Some(err) => Err(err),
            None => Ok(decisive.negate()),
        }
    }
}
