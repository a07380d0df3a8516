use crate::{
    config::EngineConfig,
    error::{RebacError, Result},
    models::*,
    repository::TupleRepository,
    schema::{Expression, Member, RelationDefinition, Schema},
};
use futures::{future::BoxFuture, FutureExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Subject expander builds the permission tree rooted at an entity member,
/// listing the subjects stored on every relation it reaches.
///
/// Expansion is diagnostic: cycles and an exhausted depth budget become
/// marker leaves instead of errors.
pub struct SubjectExpander {
    repository: Arc<dyn TupleRepository>,
    max_depth: u32,
}

impl SubjectExpander {
    pub fn new(repository: Arc<dyn TupleRepository>, config: &EngineConfig) -> Self {
        Self {
            repository,
            max_depth: config.max_depth,
        }
    }

    pub async fn expand(
        &self,
        schema: Arc<Schema>,
        request: &ExpandRequest,
        cancel: CancellationToken,
    ) -> Result<ExpandTree> {
        request.entity.validate()?;
        if schema.member(&request.entity.entity_type, &request.name).is_none() {
            return Err(RebacError::undefined_action(
                &request.entity.entity_type,
                &request.name,
            ));
        }

        let call = ExpandCall {
            repository: self.repository.clone(),
            schema,
            cancel,
        };
        let mut path = Vec::new();
        call.expand_member(
            request.entity.clone(),
            request.name.clone(),
            request.depth.unwrap_or(self.max_depth),
            &mut path,
        )
        .await
    }

    /// All direct subjects reachable from the member, deduplicated and sorted.
    pub async fn list_subjects(
        &self,
        schema: Arc<Schema>,
        request: &ExpandRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<Subject>> {
        let tree = self.expand(schema, request, cancel).await?;
        let mut subjects = tree.leaf_subjects();
        subjects.sort();
        subjects.dedup();
        Ok(subjects)
    }
}

struct ExpandCall {
    repository: Arc<dyn TupleRepository>,
    schema: Arc<Schema>,
    cancel: CancellationToken,
}

impl ExpandCall {
    async fn read(&self, filter: TupleFilter) -> Result<Vec<Tuple>> {
        let mut tuples = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(RebacError::Canceled),
            tuples = self.repository.read_tuples(&filter) => tuples?,
        };
        tuples.sort();
        Ok(tuples)
    }

    fn expand_member<'a>(
        &'a self,
        entity: Entity,
        name: String,
        depth: u32,
        path: &'a mut Vec<(Entity, String)>,
    ) -> BoxFuture<'a, Result<ExpandTree>> {
        async move {
            if self.cancel.is_cancelled() {
                return Err(RebacError::Canceled);
            }
            if path.iter().any(|(e, n)| *e == entity && *n == name) {
                return Ok(ExpandTree::Cycle { entity, name });
            }
            if depth == 0 {
                return Ok(ExpandTree::DepthLimit { entity, name });
            }

            let member = self
                .schema
                .member(&entity.entity_type, &name)
                .ok_or_else(|| RebacError::undefined_action(&entity.entity_type, &name))?;
            debug!(entity = %entity, name = %name, depth, "Expanding member");

            path.push((entity.clone(), name.clone()));
            let tree = match member {
                Member::Relation(relation) => self.expand_relation(entity, relation, depth, &mut *path).await,
                Member::Permission(permission) => {
                    let child = self
                        .expand_expression(&entity, &permission.expression, depth, &mut *path)
                        .await;
                    child.map(|child| ExpandTree::Permission {
                        entity,
                        permission: name,
                        child: Box::new(child),
                    })
                }
            };
            path.pop();
            tree
        }
        .boxed()
    }

    async fn expand_relation(
        &self,
        entity: Entity,
        relation: &RelationDefinition,
        depth: u32,
        path: &mut Vec<(Entity, String)>,
    ) -> Result<ExpandTree> {
        let tuples = self.read(TupleFilter::relation_of(&entity, &relation.name)).await?;

        let mut subjects = Vec::new();
        let mut children = Vec::new();
        for tuple in tuples.into_iter().filter(|t| relation.allows(&t.subject)) {
            match tuple.subject.relation {
                Some(ref subject_relation) => {
                    let child = self
                        .expand_member(tuple.subject.entity(), subject_relation.clone(), depth - 1, &mut *path)
                        .await?;
                    children.push(child);
                }
                None => subjects.push(tuple.subject),
            }
        }

        Ok(ExpandTree::Relation {
            entity,
            relation: relation.name.clone(),
            subjects,
            children,
        })
    }

    fn expand_expression<'a>(
        &'a self,
        entity: &'a Entity,
        expression: &'a Expression,
        depth: u32,
        path: &'a mut Vec<(Entity, String)>,
    ) -> BoxFuture<'a, Result<ExpandTree>> {
        async move {
            match expression {
                Expression::Leaf { name } => {
                    self.expand_member(entity.clone(), name.clone(), depth - 1, path).await
                }
                Expression::Chain { relation, target } => {
                    let tuples = self.read(TupleFilter::relation_of(entity, relation)).await?;
                    let allowed = self
                        .schema
                        .entity(&entity.entity_type)
                        .and_then(|e| e.relation(relation));
                    let mut related: Vec<Entity> = tuples
                        .into_iter()
                        .filter(|t| !t.subject.is_subject_set())
                        .filter(|t| allowed.is_some_and(|r| r.allows(&t.subject)))
                        .map(|t| t.subject.entity())
                        .filter(|e| self.schema.member(&e.entity_type, target).is_some())
                        .collect();
                    related.dedup();

                    let mut children = Vec::with_capacity(related.len());
                    for related_entity in related {
                        children.push(
                            self.expand_member(related_entity, target.clone(), depth - 1, &mut *path)
                                .await?,
                        );
                    }
                    Ok(ExpandTree::Chain {
                        entity: entity.clone(),
                        relation: relation.clone(),
                        target: target.clone(),
                        children,
                    })
                }
                Expression::Union { children } => {
                    let mut expanded = Vec::with_capacity(children.len());
                    for child in children {
                        expanded.push(self.expand_expression(entity, child, depth, &mut *path).await?);
                    }
                    Ok(ExpandTree::Union { children: expanded })
                }
                Expression::Intersection { children } => {
                    let mut expanded = Vec::with_capacity(children.len());
                    for child in children {
                        expanded.push(self.expand_expression(entity, child, depth, &mut *path).await?);
                    }
                    Ok(ExpandTree::Intersection { children: expanded })
                }
                Expression::Exclusion { base, excluded } => Ok(ExpandTree::Exclusion {
                    base: Box::new(self.expand_expression(entity, base, depth, &mut *path).await?),
                    excluded: Box::new(self.expand_expression(entity, excluded, depth, &mut *path).await?),
                }),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryTupleRepository;
    use crate::schema::SchemaLimits;

    const SCHEMA: &str = "
        entity user {}
        entity group {
            relation member @user @group#member
        }
        entity folder {
            relation viewer @user
        }
        entity document {
            relation parent @folder
            relation owner @user
            relation viewer @user @group#member
            relation banned @user
            permission view = owner or viewer or parent.viewer
            permission edit = owner not banned
        }
    ";

    async fn setup(tuples: &[&str]) -> (SubjectExpander, Arc<Schema>) {
        let repo = Arc::new(InMemoryTupleRepository::new());
        for t in tuples {
            repo.write_tuple(t.parse().unwrap()).await.unwrap();
        }
        let schema = Arc::new(Schema::compile(SCHEMA, &SchemaLimits::default()).unwrap());
        (SubjectExpander::new(repo, &EngineConfig::default()), schema)
    }

    fn request(entity: &str, name: &str) -> ExpandRequest {
        ExpandRequest {
            entity: entity.parse().unwrap(),
            name: name.to_string(),
            schema_version: String::new(),
            depth: None,
        }
    }

    #[tokio::test]
    async fn test_expand_subjects() {
        let (expander, schema) = setup(&["document:1#viewer@user:alice", "document:1#viewer@user:bob"]).await;

        let subjects = expander
            .list_subjects(schema, &request("document:1", "viewer"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(subjects, vec![Subject::user("alice"), Subject::user("bob")]);
    }

    #[tokio::test]
    async fn test_expand_permission_mirrors_expression() {
        let (expander, schema) = setup(&[
            "document:1#owner@user:alice",
            "document:1#viewer@group:eng#member",
            "group:eng#member@user:bob",
            "document:1#parent@folder:docs",
            "folder:docs#viewer@user:carol",
        ])
        .await;

        let tree = expander
            .expand(schema.clone(), &request("document:1", "view"), CancellationToken::new())
            .await
            .unwrap();

        let ExpandTree::Permission { child, .. } = &tree else {
            panic!("expected permission node, got {tree:?}");
        };
        let ExpandTree::Union { children } = child.as_ref() else {
            panic!("expected union, got {child:?}");
        };
        assert_eq!(children.len(), 3);
        assert!(matches!(children[2], ExpandTree::Chain { .. }));

        let subjects = expander
            .list_subjects(schema, &request("document:1", "view"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            subjects,
            vec![Subject::user("alice"), Subject::user("bob"), Subject::user("carol")]
        );
    }

    #[tokio::test]
    async fn test_expand_exclusion_keeps_both_sides() {
        let (expander, schema) = setup(&["document:1#owner@user:alice", "document:1#banned@user:alice"]).await;

        let tree = expander
            .expand(schema, &request("document:1", "edit"), CancellationToken::new())
            .await
            .unwrap();
        let ExpandTree::Permission { child, .. } = tree else {
            panic!("expected permission node");
        };
        assert!(matches!(*child, ExpandTree::Exclusion { .. }));
    }

    #[tokio::test]
    async fn test_cycles_become_markers() {
        let (expander, schema) = setup(&[
            "group:a#member@group:b#member",
            "group:b#member@group:a#member",
            "group:b#member@user:alice",
        ])
        .await;

        let tree = expander
            .expand(schema, &request("group:a", "member"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tree.leaf_subjects(), vec![Subject::user("alice")]);
        let ExpandTree::Relation { children, .. } = &tree else {
            panic!("expected relation node");
        };
        let ExpandTree::Relation { children: nested, .. } = &children[0] else {
            panic!("expected nested relation node");
        };
        assert_eq!(
            nested[0],
            ExpandTree::Cycle {
                entity: Entity::new("group", "a"),
                name: "member".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_depth_limit_becomes_marker() {
        let (expander, schema) = setup(&["group:a#member@group:b#member", "group:b#member@user:alice"]).await;

        let mut shallow = request("group:a", "member");
        shallow.depth = Some(1);
        let tree = expander.expand(schema, &shallow, CancellationToken::new()).await.unwrap();

        let ExpandTree::Relation { children, .. } = tree else {
            panic!("expected relation node");
        };
        assert!(matches!(children[0], ExpandTree::DepthLimit { .. }));
    }

    #[tokio::test]
    async fn test_undefined_name() {
        let (expander, schema) = setup(&[]).await;
        let result = expander
            .expand(schema, &request("document:1", "share"), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RebacError::UndefinedAction { .. })));
    }

    #[tokio::test]
    async fn test_canceled_expansion() {
        let (expander, schema) = setup(&["document:1#viewer@user:alice"]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = expander.expand(schema, &request("document:1", "view"), cancel).await;
        assert!(matches!(result, Err(RebacError::Canceled)));
    }
}
