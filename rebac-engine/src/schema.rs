//! Compiled authorization schema.
//!
//! Schema text is parsed into a syntax tree (`parser`), validated, and lowered
//! into an immutable arena of entity definitions addressed by name. Cycles
//! between definitions are ordinary data here; evaluation bounds them.

mod parser;
pub mod registry;

pub use parser::Location;
pub use registry::{SchemaEntry, SchemaRegistry};

use crate::{
    error::{RebacError, Result},
    models::{Subject, Tuple},
};
use ahash::{AHashMap, AHashSet};
use parser::{EntityAst, ExprAst, SchemaAst};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;

/// Structural limits enforced at compile time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaLimits {
    pub max_entities: usize,
    pub max_members_per_entity: usize,
}

impl Default for SchemaLimits {
    fn default() -> Self {
        Self {
            max_entities: 256,
            max_members_per_entity: 128,
        }
    }
}

/// A compiled, immutable schema version
#[derive(Debug, Clone, Serialize)]
pub struct Schema {
    /// Content-derived version identifier
    pub version: String,
    pub entities: Vec<EntityDefinition>,
    #[serde(skip)]
    index: AHashMap<String, usize>,
}

/// Definition of an entity type
#[derive(Debug, Clone, Serialize)]
pub struct EntityDefinition {
    pub name: String,
    pub relations: Vec<RelationDefinition>,
    pub permissions: Vec<PermissionDefinition>,
    #[serde(skip)]
    members: AHashMap<String, MemberIndex>,
}

#[derive(Debug, Clone, Copy)]
enum MemberIndex {
    Relation(usize),
    Permission(usize),
}

/// A named member of an entity definition
#[derive(Debug, Clone, Copy)]
pub enum Member<'a> {
    Relation(&'a RelationDefinition),
    Permission(&'a PermissionDefinition),
}

/// Definition of a relation within an entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationDefinition {
    pub name: String,
    pub subject_types: Vec<SubjectType>,
}

/// Allowed subject type of a relation, optionally scoped to one of its relations
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SubjectType {
    pub entity_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
}

/// Permission definition with its expression tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionDefinition {
    pub name: String,
    pub expression: Expression,
}

/// Permission expression. The operator set is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Expression {
    Union { children: Vec<Expression> },
    Intersection { children: Vec<Expression> },
    Exclusion {
        base: Box<Expression>,
        excluded: Box<Expression>,
    },
    /// Relation or permission of the same entity
    Leaf { name: String },
    /// `relation.target`: `target` evaluated on every entity related through `relation`
    Chain { relation: String, target: String },
}

impl Expression {
    pub fn leaf(name: &str) -> Self {
        Self::Leaf {
            name: name.to_string(),
        }
    }

    pub fn chain(relation: &str, target: &str) -> Self {
        Self::Chain {
            relation: relation.to_string(),
            target: target.to_string(),
        }
    }

    fn union_of(mut children: Vec<Expression>) -> Self {
        if children.len() == 1 {
            children.remove(0)
        } else {
            Self::Union { children }
        }
    }

    fn intersection_of(mut children: Vec<Expression>) -> Self {
        if children.len() == 1 {
            children.remove(0)
        } else {
            Self::Intersection { children }
        }
    }
}

impl fmt::Display for SubjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relation {
            Some(ref relation) => write!(f, "{}#{}", self.entity_type, relation),
            None => write!(f, "{}", self.entity_type),
        }
    }
}

impl RelationDefinition {
    /// Whether a tuple subject of this shape may be stored on the relation.
    pub fn allows(&self, subject: &Subject) -> bool {
        self.subject_types
            .iter()
            .any(|t| t.entity_type == subject.subject_type && t.relation == subject.relation)
    }
}

impl EntityDefinition {
    fn new(name: String, relations: Vec<RelationDefinition>, permissions: Vec<PermissionDefinition>) -> Self {
        let members = relations
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), MemberIndex::Relation(i)))
            .chain(
                permissions
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (p.name.clone(), MemberIndex::Permission(i))),
            )
            .collect();
        Self {
            name,
            relations,
            permissions,
            members,
        }
    }

    pub fn member(&self, name: &str) -> Option<Member<'_>> {
        match self.members.get(name)? {
            MemberIndex::Relation(i) => self.relations.get(*i).map(Member::Relation),
            MemberIndex::Permission(i) => self.permissions.get(*i).map(Member::Permission),
        }
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDefinition> {
        match self.member(name)? {
            Member::Relation(relation) => Some(relation),
            Member::Permission(_) => None,
        }
    }

    pub fn permission(&self, name: &str) -> Option<&PermissionDefinition> {
        match self.member(name)? {
            Member::Permission(permission) => Some(permission),
            Member::Relation(_) => None,
        }
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }
}

impl Schema {
    /// Parse, validate and compile schema text.
    pub fn compile(text: &str, limits: &SchemaLimits) -> Result<Self> {
        let ast = parser::parse(text)?;
        let entities = Compiler::new(&ast, limits)?.compile()?;
        let index = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
        let schema = Self {
            version: version_of(text),
            entities,
            index,
        };
        debug!(version = %schema.version, entities = schema.entities.len(), "Compiled schema");
        Ok(schema)
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDefinition> {
        self.index.get(name).and_then(|i| self.entities.get(*i))
    }

    pub fn member(&self, entity_type: &str, name: &str) -> Option<Member<'_>> {
        self.entity(entity_type)?.member(name)
    }

    /// Check that a tuple is well-formed and storable under this schema.
    pub fn validate_tuple(&self, tuple: &Tuple) -> Result<()> {
        tuple.validate()?;

        let entity = self.entity(&tuple.entity.entity_type).ok_or_else(|| {
            RebacError::Validation(format!(
                "entity type '{}' is not defined in schema {}",
                tuple.entity.entity_type, self.version
            ))
        })?;
        let relation = match entity.member(&tuple.relation) {
            Some(Member::Relation(relation)) => relation,
            Some(Member::Permission(_)) => {
                return Err(RebacError::Validation(format!(
                    "'{}' is a permission of '{}'; tuples can only be written to relations",
                    tuple.relation, entity.name
                )))
            }
            None => {
                return Err(RebacError::Validation(format!(
                    "relation '{}' is not defined on entity type '{}'",
                    tuple.relation, entity.name
                )))
            }
        };
        if !relation.allows(&tuple.subject) {
            let shape = SubjectType {
                entity_type: tuple.subject.subject_type.clone(),
                relation: tuple.subject.relation.clone(),
            };
            return Err(RebacError::Validation(format!(
                "subject type '{shape}' is not allowed on {}#{}",
                entity.name, relation.name
            )));
        }
        Ok(())
    }
}

/// Lowercase hex of the first 16 bytes of the SHA-256 digest of the text.
pub fn version_of(text: &str) -> String {
    hex::encode(&Sha256::digest(text.as_bytes())[..16])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Relation,
    Permission,
}

struct Compiler<'a> {
    ast: &'a SchemaAst,
    entities: AHashMap<&'a str, &'a EntityAst>,
    members: AHashMap<&'a str, AHashMap<&'a str, Kind>>,
}

impl<'a> Compiler<'a> {
    fn new(ast: &'a SchemaAst, limits: &SchemaLimits) -> Result<Self> {
        if let Some(extra) = ast.entities.get(limits.max_entities) {
            return Err(RebacError::schema(
                format!(
                    "too many entities: {} exceeds limit of {}",
                    ast.entities.len(),
                    limits.max_entities
                ),
                extra.location.to_string(),
            ));
        }

        let mut entities = AHashMap::new();
        let mut members = AHashMap::new();
        for entity in &ast.entities {
            if entities.insert(entity.name.as_str(), entity).is_some() {
                return Err(RebacError::schema(
                    format!("duplicate entity '{}'", entity.name),
                    entity.location.to_string(),
                ));
            }

            let count = entity.relations.len() + entity.permissions.len();
            if count > limits.max_members_per_entity {
                return Err(RebacError::schema(
                    format!(
                        "too many members in entity '{}': {count} exceeds limit of {}",
                        entity.name, limits.max_members_per_entity
                    ),
                    entity.location.to_string(),
                ));
            }

            let mut names = AHashMap::new();
            let declared = entity
                .relations
                .iter()
                .map(|r| (r.name.as_str(), Kind::Relation, r.location))
                .chain(
                    entity
                        .permissions
                        .iter()
                        .map(|p| (p.name.as_str(), Kind::Permission, p.location)),
                );
            for (name, kind, location) in declared {
                if names.insert(name, kind).is_some() {
                    return Err(RebacError::schema(
                        format!("duplicate member '{name}' in entity '{}'", entity.name),
                        location.to_string(),
                    ));
                }
            }
            members.insert(entity.name.as_str(), names);
        }

        Ok(Self {
            ast,
            entities,
            members,
        })
    }

    fn kind_of(&self, entity: &str, name: &str) -> Option<Kind> {
        self.members.get(entity)?.get(name).copied()
    }

    fn compile(&self) -> Result<Vec<EntityDefinition>> {
        let mut compiled = Vec::with_capacity(self.ast.entities.len());
        for entity in &self.ast.entities {
            let relations = entity
                .relations
                .iter()
                .map(|relation| self.compile_relation(entity, relation))
                .collect::<Result<Vec<_>>>()?;
            let permissions = entity
                .permissions
                .iter()
                .map(|permission| {
                    Ok(PermissionDefinition {
                        name: permission.name.clone(),
                        expression: self.lower(entity, &permission.expr)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            compiled.push(EntityDefinition::new(entity.name.clone(), relations, permissions));
        }
        self.check_grounded(&compiled)?;
        Ok(compiled)
    }

    fn compile_relation(&self, entity: &EntityAst, relation: &parser::RelationAst) -> Result<RelationDefinition> {
        let mut subject_types: Vec<SubjectType> = Vec::new();
        for subject_type in &relation.subject_types {
            if !self.entities.contains_key(subject_type.entity_type.as_str()) {
                return Err(RebacError::schema(
                    format!(
                        "relation '{}' of entity '{}' references undefined entity '{}'",
                        relation.name, entity.name, subject_type.entity_type
                    ),
                    subject_type.location.to_string(),
                ));
            }
            if let Some(ref scoped) = subject_type.relation {
                if self.kind_of(&subject_type.entity_type, scoped).is_none() {
                    return Err(RebacError::schema(
                        format!(
                            "relation '{}' of entity '{}' references undefined '{}#{}'",
                            relation.name, entity.name, subject_type.entity_type, scoped
                        ),
                        subject_type.location.to_string(),
                    ));
                }
            }
            let compiled = SubjectType {
                entity_type: subject_type.entity_type.clone(),
                relation: subject_type.relation.clone(),
            };
            if !subject_types.contains(&compiled) {
                subject_types.push(compiled);
            }
        }
        Ok(RelationDefinition {
            name: relation.name.clone(),
            subject_types,
        })
    }

    fn lower(&self, entity: &EntityAst, expr: &ExprAst) -> Result<Expression> {
        match expr {
            ExprAst::Reference { name, location } => {
                if self.kind_of(&entity.name, name).is_none() {
                    return Err(RebacError::schema(
                        format!(
                            "undefined relation or permission '{name}' in entity '{}'",
                            entity.name
                        ),
                        location.to_string(),
                    ));
                }
                Ok(Expression::leaf(name))
            }
            ExprAst::Chain {
                relation,
                target,
                location,
            } => self.lower_chain(entity, relation, target, *location),
            ExprAst::Or(..) => {
                let mut operands = Vec::new();
                flatten(expr, &mut operands, |e| match e {
                    ExprAst::Or(l, r) => Some((l.as_ref(), r.as_ref())),
                    _ => None,
                });
                let mut children = Vec::with_capacity(operands.len());
                for operand in operands {
                    match self.lower(entity, operand)? {
                        Expression::Union { children: nested } => children.extend(nested),
                        lowered => children.push(lowered),
                    }
                }
                Ok(Expression::union_of(children))
            }
            ExprAst::And(..) => {
                let mut operands = Vec::new();
                flatten(expr, &mut operands, |e| match e {
                    ExprAst::And(l, r) => Some((l.as_ref(), r.as_ref())),
                    _ => None,
                });
                let mut positives = Vec::new();
                let mut negatives = Vec::new();
                for operand in operands {
                    match operand {
                        ExprAst::Not { operand, .. } => negatives.push(self.lower(entity, operand)?),
                        positive => match self.lower(entity, positive)? {
                            Expression::Intersection { children } => positives.extend(children),
                            lowered => positives.push(lowered),
                        },
                    }
                }
                if positives.is_empty() {
                    return Err(unsatisfiable(expr.location()));
                }
                let base = Expression::intersection_of(positives);
                if negatives.is_empty() {
                    Ok(base)
                } else {
                    Ok(Expression::Exclusion {
                        base: Box::new(base),
                        excluded: Box::new(Expression::union_of(negatives)),
                    })
                }
            }
            ExprAst::Exclude(base, excluded) => Ok(Expression::Exclusion {
                base: Box::new(self.lower(entity, base)?),
                excluded: Box::new(self.lower(entity, excluded)?),
            }),
            ExprAst::Not { location, .. } => Err(unsatisfiable(*location)),
        }
    }

    fn lower_chain(&self, entity: &EntityAst, relation: &str, target: &str, location: Location) -> Result<Expression> {
        let relation_ast = match self.kind_of(&entity.name, relation) {
            Some(Kind::Relation) => entity.relations.iter().find(|r| r.name == relation),
            Some(Kind::Permission) => {
                return Err(RebacError::schema(
                    format!("chain '{relation}.{target}' must go through a relation, '{relation}' is a permission"),
                    location.to_string(),
                ))
            }
            None => None,
        };
        let Some(relation_ast) = relation_ast else {
            return Err(RebacError::schema(
                format!("undefined relation '{relation}' in entity '{}'", entity.name),
                location.to_string(),
            ));
        };

        let resolvable = relation_ast
            .subject_types
            .iter()
            .any(|t| t.relation.is_none() && self.kind_of(&t.entity_type, target).is_some());
        if !resolvable {
            return Err(RebacError::schema(
                format!(
                    "chain '{relation}.{target}' cannot resolve: no direct subject type of '{relation}' defines '{target}'"
                ),
                location.to_string(),
            ));
        }
        Ok(Expression::chain(relation, target))
    }

    /// Least fixpoint over same-entity references: a permission is grounded
    /// when it can be decided through a relation or a chain without first
    /// deciding itself.
    fn check_grounded(&self, entities: &[EntityDefinition]) -> Result<()> {
        let mut grounded: AHashSet<(&str, &str)> = AHashSet::new();
        loop {
            let mut changed = false;
            for entity in entities {
                for permission in &entity.permissions {
                    let key = (entity.name.as_str(), permission.name.as_str());
                    if !grounded.contains(&key) && is_grounded(entity, &permission.expression, &grounded) {
                        grounded.insert(key);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        for entity in &self.ast.entities {
            for permission in &entity.permissions {
                if !grounded.contains(&(entity.name.as_str(), permission.name.as_str())) {
                    return Err(RebacError::schema(
                        format!(
                            "permission '{}' of entity '{}' only refers to itself through a cycle and can never be decided",
                            permission.name, entity.name
                        ),
                        permission.location.to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn is_grounded(entity: &EntityDefinition, expr: &Expression, grounded: &AHashSet<(&str, &str)>) -> bool {
    match expr {
        Expression::Leaf { name } => match entity.member(name) {
            Some(Member::Relation(_)) => true,
            Some(Member::Permission(p)) => grounded.contains(&(entity.name.as_str(), p.name.as_str())),
            None => false,
        },
        Expression::Chain { .. } => true,
        Expression::Union { children } => children.iter().any(|c| is_grounded(entity, c, grounded)),
        Expression::Intersection { children } => children.iter().all(|c| is_grounded(entity, c, grounded)),
        Expression::Exclusion { base, .. } => is_grounded(entity, base, grounded),
    }
}

fn flatten<'e>(
    expr: &'e ExprAst,
    out: &mut Vec<&'e ExprAst>,
    split: impl Fn(&'e ExprAst) -> Option<(&'e ExprAst, &'e ExprAst)> + Copy,
) {
    match split(expr) {
        Some((lhs, rhs)) => {
            flatten(lhs, out, split);
            flatten(rhs, out, split);
        }
        None => out.push(expr),
    }
}

fn unsatisfiable(location: Location) -> RebacError {
    RebacError::schema(
        "exclusion without a positive operand can never be satisfied; write `a not b` or `a and not b`",
        location.to_string(),
    )
}
