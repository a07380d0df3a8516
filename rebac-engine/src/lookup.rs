//! Lookup: compile a permission into a predicate over stored tuples.
//!
//! Instead of enumerating entities and checking each one, the permission
//! expression for an action is compiled into a [`Filter`] with the queried
//! subject substituted, then rendered as SQL over the logical tuple table
//! `(entity_type, entity_id, relation, subject_type, subject_id, subject_relation)`.
//! Executing the query is left to the storage layer.

use crate::{
    config::EngineConfig,
    error::{RebacError, Result},
    models::{LookupRequest, LookupResponse, Subject},
    schema::{Expression, Member, RelationDefinition, Schema},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Set of entity ids, described in terms of stored tuples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Matches nothing
    Never,
    Or(Vec<Filter>),
    And(Vec<Filter>),
    AndNot(Box<Filter>, Box<Filter>),
    /// Ids with a tuple `(entity_type, id, relation, subject)` whose subject matches
    Tuples {
        entity_type: String,
        relation: String,
        subject: SubjectMatch,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectMatch {
    Exact(Subject),
    /// Subject of `subject_type` with `subject_relation` ("" for direct
    /// subjects) whose id is in `filter`
    Nested {
        subject_type: String,
        subject_relation: String,
        filter: Box<Filter>,
    },
}

impl Filter {
    fn or(children: Vec<Filter>) -> Self {
        let mut flat = Vec::with_capacity(children.len());
        for child in children {
            match child {
                Self::Never => {}
                Self::Or(nested) => flat.extend(nested),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Self::Never,
            1 => flat.remove(0),
            _ => Self::Or(flat),
        }
    }

    fn and(children: Vec<Filter>) -> Self {
        let mut flat = Vec::with_capacity(children.len());
        for child in children {
            match child {
                Self::Never => return Self::Never,
                Self::And(nested) => flat.extend(nested),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Self::Never,
            1 => flat.remove(0),
            _ => Self::And(flat),
        }
    }

    fn and_not(base: Filter, excluded: Filter) -> Self {
        match (base, excluded) {
            (Self::Never, _) => Self::Never,
            (base, Self::Never) => base,
            (base, excluded) => Self::AndNot(Box::new(base), Box::new(excluded)),
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, Self::Never)
    }
}

/// Compiles lookup requests into SQL predicates.
pub struct LookupEngine {
    table: String,
    max_hops: u32,
}

impl LookupEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            table: config.tuple_table.clone(),
            max_hops: config.lookup_depth,
        }
    }

    /// Compile the filter for `request.action` on `request.entity_type`.
    pub fn filter(&self, schema: &Schema, request: &LookupRequest, cancel: &CancellationToken) -> Result<Filter> {
        request.subject.validate()?;
        if schema.member(&request.entity_type, &request.action).is_none() {
            return Err(RebacError::undefined_action(&request.entity_type, &request.action));
        }

        let compiler = FilterCompiler {
            schema,
            subject: &request.subject,
            cancel,
        };
        compiler.member(&request.entity_type, &request.action, self.max_hops, &mut Vec::new())
    }

    pub fn lookup(
        &self,
        schema: &Schema,
        request: &LookupRequest,
        cancel: &CancellationToken,
    ) -> Result<LookupResponse> {
        let filter = self.filter(schema, request, cancel)?;
        Ok(self.render(&request.entity_type, &filter))
    }

    /// `SELECT DISTINCT t0.entity_id FROM <table> AS t0 WHERE t0.entity_type = $1 AND <predicate>`
    pub fn render(&self, entity_type: &str, filter: &Filter) -> LookupResponse {
        let mut writer = SqlWriter {
            table: &self.table,
            args: Vec::new(),
            aliases: 0,
        };
        let root = writer.alias();
        let entity_type = writer.arg(entity_type);
        let predicate = writer.render(filter, &format!("{root}.entity_id"));

        LookupResponse {
            query: format!(
                "SELECT DISTINCT {root}.entity_id FROM {} AS {root} WHERE {root}.entity_type = {entity_type} AND {predicate}",
                self.table
            ),
            args: writer.args,
        }
    }
}

struct FilterCompiler<'a> {
    schema: &'a Schema,
    subject: &'a Subject,
    cancel: &'a CancellationToken,
}

impl FilterCompiler<'_> {
    /// `path` holds the members entered through same-entity references since
    /// the last tuple hop; re-entering one of them adds nothing (least fixpoint).
    fn member(&self, entity_type: &str, name: &str, hops: u32, path: &mut Vec<String>) -> Result<Filter> {
        if self.cancel.is_cancelled() {
            return Err(RebacError::Canceled);
        }
        if path.iter().any(|entered| entered == name) {
            return Ok(Filter::Never);
        }
        let member = self
            .schema
            .member(entity_type, name)
            .ok_or_else(|| RebacError::undefined_action(entity_type, name))?;

        path.push(name.to_string());
        let filter = match member {
            Member::Relation(relation) => self.relation(entity_type, relation, hops),
            Member::Permission(permission) => self.expression(entity_type, &permission.expression, hops, path),
        };
        path.pop();
        filter
    }

    fn relation(&self, entity_type: &str, relation: &RelationDefinition, hops: u32) -> Result<Filter> {
        let mut branches = Vec::new();
        if relation.allows(self.subject) {
            branches.push(Filter::Tuples {
                entity_type: entity_type.to_string(),
                relation: relation.name.clone(),
                subject: SubjectMatch::Exact(self.subject.clone()),
            });
        }

        for subject_type in &relation.subject_types {
            let Some(ref subject_relation) = subject_type.relation else {
                continue;
            };
            let Some(hops) = self.hop(entity_type, &relation.name, hops) else {
                continue;
            };
            let nested = self.member(&subject_type.entity_type, subject_relation, hops, &mut Vec::new())?;
            branches.push(self.nested(entity_type, &relation.name, &subject_type.entity_type, subject_relation, nested));
        }
        Ok(Filter::or(branches))
    }

    fn expression(&self, entity_type: &str, expression: &Expression, hops: u32, path: &mut Vec<String>) -> Result<Filter> {
        match expression {
            Expression::Leaf { name } => self.member(entity_type, name, hops, path),
            Expression::Chain { relation, target } => self.chain(entity_type, relation, target, hops),
            Expression::Union { children } => {
                let children = children
                    .iter()
                    .map(|child| self.expression(entity_type, child, hops, path))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Filter::or(children))
            }
            Expression::Intersection { children } => {
                let children = children
                    .iter()
                    .map(|child| self.expression(entity_type, child, hops, path))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Filter::and(children))
            }
            Expression::Exclusion { base, excluded } => {
                let base = self.expression(entity_type, base, hops, path)?;
                let excluded = self.expression(entity_type, excluded, hops, path)?;
                Ok(Filter::and_not(base, excluded))
            }
        }
    }

    /// Chains follow direct subjects of the chain relation.
    fn chain(&self, entity_type: &str, relation: &str, target: &str, hops: u32) -> Result<Filter> {
        let Some(definition) = self.schema.entity(entity_type).and_then(|e| e.relation(relation)) else {
            return Ok(Filter::Never);
        };

        let mut branches = Vec::new();
        for subject_type in &definition.subject_types {
            if subject_type.relation.is_some() || self.schema.member(&subject_type.entity_type, target).is_none() {
                continue;
            }
            let Some(hops) = self.hop(entity_type, relation, hops) else {
                continue;
            };
            let nested = self.member(&subject_type.entity_type, target, hops, &mut Vec::new())?;
            branches.push(self.nested(entity_type, relation, &subject_type.entity_type, "", nested));
        }
        Ok(Filter::or(branches))
    }

    fn hop(&self, entity_type: &str, relation: &str, hops: u32) -> Option<u32> {
        if hops == 0 {
            debug!(entity_type, relation, "Lookup depth reached; truncating branch");
            return None;
        }
        Some(hops - 1)
    }

    fn nested(&self, entity_type: &str, relation: &str, subject_type: &str, subject_relation: &str, filter: Filter) -> Filter {
        if filter.is_never() {
            return Filter::Never;
        }
        Filter::Tuples {
            entity_type: entity_type.to_string(),
            relation: relation.to_string(),
            subject: SubjectMatch::Nested {
                subject_type: subject_type.to_string(),
                subject_relation: subject_relation.to_string(),
                filter: Box::new(filter),
            },
        }
    }
}

struct SqlWriter<'a> {
    table: &'a str,
    args: Vec<String>,
    aliases: usize,
}

impl SqlWriter<'_> {
    fn arg(&mut self, value: &str) -> String {
        self.args.push(value.to_string());
        format!("${}", self.args.len())
    }

    fn alias(&mut self) -> String {
        let alias = format!("t{}", self.aliases);
        self.aliases += 1;
        alias
    }

    fn render(&mut self, filter: &Filter, column: &str) -> String {
        match filter {
            Filter::Never => "1 = 0".to_string(),
            Filter::Or(children) => self.join(children, column, " OR "),
            Filter::And(children) => self.join(children, column, " AND "),
            Filter::AndNot(base, excluded) => {
                let base = self.render(base, column);
                let excluded = self.render(excluded, column);
                format!("({base} AND NOT {excluded})")
            }
            Filter::Tuples {
                entity_type,
                relation,
                subject,
            } => {
                let t = self.alias();
                let mut conditions = vec![
                    format!("{t}.entity_type = {}", self.arg(entity_type)),
                    format!("{t}.relation = {}", self.arg(relation)),
                ];
                match subject {
                    SubjectMatch::Exact(subject) => {
                        conditions.push(format!("{t}.subject_type = {}", self.arg(&subject.subject_type)));
                        conditions.push(format!("{t}.subject_id = {}", self.arg(&subject.id)));
                        let subject_relation = subject.relation.as_deref().unwrap_or("");
                        conditions.push(format!("{t}.subject_relation = {}", self.arg(subject_relation)));
                    }
                    SubjectMatch::Nested {
                        subject_type,
                        subject_relation,
                        filter,
                    } => {
                        conditions.push(format!("{t}.subject_type = {}", self.arg(subject_type)));
                        conditions.push(format!("{t}.subject_relation = {}", self.arg(subject_relation)));
                        conditions.push(self.render(filter, &format!("{t}.subject_id")));
                    }
                }
                format!(
                    "{column} IN (SELECT {t}.entity_id FROM {} AS {t} WHERE {})",
                    self.table,
                    conditions.join(" AND ")
                )
            }
        }
    }

    fn join(&mut self, children: &[Filter], column: &str, separator: &str) -> String {
        let parts: Vec<String> = children.iter().map(|child| self.render(child, column)).collect();
        format!("({})", parts.join(separator))
    }
}
