use crate::error::{RebacError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Represents an entity (resource) in the authorization system
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: String,
}

impl Entity {
    pub fn new(entity_type: &str, id: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

impl FromStr for Entity {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        let (entity_type, id) = s
            .split_once(':')
            .ok_or_else(|| RebacError::Validation(format!("expected `type:id`, got '{s}'")))?;
        let entity = Self::new(entity_type, id);
        entity.validate()?;
        Ok(entity)
    }
}

/// Represents a subject in the authorization system.
///
/// A subject with a relation is a subject set: every subject holding
/// `relation` on the entity `subject_type:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subject {
    #[serde(rename = "type")]
    pub subject_type: String,
    pub id: String,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub relation: Option<String>,
}

impl Subject {
    pub fn new(subject_type: &str, id: &str) -> Self {
        Self {
            subject_type: subject_type.to_string(),
            id: id.to_string(),
            relation: None,
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self::new("user", user_id)
    }

    pub fn subject_set(subject_type: &str, id: &str, relation: &str) -> Self {
        Self {
            subject_type: subject_type.to_string(),
            id: id.to_string(),
            relation: Some(relation.to_string()),
        }
    }

    /// The entity this subject points at, dropping any relation.
    pub fn entity(&self) -> Entity {
        Entity::new(&self.subject_type, &self.id)
    }

    pub fn is_subject_set(&self) -> bool {
        self.relation.is_some()
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relation {
            Some(ref relation) => write!(f, "{}:{}#{}", self.subject_type, self.id, relation),
            None => write!(f, "{}:{}", self.subject_type, self.id),
        }
    }
}

impl FromStr for Subject {
    type Err = RebacError;

    fn from_str(s: &str) -> Result<Self> {
        let (entity, relation) = match s.split_once('#') {
            Some((entity, relation)) => (entity, Some(relation)),
            None => (s, None),
        };
        let entity: Entity = entity.parse()?;
        let subject = Self {
            subject_type: entity.entity_type,
            id: entity.id,
            relation: relation.map(str::to_string),
        };
        subject.validate()?;
        Ok(subject)
    }
}

/// Represents a relationship tuple: entity has relation to subject
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tuple {
    pub entity: Entity,
    pub relation: String,
    pub subject: Subject,
}

impl Tuple {
    pub fn new(entity: Entity, relation: &str, subject: Subject) -> Self {
        Self {
            entity,
            relation: relation.to_string(),
            subject,
        }
    }

    /// Structural validation; schema conformance is checked elsewhere.
    pub fn validate(&self) -> Result<()> {
        self.entity.validate()?;
        validate_name("relation", &self.relation)?;
        self.subject.validate()
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.entity, self.relation, self.subject)
    }
}

impl FromStr for Tuple {
    type Err = RebacError;

    /// Parses `document:1#owner@user:alice` or `document:1#viewer@group:eng#member`.
    fn from_str(s: &str) -> Result<Self> {
        let (left, subject) = s
            .split_once('@')
            .ok_or_else(|| RebacError::Validation(format!("missing '@' in tuple '{s}'")))?;
        let (entity, relation) = left
            .split_once('#')
            .ok_or_else(|| RebacError::Validation(format!("missing '#relation' in tuple '{s}'")))?;
        let tuple = Self::new(entity.parse()?, relation, subject.parse()?);
        tuple.validate()?;
        Ok(tuple)
    }
}

impl Entity {
    pub fn validate(&self) -> Result<()> {
        validate_name("entity type", &self.entity_type)?;
        validate_id("entity id", &self.id)
    }
}

impl Subject {
    pub fn validate(&self) -> Result<()> {
        validate_name("subject type", &self.subject_type)?;
        validate_id("subject id", &self.id)?;
        if let Some(ref relation) = self.relation {
            validate_name("subject relation", relation)?;
        }
        Ok(())
    }
}

fn validate_name(field: &str, value: &str) -> Result<()> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    if !valid_start || !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(RebacError::Validation(format!(
            "{field} '{value}' must match [a-z_][a-z0-9_]*"
        )));
    }
    Ok(())
}

fn validate_id(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(RebacError::Validation(format!("{field} must not be empty")));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '*');
    if !value.chars().all(allowed) {
        return Err(RebacError::Validation(format!(
            "{field} '{value}' contains characters outside [A-Za-z0-9_-.*]"
        )));
    }
    Ok(())
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// Tuple filter. `None` and empty id lists act as wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TupleFilter {
    pub entity_type: Option<String>,
    pub entity_ids: Vec<String>,
    pub relation: Option<String>,
    pub subject_type: Option<String>,
    pub subject_ids: Vec<String>,
    /// `Some("")` restricts to direct subjects.
    pub subject_relation: Option<String>,
}

impl TupleFilter {
    /// Every tuple stored on `entity` under `relation`.
    pub fn relation_of(entity: &Entity, relation: &str) -> Self {
        Self {
            entity_type: Some(entity.entity_type.clone()),
            entity_ids: vec![entity.id.clone()],
            relation: Some(relation.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, tuple: &Tuple) -> bool {
        if let Some(ref entity_type) = self.entity_type {
            if tuple.entity.entity_type != *entity_type {
                return false;
            }
        }
        if !self.entity_ids.is_empty() && !self.entity_ids.contains(&tuple.entity.id) {
            return false;
        }
        if let Some(ref relation) = self.relation {
            if tuple.relation != *relation {
                return false;
            }
        }
        if let Some(ref subject_type) = self.subject_type {
            if tuple.subject.subject_type != *subject_type {
                return false;
            }
        }
        if !self.subject_ids.is_empty() && !self.subject_ids.contains(&tuple.subject.id) {
            return false;
        }
        if let Some(ref subject_relation) = self.subject_relation {
            let actual = tuple.subject.relation.as_deref().unwrap_or("");
            if actual != subject_relation {
                return false;
            }
        }
        true
    }
}

/// Batch write request for multiple tuples
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteRequest {
    pub writes: Vec<Tuple>,
    pub deletes: Vec<Tuple>,
}

/// Authorization decision; strictly two-valued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Self::Allow
    }

    pub fn negate(self) -> Self {
        match self {
            Self::Allow => Self::Deny,
            Self::Deny => Self::Allow,
        }
    }
}

/// Authorization check request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub entity: Entity,
    pub action: String,
    pub subject: Subject,
    /// Empty selects the most recently published schema.
    #[serde(default)]
    pub schema_version: String,
    /// Overrides the configured depth budget.
    #[serde(default)]
    pub depth: Option<u32>,
}

impl CheckRequest {
    pub fn new(subject: Subject, action: &str, entity: Entity) -> Self {
        Self {
            entity,
            action: action.to_string(),
            subject,
            schema_version: String::new(),
            depth: None,
        }
    }

    pub fn at_version(mut self, version: &str) -> Self {
        self.schema_version = version.to_string();
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }
}

/// Authorization check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub decision: Decision,
    /// Recursive evaluation steps consumed by the call.
    pub steps: u32,
}

impl CheckResponse {
    pub fn is_allowed(&self) -> bool {
        self.decision.is_allowed()
    }
}

/// Expand request for the permission tree rooted at an entity member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpandRequest {
    pub entity: Entity,
    pub name: String,
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub depth: Option<u32>,
}

/// Permission tree node for expand responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpandTree {
    /// Subjects stored directly on a relation, plus expanded subject sets.
    Relation {
        entity: Entity,
        relation: String,
        subjects: Vec<Subject>,
        children: Vec<ExpandTree>,
    },
    Permission {
        entity: Entity,
        permission: String,
        child: Box<ExpandTree>,
    },
    Union { children: Vec<ExpandTree> },
    Intersection { children: Vec<ExpandTree> },
    Exclusion {
        base: Box<ExpandTree>,
        excluded: Box<ExpandTree>,
    },
    /// One child per entity reached through the chain relation.
    Chain {
        entity: Entity,
        relation: String,
        target: String,
        children: Vec<ExpandTree>,
    },
    /// The member is already being expanded further up the path.
    Cycle { entity: Entity, name: String },
    /// Depth budget ran out before the member could be expanded.
    DepthLimit { entity: Entity, name: String },
}

impl ExpandTree {
    /// All subjects stored directly on relation leaves, in tree order.
    pub fn leaf_subjects(&self) -> Vec<Subject> {
        let mut subjects = Vec::new();
        self.collect_subjects(&mut subjects);
        subjects
    }

    fn collect_subjects(&self, out: &mut Vec<Subject>) {
        match self {
            Self::Relation {
                subjects, children, ..
            } => {
                out.extend(subjects.iter().cloned());
                children.iter().for_each(|c| c.collect_subjects(out));
            }
            Self::Permission { child, .. } => child.collect_subjects(out),
            Self::Union { children }
            | Self::Intersection { children }
            | Self::Chain { children, .. } => {
                children.iter().for_each(|c| c.collect_subjects(out));
            }
            Self::Exclusion { base, excluded } => {
                base.collect_subjects(out);
                excluded.collect_subjects(out);
            }
            Self::Cycle { .. } | Self::DepthLimit { .. } => {}
        }
    }
}

/// Lookup request: which entities of `entity_type` can `subject` act on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupRequest {
    pub entity_type: String,
    pub action: String,
    pub subject: Subject,
    #[serde(default)]
    pub schema_version: String,
}

impl LookupRequest {
    pub fn new(entity_type: &str, action: &str, subject: Subject) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            action: action.to_string(),
            subject,
            schema_version: String::new(),
        }
    }

    pub fn at_version(mut self, version: &str) -> Self {
        self.schema_version = version.to_string();
        self
    }
}

/// Generated query plus positional arguments (`$1`, `$2`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResponse {
    pub query: String,
    pub args: Vec<String>,
}
