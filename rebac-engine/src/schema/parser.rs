use crate::error::{RebacError, Result};
use lazy_static::lazy_static;
use pest::error::LineColLocation;
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;
use std::fmt;

#[derive(Parser)]
#[grammar = "schema/grammar.pest"]
struct SchemaParser;

lazy_static! {
    // Lowest precedence first: or < and < not (exclusion) < prefix not.
    static ref PRATT: PrattParser<Rule> = PrattParser::new()
        .op(Op::infix(Rule::or_op, Assoc::Left))
        .op(Op::infix(Rule::and_op, Assoc::Left))
        .op(Op::infix(Rule::not_op, Assoc::Left))
        .op(Op::prefix(Rule::neg));
}

/// Source position of a construct, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaAst {
    pub entities: Vec<EntityAst>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityAst {
    pub name: String,
    pub location: Location,
    pub relations: Vec<RelationAst>,
    pub permissions: Vec<PermissionAst>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationAst {
    pub name: String,
    pub location: Location,
    pub subject_types: Vec<SubjectTypeAst>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectTypeAst {
    pub entity_type: String,
    pub relation: Option<String>,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionAst {
    pub name: String,
    pub location: Location,
    pub expr: ExprAst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprAst {
    Reference { name: String, location: Location },
    Chain { relation: String, target: String, location: Location },
    Or(Box<ExprAst>, Box<ExprAst>),
    And(Box<ExprAst>, Box<ExprAst>),
    Exclude(Box<ExprAst>, Box<ExprAst>),
    /// Prefix negation; only meaningful next to a positive operand of an `and`.
    Not { operand: Box<ExprAst>, location: Location },
}

impl ExprAst {
    pub fn location(&self) -> Location {
        match self {
            Self::Reference { location, .. }
            | Self::Chain { location, .. }
            | Self::Not { location, .. } => *location,
            Self::Or(lhs, _) | Self::And(lhs, _) | Self::Exclude(lhs, _) => lhs.location(),
        }
    }
}

/// Parses schema text into an unvalidated syntax tree.
pub fn parse(input: &str) -> Result<SchemaAst> {
    let pairs = SchemaParser::parse(Rule::schema, input).map_err(|e| {
        let (line, column) = match e.line_col {
            LineColLocation::Pos(pos) | LineColLocation::Span(pos, _) => pos,
        };
        RebacError::schema(
            format!("syntax error: {}", e.variant.message()),
            Location { line, column }.to_string(),
        )
    })?;

    let mut entities = Vec::new();
    for pair in pairs.flatten().filter(|p| p.as_rule() == Rule::entity_def) {
        entities.push(parse_entity(pair)?);
    }
    Ok(SchemaAst { entities })
}

fn location_of(pair: &Pair<'_, Rule>) -> Location {
    let (line, column) = pair.as_span().start_pos().line_col();
    Location { line, column }
}

fn missing(what: &str, parent: &Pair<'_, Rule>) -> RebacError {
    RebacError::schema(format!("missing {what}"), location_of(parent).to_string())
}

fn next_identifier(inner: &mut Pairs<'_, Rule>, what: &str, parent: &Pair<'_, Rule>) -> Result<String> {
    inner
        .next()
        .filter(|p| p.as_rule() == Rule::identifier)
        .map(|p| p.as_str().to_string())
        .ok_or_else(|| missing(what, parent))
}

fn parse_entity(pair: Pair<'_, Rule>) -> Result<EntityAst> {
    let location = location_of(&pair);
    let mut inner = pair.clone().into_inner();
    let name = next_identifier(&mut inner, "entity name", &pair)?;

    let mut relations = Vec::new();
    let mut permissions = Vec::new();
    for member in inner {
        match member.as_rule() {
            Rule::relation_def => relations.push(parse_relation(member)?),
            Rule::permission_def => permissions.push(parse_permission(member)?),
            _ => {}
        }
    }

    Ok(EntityAst {
        name,
        location,
        relations,
        permissions,
    })
}

fn parse_relation(pair: Pair<'_, Rule>) -> Result<RelationAst> {
    let location = location_of(&pair);
    let mut inner = pair.clone().into_inner();
    let name = next_identifier(&mut inner, "relation name", &pair)?;
    let types = inner
        .next()
        .ok_or_else(|| missing("subject types", &pair))?;

    let subject_types = types
        .into_inner()
        .map(|subject_type| {
            let location = location_of(&subject_type);
            let mut parts = subject_type.clone().into_inner();
            let entity_type = next_identifier(&mut parts, "subject type", &subject_type)?;
            let relation = parts.next().map(|p| p.as_str().to_string());
            Ok(SubjectTypeAst {
                entity_type,
                relation,
                location,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(RelationAst {
        name,
        location,
        subject_types,
    })
}

fn parse_permission(pair: Pair<'_, Rule>) -> Result<PermissionAst> {
    let location = location_of(&pair);
    let mut inner = pair.clone().into_inner();
    let name = next_identifier(&mut inner, "permission name", &pair)?;
    let expr = inner
        .next()
        .ok_or_else(|| missing("permission expression", &pair))?;

    Ok(PermissionAst {
        name,
        location,
        expr: parse_expr(expr.into_inner())?,
    })
}

fn parse_expr(pairs: Pairs<'_, Rule>) -> Result<ExprAst> {
    PRATT
        .map_primary(|primary| match primary.as_rule() {
            Rule::reference => {
                let location = location_of(&primary);
                Ok(ExprAst::Reference {
                    name: primary.as_str().trim().to_string(),
                    location,
                })
            }
            Rule::chain => {
                let location = location_of(&primary);
                let mut parts = primary.clone().into_inner();
                let relation = next_identifier(&mut parts, "chain relation", &primary)?;
                let target = next_identifier(&mut parts, "chain target", &primary)?;
                Ok(ExprAst::Chain {
                    relation,
                    target,
                    location,
                })
            }
            Rule::expr => parse_expr(primary.into_inner()),
            rule => Err(RebacError::schema(
                format!("unexpected {rule:?} in expression"),
                location_of(&primary).to_string(),
            )),
        })
        .map_prefix(|op, operand| {
            Ok(ExprAst::Not {
                operand: Box::new(operand?),
                location: location_of(&op),
            })
        })
        .map_infix(|lhs, op, rhs| {
            let (lhs, rhs) = (Box::new(lhs?), Box::new(rhs?));
            match op.as_rule() {
                Rule::or_op => Ok(ExprAst::Or(lhs, rhs)),
                Rule::and_op => Ok(ExprAst::And(lhs, rhs)),
                Rule::not_op => Ok(ExprAst::Exclude(lhs, rhs)),
                rule => Err(RebacError::schema(
                    format!("unexpected operator {rule:?}"),
                    location_of(&op).to_string(),
                )),
            }
        })
        .parse(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(expr: &ExprAst) -> String {
        match expr {
            ExprAst::Reference { name, .. } => name.clone(),
            ExprAst::Chain { relation, target, .. } => format!("{relation}.{target}"),
            ExprAst::Or(l, r) => format!("({} | {})", names(l), names(r)),
            ExprAst::And(l, r) => format!("({} & {})", names(l), names(r)),
            ExprAst::Exclude(l, r) => format!("({} - {})", names(l), names(r)),
            ExprAst::Not { operand, .. } => format!("!{}", names(operand)),
        }
    }

    #[test]
    fn test_parse_empty_entity() {
        let ast = parse("entity user {}").unwrap();
        assert_eq!(ast.entities.len(), 1);
        assert_eq!(ast.entities[0].name, "user");
        assert!(ast.entities[0].relations.is_empty());
    }

    #[test]
    fn test_parse_both_relation_forms() {
        let ast = parse(
            "entity group {
                relation member @user @group#member
                relation owner: user | group#member;
            }",
        )
        .unwrap();

        let group = &ast.entities[0];
        assert_eq!(group.relations.len(), 2);
        for relation in &group.relations {
            assert_eq!(relation.subject_types.len(), 2);
            assert_eq!(relation.subject_types[0].entity_type, "user");
            assert_eq!(relation.subject_types[0].relation, None);
            assert_eq!(relation.subject_types[1].entity_type, "group");
            assert_eq!(relation.subject_types[1].relation.as_deref(), Some("member"));
        }
    }

    #[test]
    fn test_operator_precedence() {
        let ast = parse(
            "entity doc {
                permission p = a or b and c not d
            }",
        )
        .unwrap();
        assert_eq!(names(&ast.entities[0].permissions[0].expr), "(a | (b & (c - d)))");
    }

    #[test]
    fn test_parentheses_chains_and_keyword_synonyms() {
        let ast = parse(
            "entity doc {
                action edit = (owner union parent.admin) intersection not banned
            }",
        )
        .unwrap();
        assert_eq!(
            names(&ast.entities[0].permissions[0].expr),
            "((owner | parent.admin) & !banned)"
        );
    }

    #[test]
    fn test_identifiers_may_start_with_keywords() {
        let ast = parse("entity doc { relation notary @user permission ordered = notary }").unwrap();
        assert_eq!(ast.entities[0].relations[0].name, "notary");
        assert_eq!(names(&ast.entities[0].permissions[0].expr), "notary");
    }

    #[test]
    fn test_comments_are_ignored() {
        let ast = parse(
            "// users
            entity user {} /* block */ entity doc { relation owner @user // trailing
            }",
        )
        .unwrap();
        assert_eq!(ast.entities.len(), 2);
    }

    #[test]
    fn test_syntax_error_reports_location() {
        let err = parse("entity doc {\n  relation owner\n}").unwrap_err();
        match err {
            RebacError::Schema { location, .. } => assert!(location.starts_with("3:"), "{location}"),
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn test_locations_point_at_constructs() {
        let ast = parse("entity doc {\n  relation owner @user\n  permission view = owner\n}").unwrap();
        let doc = &ast.entities[0];
        assert_eq!(doc.location, Location { line: 1, column: 1 });
        assert_eq!(doc.relations[0].location, Location { line: 2, column: 3 });
        assert_eq!(doc.permissions[0].expr.location(), Location { line: 3, column: 21 });
    }
}
