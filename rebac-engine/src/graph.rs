use crate::schema::{Expression, Schema};
use ahash::{AHashMap, AHashSet};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Entity,
    Relation,
    Permission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    RelationOf,
    PermissionOf,
    SubjectType,
    PermissionReferences,
    ChainThrough,
    ChainTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    /// `entity:NAME` or `ENTITY#MEMBER`
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

/// Exported view of a schema's dependency graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl SchemaGraph {
    pub fn build(schema: &Schema) -> Self {
        Self::from(&SchemaGraphBuilder::new(schema).build())
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn edges_from<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a GraphEdge> + 'a {
        self.edges.iter().filter(move |edge| edge.from == id)
    }
}

impl From<&DiGraph<GraphNode, EdgeKind>> for SchemaGraph {
    fn from(graph: &DiGraph<GraphNode, EdgeKind>) -> Self {
        let nodes = graph.node_weights().cloned().collect();
        let edges = graph
            .edge_references()
            .map(|edge| GraphEdge {
                from: graph[edge.source()].id.clone(),
                to: graph[edge.target()].id.clone(),
                kind: *edge.weight(),
            })
            .collect();
        Self { nodes, edges }
    }
}

pub fn entity_node_id(entity: &str) -> String {
    format!("entity:{entity}")
}

pub fn member_node_id(entity: &str, member: &str) -> String {
    format!("{entity}#{member}")
}

/// Derives the graph from a compiled schema. Entities keep declaration order.
pub struct SchemaGraphBuilder<'a> {
    schema: &'a Schema,
    graph: DiGraph<GraphNode, EdgeKind>,
    index: AHashMap<String, NodeIndex>,
    seen: AHashSet<(NodeIndex, NodeIndex, EdgeKind)>,
}

impl<'a> SchemaGraphBuilder<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            graph: DiGraph::new(),
            index: AHashMap::new(),
            seen: AHashSet::new(),
        }
    }

    pub fn build(mut self) -> DiGraph<GraphNode, EdgeKind> {
        let schema = self.schema;
        for entity in &schema.entities {
            self.add_node(entity_node_id(&entity.name), NodeKind::Entity, &entity.name);
            for relation in &entity.relations {
                self.add_node(member_node_id(&entity.name, &relation.name), NodeKind::Relation, &relation.name);
            }
            for permission in &entity.permissions {
                self.add_node(
                    member_node_id(&entity.name, &permission.name),
                    NodeKind::Permission,
                    &permission.name,
                );
            }
        }

        for entity in &schema.entities {
            let entity_id = entity_node_id(&entity.name);
            for relation in &entity.relations {
                let relation_id = member_node_id(&entity.name, &relation.name);
                self.add_edge(&entity_id, &relation_id, EdgeKind::RelationOf);
                for subject_type in &relation.subject_types {
                    let target = match subject_type.relation {
                        Some(ref scoped) => member_node_id(&subject_type.entity_type, scoped),
                        None => entity_node_id(&subject_type.entity_type),
                    };
                    self.add_edge(&relation_id, &target, EdgeKind::SubjectType);
                }
            }
            for permission in &entity.permissions {
                let permission_id = member_node_id(&entity.name, &permission.name);
                self.add_edge(&entity_id, &permission_id, EdgeKind::PermissionOf);
                self.add_expression_edges(&entity.name, &permission_id, &permission.expression);
            }
        }
        self.graph
    }

    fn add_expression_edges(&mut self, entity: &str, from: &str, expression: &Expression) {
        match expression {
            Expression::Leaf { name } => {
                self.add_edge(from, &member_node_id(entity, name), EdgeKind::PermissionReferences);
            }
            Expression::Chain { relation, target } => {
                self.add_edge(from, &member_node_id(entity, relation), EdgeKind::ChainThrough);
                let schema = self.schema;
                let subject_types = schema
                    .entity(entity)
                    .and_then(|e| e.relation(relation))
                    .map(|r| r.subject_types.as_slice())
                    .unwrap_or_default();
                for subject_type in subject_types.iter().filter(|t| t.relation.is_none()) {
                    if schema.member(&subject_type.entity_type, target).is_some() {
                        self.add_edge(
                            from,
                            &member_node_id(&subject_type.entity_type, target),
                            EdgeKind::ChainTarget,
                        );
                    }
                }
            }
            Expression::Union { children } | Expression::Intersection { children } => {
                for child in children {
                    self.add_expression_edges(entity, from, child);
                }
            }
            Expression::Exclusion { base, excluded } => {
                self.add_expression_edges(entity, from, base);
                self.add_expression_edges(entity, from, excluded);
            }
        }
    }

    fn add_node(&mut self, id: String, kind: NodeKind, label: &str) {
        let node = self.graph.add_node(GraphNode {
            id: id.clone(),
            kind,
            label: label.to_string(),
        });
        self.index.insert(id, node);
    }

    fn add_edge(&mut self, from: &str, to: &str, kind: EdgeKind) {
        let (Some(&source), Some(&target)) = (self.index.get(from), self.index.get(to)) else {
            return;
        };
        if self.seen.insert((source, target, kind)) {
            self.graph.add_edge(source, target, kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaLimits;

    const SCHEMA: &str = "
        entity user {}
        entity group {
            relation member @user @group#member
        }
        entity folder {
            relation viewer @user @group#member
            permission view = viewer
        }
        entity document {
            relation parent @folder
            relation owner @user
            relation banned @user
            permission view = owner or owner or parent.view
            permission edit = owner not banned
        }
    ";

    fn graph() -> SchemaGraph {
        SchemaGraph::build(&Schema::compile(SCHEMA, &SchemaLimits::default()).unwrap())
    }

    fn edge(from: &str, to: &str, kind: EdgeKind) -> GraphEdge {
        GraphEdge {
            from: from.to_string(),
            to: to.to_string(),
            kind,
        }
    }

    #[test]
    fn test_nodes_follow_declaration_order() {
        let graph = graph();
        let ids: Vec<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "entity:user",
                "entity:group",
                "group#member",
                "entity:folder",
                "folder#viewer",
                "folder#view",
                "entity:document",
                "document#parent",
                "document#owner",
                "document#banned",
                "document#view",
                "document#edit",
            ]
        );
        assert_eq!(graph.node("document#edit").unwrap().kind, NodeKind::Permission);
        assert_eq!(graph.node("document#edit").unwrap().label, "edit");
    }

    #[test]
    fn test_subject_type_edges() {
        let graph = graph();
        let edges: Vec<&GraphEdge> = graph.edges_from("group#member").collect();
        assert_eq!(
            edges,
            vec![
                &edge("group#member", "entity:user", EdgeKind::SubjectType),
                &edge("group#member", "group#member", EdgeKind::SubjectType),
            ]
        );
    }

    #[test]
    fn test_permission_edges_are_deduplicated() {
        let graph = graph();
        let edges: Vec<&GraphEdge> = graph.edges_from("document#view").collect();
        assert_eq!(
            edges,
            vec![
                &edge("document#view", "document#owner", EdgeKind::PermissionReferences),
                &edge("document#view", "document#parent", EdgeKind::ChainThrough),
                &edge("document#view", "folder#view", EdgeKind::ChainTarget),
            ]
        );
    }

    #[test]
    fn test_graph_serializes_with_kebab_case_kinds() {
        let json = serde_json::to_value(graph()).unwrap();
        assert_eq!(json["nodes"][0]["kind"], "entity");
        assert_eq!(json["edges"][0]["kind"], "relation-of");
    }

    #[test]
    fn test_build_is_deterministic() {
        assert_eq!(graph(), graph());
    }
}
