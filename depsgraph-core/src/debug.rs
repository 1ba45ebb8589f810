//! Debug export.
//!
//! A detached snapshot of the graph for visualization tools, as JSON or as
//! Graphviz DOT. Inactive relations are included with their status so a
//! viewer can show what cycle resolution and reduction took out.

use std::fmt::Write;

use serde::Serialize;

use crate::graph::{
    ComponentKind, Graph, OperationCode, OperationId, OperationState, RelationKind, RelationStatus,
};
use crate::scene::EntityId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugNode {
    pub id: OperationId,
    pub entity: Option<EntityId>,
    pub name: String,
    pub component: Option<ComponentKind>,
    pub operation: OperationCode,
    pub state: OperationState,
    pub rank: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugRelation {
    pub from: OperationId,
    pub to: OperationId,
    pub kind: RelationKind,
    pub name: String,
    pub status: RelationStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugGraph {
    pub nodes: Vec<DebugNode>,
    pub relations: Vec<DebugRelation>,
}

impl DebugGraph {
    pub fn from_graph(graph: &Graph) -> Self {
        let nodes = graph
            .operations()
            .map(|op| DebugNode {
                id: op.id(),
                entity: op.entity(),
                name: graph.entity_name(op.id()),
                component: op.component_kind(),
                operation: op.code().clone(),
                state: op.state(),
                rank: op.rank(),
            })
            .collect();
        let relations = graph
            .relations()
            .iter()
            .map(|relation| DebugRelation {
                from: relation.from(),
                to: relation.to(),
                kind: relation.kind(),
                name: relation.name().to_string(),
                status: relation.status(),
            })
            .collect();
        Self { nodes, relations }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Graphviz rendering, one cluster per entity.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph depsgraph {\n  rankdir=LR;\n  node [shape=box];\n");

        let mut entities: Vec<Option<EntityId>> = self.nodes.iter().map(|node| node.entity).collect();
        entities.sort();
        entities.dedup();

        for entity in entities {
            let members = self.nodes.iter().filter(|node| node.entity == entity);
            match entity {
                Some(id) => {
                    let _ = writeln!(out, "  subgraph cluster_{} {{", id.raw());
                    let label = self
                        .nodes
                        .iter()
                        .find(|node| node.entity == entity)
                        .map_or_else(|| id.to_string(), |node| node.name.clone());
                    let _ = writeln!(out, "    label=\"{}\";", escape(&label));
                    for node in members {
                        let _ = writeln!(out, "    {};", node_line(node));
                    }
                    out.push_str("  }\n");
                }
                None => {
                    for node in members {
                        let _ = writeln!(out, "  {};", node_line(node));
                    }
                }
            }
        }

        for relation in &self.relations {
            let style = match relation.status {
                RelationStatus::Active => "style=solid",
                RelationStatus::Cyclic => "style=bold, color=red",
                RelationStatus::Reduced => "style=dotted",
            };
            let _ = writeln!(
                out,
                "  {} -> {} [label=\"{}\", {style}];",
                relation.from.index(),
                relation.to.index(),
                escape(&format!("{}: {}", relation.kind, relation.name)),
            );
        }

        out.push_str("}\n");
        out
    }
}

fn node_line(node: &DebugNode) -> String {
    let label = match node.component {
        Some(component) => format!("{component}\\n{}", escape(&node.operation.to_string())),
        None => escape(&node.operation.to_string()),
    };
    format!("{} [label=\"{}\"]", node.id.index(), label)
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{build_graph, BuildMode};
    use crate::config::DepsgraphConfig;
    use crate::eval::NoopBinder;
    use crate::scene::{Entity, Scene};

    fn graph() -> Graph {
        let mut scene = Scene::new();
        let a = scene.add(Entity::object("A"));
        scene.add(Entity::object("B").with_parent(a));
        build_graph(&scene, &BuildMode::AllObjects, &NoopBinder, &DepsgraphConfig::default()).graph
    }

    #[test]
    fn export_covers_every_node_and_relation() {
        let graph = graph();
        let export = DebugGraph::from_graph(&graph);
        assert_eq!(export.nodes.len(), graph.stats().operations);
        assert_eq!(export.relations.len(), graph.relations().iter().count());
        assert!(export
            .nodes
            .iter()
            .any(|node| node.name == "B" && node.operation == OperationCode::TransformParent));
    }

    #[test]
    fn json_and_dot() {
        let export = DebugGraph::from_graph(&graph());
        let json = export.to_json().expect("serializable");
        assert!(json.contains("\"TransformParent\""));

        let dot = export.to_dot();
        assert!(dot.starts_with("digraph depsgraph {"));
        assert!(dot.contains("label=\"A\";"));
        assert!(dot.contains("Object Parent"));
    }
}
