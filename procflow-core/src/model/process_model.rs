use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::node::{DefineSpec, ExecutableProcessNode, NodeId, NodeKind};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct ModelError {
    pub rule: &'static str,
    pub message: String,
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

/// Immutable, validated process graph.
#[derive(Debug)]
pub struct ExecutableProcessModel {
    name: String,
    order: Vec<NodeId>,
    nodes: BTreeMap<NodeId, Arc<ExecutableProcessNode>>,
    exports: Vec<DefineSpec>,
    graph: DiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
}

impl ExecutableProcessModel {
    /// Build and validate a model. Every violated rule is reported in the error.
    pub fn new(
        name: impl Into<String>,
        nodes: Vec<ExecutableProcessNode>,
        exports: Vec<DefineSpec>,
    ) -> Result<Self> {
        let name = name.into();
        let mut errors = Vec::new();
        let mut order = Vec::new();
        let mut by_id = BTreeMap::new();

        // M1: unique ids
        for node in nodes {
            if by_id.contains_key(&node.id) {
                errors.push(ModelError {
                    rule: "M1",
                    message: format!("duplicate node id {}", node.id),
                });
                continue;
            }
            order.push(node.id.clone());
            by_id.insert(node.id.clone(), Arc::new(node));
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for id in &order {
            index.insert(id.clone(), graph.add_node(id.clone()));
        }

        // M2: links resolve and are symmetric
        for id in &order {
            let node = &by_id[id];
            for succ in &node.successors {
                match by_id.get(succ) {
                    Some(target) if target.predecessors.contains(id) => {
                        graph.add_edge(index[id], index[succ], ());
                    }
                    Some(_) => errors.push(ModelError {
                        rule: "M2",
                        message: format!("{succ} does not list {id} as predecessor"),
                    }),
                    None => errors.push(ModelError {
                        rule: "M2",
                        message: format!("{id} links to unknown node {succ}"),
                    }),
                }
            }
            for pred in &node.predecessors {
                if !by_id.contains_key(pred) {
                    errors.push(ModelError {
                        rule: "M2",
                        message: format!("{id} links to unknown node {pred}"),
                    });
                }
            }
        }

        let model = Self {
            name,
            order,
            nodes: by_id,
            exports,
            graph,
            index,
        };
        model.check_structure(&mut errors);

        if errors.is_empty() {
            Ok(model)
        } else {
            let msgs: Vec<String> = errors.iter().map(ModelError::to_string).collect();
            Err(EngineError::InvalidModel(format!(
                "{}: {}",
                model.name,
                msgs.join("; ")
            )))
        }
    }

    fn check_structure(&self, errors: &mut Vec<ModelError>) {
        // M3: at least one start and one end
        if self.start_nodes().next().is_none() {
            errors.push(ModelError {
                rule: "M3",
                message: "no start node".to_string(),
            });
        }
        if !self.nodes.values().any(|n| n.is_end()) {
            errors.push(ModelError {
                rule: "M3",
                message: "no end node".to_string(),
            });
        }

        for node in self.nodes() {
            let id = &node.id;
            // M4: start/end boundaries
            if node.is_start() && !node.predecessors.is_empty() {
                errors.push(ModelError {
                    rule: "M4",
                    message: format!("start node {id} has predecessors"),
                });
            }
            if node.is_end() && !node.successors.is_empty() {
                errors.push(ModelError {
                    rule: "M4",
                    message: format!("end node {id} has successors"),
                });
            }
            // M5: only joins merge
            if !node.is_join() && node.predecessors.len() > 1 {
                errors.push(ModelError {
                    rule: "M5",
                    message: format!("{id} has {} predecessors but is not a join", node.predecessors.len()),
                });
            }
            // M6: only splits fork
            if !node.is_split() && node.successors.len() > 1 {
                errors.push(ModelError {
                    rule: "M6",
                    message: format!("{id} has {} successors but is not a split", node.successors.len()),
                });
            }
            // M7: fan bounds
            if let Some((min, max)) = node.fan_bounds() {
                let fan = match node.kind {
                    NodeKind::Split { .. } => node.successors.len(),
                    _ => node.predecessors.len(),
                };
                if min > max || max > fan {
                    errors.push(ModelError {
                        rule: "M7",
                        message: format!("{id}: bounds {min}..{max} do not fit fan of {fan}"),
                    });
                }
            }
            // M9: conditions guard real predecessors
            for pred in node.conditions.keys() {
                if !node.predecessors.contains(pred) {
                    errors.push(ModelError {
                        rule: "M9",
                        message: format!("{id} has a condition for non-predecessor {pred}"),
                    });
                }
            }
        }

        // M8: everything reachable from a start node
        for node in self.nodes() {
            let reachable = self
                .start_nodes()
                .any(|start| self.can_reach(&start.id, &node.id));
            if !reachable {
                errors.push(ModelError {
                    rule: "M8",
                    message: format!("{} is unreachable", node.id),
                });
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self, id: &NodeId) -> Option<&Arc<ExecutableProcessNode>> {
        self.nodes.get(id)
    }

    pub fn require_node(&self, id: &NodeId) -> Result<&Arc<ExecutableProcessNode>> {
        self.nodes.get(id).ok_or_else(|| EngineError::UnknownNode {
            model: self.name.clone(),
            node: id.to_string(),
        })
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<ExecutableProcessNode>> {
        self.order.iter().map(move |id| &self.nodes[id])
    }

    pub fn start_nodes(&self) -> impl Iterator<Item = &Arc<ExecutableProcessNode>> {
        self.nodes().filter(|n| n.is_start())
    }

    pub fn exports(&self) -> &[DefineSpec] {
        &self.exports
    }

    /// Whether a path leads from `from` to `to` (a node reaches itself).
    pub fn can_reach(&self, from: &NodeId, to: &NodeId) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => has_path_connecting(&self.graph, a, b, None),
            _ => false,
        }
    }

    /// Every node from which `target` can be reached, `target` excluded.
    pub fn ancestors_of(&self, target: &NodeId) -> Vec<NodeId> {
        let Some(&start) = self.index.get(target) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, start);
        let mut found = Vec::new();
        while let Some(ix) = bfs.next(reversed) {
            if ix != start {
                found.push(self.graph[ix].clone());
            }
        }
        found
    }

    /// SHA-256 over the deterministic JSON form of the model.
    pub fn version_hash(&self) -> [u8; 32] {
        let nodes: Vec<&ExecutableProcessNode> = self.nodes.values().map(Arc::as_ref).collect();
        let doc = serde_json::json!({
            "name": self.name,
            "nodes": nodes,
            "exports": self.exports,
        });
        let mut hasher = Sha256::new();
        hasher.update(doc.to_string().as_bytes());
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::node::ActivitySpec;

    fn link(nodes: &mut [ExecutableProcessNode], from: &str, to: &str) {
        for node in nodes.iter_mut() {
            if node.id.as_str() == from {
                node.successors.push(NodeId::new(to));
            }
            if node.id.as_str() == to {
                node.predecessors.push(NodeId::new(from));
            }
        }
    }

    fn linear() -> Vec<ExecutableProcessNode> {
        let mut nodes = vec![
            ExecutableProcessNode::new("start", NodeKind::Start),
            ExecutableProcessNode::new("a", NodeKind::Activity(ActivitySpec::default())),
            ExecutableProcessNode::new("end", NodeKind::End),
        ];
        link(&mut nodes, "start", "a");
        link(&mut nodes, "a", "end");
        nodes
    }

    #[test]
    fn test_linear_model_is_valid() {
        let model = ExecutableProcessModel::new("linear", linear(), vec![]).unwrap();
        assert_eq!(model.start_nodes().count(), 1);
        assert!(model.can_reach(&"start".into(), &"end".into()));
        assert!(!model.can_reach(&"end".into(), &"start".into()));
        assert_eq!(model.ancestors_of(&"end".into()).len(), 2);
    }

    #[test]
    fn test_unreachable_and_merge_rules() {
        let mut nodes = linear();
        nodes.push(ExecutableProcessNode::new("orphan", NodeKind::Activity(ActivitySpec::default())));
        link(&mut nodes, "orphan", "end");
        let err = ExecutableProcessModel::new("bad", nodes, vec![]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("[M8] orphan is unreachable"), "{msg}");
        assert!(msg.contains("[M5]"), "{msg}");
    }

    #[test]
    fn test_version_hash_is_stable() {
        let a = ExecutableProcessModel::new("linear", linear(), vec![]).unwrap();
        let b = ExecutableProcessModel::new("linear", linear(), vec![]).unwrap();
        assert_eq!(a.version_hash(), b.version_hash());
    }
}
