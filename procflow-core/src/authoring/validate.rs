use super::dto::*;
use crate::model::Condition;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn error(rule: &str, message: String) -> ValidationError {
    ValidationError {
        rule: rule.to_string(),
        message,
    }
}

/// Validate a ProcessModelDto before model conversion. Returns all errors
/// found. Graph-shape rules (fan-in, fan-out, reachability) are checked again
/// when the executable model is built.
pub fn validate_dto(dto: &ProcessModelDto) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut node_map: HashMap<&str, &NodeDto> = HashMap::new();

    // A1: Node IDs must be unique
    for node in &dto.nodes {
        if node_map.insert(node.id(), node).is_some() {
            errors.push(error("A1", format!("Duplicate node id: {}", node.id())));
        }
    }

    // A2: Edges reference declared nodes
    for edge in &dto.edges {
        for end in [&edge.from, &edge.to] {
            if !node_map.contains_key(end.as_str()) {
                errors.push(error(
                    "A2",
                    format!("Edge {} -> {} references unknown node {}", edge.from, edge.to, end),
                ));
            }
        }
    }

    // A3: No parallel edges
    let mut seen = HashSet::new();
    for edge in &dto.edges {
        if !seen.insert((edge.from.as_str(), edge.to.as_str())) {
            errors.push(error(
                "A3",
                format!("Duplicate edge {} -> {}", edge.from, edge.to),
            ));
        }
    }

    let is_split = |id: &str| matches!(node_map.get(id), Some(NodeDto::Split { .. }));
    let is_join = |id: &str| matches!(node_map.get(id), Some(NodeDto::Join { .. }));

    // A4: A default edge carries no explicit condition and leaves a split
    for edge in dto.edges.iter().filter(|e| e.is_default) {
        if edge.condition.is_some() {
            errors.push(error(
                "A4",
                format!("Edge {} -> {}: has both condition and is_default", edge.from, edge.to),
            ));
        }
        if node_map.contains_key(edge.from.as_str()) && !is_split(&edge.from) {
            errors.push(error(
                "A4",
                format!("Edge {} -> {}: default edge must leave a Split", edge.from, edge.to),
            ));
        }
    }

    // A5: At most one default edge per split
    let mut defaults: HashMap<&str, usize> = HashMap::new();
    for edge in dto.edges.iter().filter(|e| e.is_default) {
        *defaults.entry(edge.from.as_str()).or_default() += 1;
    }
    for (split, count) in defaults {
        if count > 1 {
            errors.push(error(
                "A5",
                format!("Split {split}: at most one default edge, found {count}"),
            ));
        }
    }

    // A6: A split feeding a join directly must say when
    for edge in &dto.edges {
        if is_split(&edge.from) && is_join(&edge.to) && edge.effective_condition().is_none() {
            errors.push(error(
                "A6",
                format!("Edge {} -> {}: split into join needs a condition", edge.from, edge.to),
            ));
        }
    }

    // A7: Result conditions and data specs name declared nodes
    for edge in &dto.edges {
        if let Some(Condition::ResultEquals { node, .. }) = &edge.condition {
            if !node_map.contains_key(node.as_str()) {
                errors.push(error(
                    "A7",
                    format!("Edge {} -> {}: condition reads unknown node {}", edge.from, edge.to, node),
                ));
            }
        }
    }
    let defines = dto
        .nodes
        .iter()
        .flat_map(|n| match n {
            NodeDto::Activity { defines, .. } | NodeDto::Composite { defines, .. } => {
                defines.iter().map(|d| (n.id(), d)).collect::<Vec<_>>()
            }
            _ => Vec::new(),
        })
        .chain(dto.exports.iter().map(|d| (dto.id.as_str(), d)));
    for (owner, define) in defines {
        if !node_map.contains_key(define.node.as_str()) {
            errors.push(error(
                "A7",
                format!("{owner}: define {} reads unknown node {}", define.name, define.node),
            ));
        }
    }

    // A8: Bounds are positive
    for node in &dto.nodes {
        match node {
            NodeDto::Split { id, min, max } | NodeDto::Join { id, min, max, .. } => {
                if *min == 0 || *max == Some(0) {
                    errors.push(error(
                        "A8",
                        format!("{} {}: min and max must be at least 1", node.kind_name(), id),
                    ));
                }
            }
            _ => {}
        }
    }

    // A9: Composite names a child model
    for node in &dto.nodes {
        if let NodeDto::Composite { id, child_model, .. } = node {
            if child_model.trim().is_empty() {
                errors.push(error("A9", format!("Composite {id}: child_model is empty")));
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeId;

    fn split_dto() -> ProcessModelDto {
        ProcessModelDto {
            id: "review".to_string(),
            meta: None,
            nodes: vec![
                NodeDto::Start { id: "start".into() },
                NodeDto::Split {
                    id: "split".into(),
                    min: 1,
                    max: None,
                },
                NodeDto::activity("a"),
                NodeDto::activity("b"),
                NodeDto::Join {
                    id: "join".into(),
                    min: 1,
                    max: None,
                    multi_merge: false,
                },
                NodeDto::End { id: "end".into() },
            ],
            edges: vec![
                EdgeDto::new("start", "split"),
                EdgeDto::new("split", "a").when(Condition::Always),
                EdgeDto::new("split", "b").when(Condition::Await),
                EdgeDto::new("a", "join").when(Condition::Always),
                EdgeDto::new("b", "join").when(Condition::Always),
                EdgeDto::new("join", "end"),
            ],
            exports: vec![],
        }
    }

    #[test]
    fn test_valid_split_passes() {
        let errors = validate_dto(&split_dto());
        assert!(errors.is_empty(), "Expected no errors, got: {:?}", errors);
    }

    #[test]
    fn test_duplicate_id_and_unknown_edge() {
        let mut dto = split_dto();
        dto.nodes.push(NodeDto::activity("a"));
        dto.edges.push(EdgeDto::new("a", "nowhere"));
        let errors = validate_dto(&dto);
        assert!(errors.iter().any(|e| e.rule == "A1"));
        assert!(errors
            .iter()
            .any(|e| e.rule == "A2" && e.message.contains("nowhere")));
    }

    #[test]
    fn test_default_edge_rules() {
        let mut dto = split_dto();
        dto.edges[1].is_default = true;
        dto.edges[2].is_default = true;
        dto.edges[2].condition = None;
        dto.edges[5].is_default = true;
        let errors = validate_dto(&dto);
        // condition + default on split -> a, default leaving a join
        assert_eq!(errors.iter().filter(|e| e.rule == "A4").count(), 2);
        assert!(errors.iter().any(|e| e.rule == "A5"));
    }

    #[test]
    fn test_split_into_join_needs_condition() {
        let mut dto = split_dto();
        dto.edges.push(EdgeDto::new("split", "join"));
        let errors = validate_dto(&dto);
        assert!(errors.iter().any(|e| e.rule == "A6"), "{errors:?}");
    }

    #[test]
    fn test_condition_reads_unknown_node() {
        let mut dto = split_dto();
        dto.edges[2].condition = Some(Condition::ResultEquals {
            node: NodeId::new("ghost"),
            result: "ok".into(),
            value: serde_json::json!(true),
        });
        let errors = validate_dto(&dto);
        assert!(errors.iter().any(|e| e.rule == "A7"));
    }

    #[test]
    fn test_zero_bounds_rejected() {
        let mut dto = split_dto();
        dto.nodes[1] = NodeDto::Split {
            id: "split".into(),
            min: 0,
            max: Some(2),
        };
        let errors = validate_dto(&dto);
        assert!(errors.iter().any(|e| e.rule == "A8"));
    }
}
