use super::dto::*;
use super::validate::validate_dto;
use crate::model::*;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Convert a ProcessModelDto into an executable model.
///
/// Composite nodes must name a model already present in `known`; a model
/// cannot contain itself.
pub fn dto_to_model(
    dto: &ProcessModelDto,
    known: &BTreeMap<String, Arc<ExecutableProcessModel>>,
) -> Result<ExecutableProcessModel> {
    // 1. Validate
    let errors = validate_dto(dto);
    if !errors.is_empty() {
        let msgs: Vec<String> = errors.iter().map(ToString::to_string).collect();
        return Err(anyhow!("DTO validation failed:\n{}", msgs.join("\n")));
    }

    let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
    let mut outgoing: BTreeMap<&str, usize> = BTreeMap::new();
    for edge in &dto.edges {
        *outgoing.entry(edge.from.as_str()).or_default() += 1;
        *incoming.entry(edge.to.as_str()).or_default() += 1;
    }

    // 2. Create nodes
    let mut nodes = Vec::with_capacity(dto.nodes.len());
    let mut position: BTreeMap<String, usize> = BTreeMap::new();
    for node in &dto.nodes {
        let id = node.id();
        let built = match node {
            NodeDto::Start { .. } => ExecutableProcessNode::new(id, NodeKind::Start),
            NodeDto::End { .. } => ExecutableProcessNode::new(id, NodeKind::End),
            NodeDto::Activity {
                message,
                action,
                manual,
                results,
                defines,
                multi_instance,
                ..
            } => {
                let mut built = ExecutableProcessNode::new(
                    id,
                    NodeKind::Activity(ActivitySpec {
                        message: message.clone(),
                        action: action.clone(),
                        manual: *manual,
                    }),
                );
                built.results = results.clone();
                built.defines = defines.clone();
                built.multi_instance = *multi_instance;
                built
            }
            NodeDto::Composite {
                child_model,
                results,
                defines,
                ..
            } => {
                if child_model == &dto.id || !known.contains_key(child_model) {
                    return Err(anyhow!(
                        "Composite {id}: child model {child_model} is not registered"
                    ));
                }
                let mut built = ExecutableProcessNode::new(
                    id,
                    NodeKind::Composite(CompositeSpec {
                        child_model: child_model.clone(),
                    }),
                );
                built.results = results.clone();
                built.defines = defines.clone();
                built
            }
            NodeDto::Split { min, max, .. } => ExecutableProcessNode::new(
                id,
                NodeKind::Split {
                    min: *min,
                    max: max.unwrap_or_else(|| outgoing.get(id).copied().unwrap_or(0)),
                },
            ),
            NodeDto::Join {
                min,
                max,
                multi_merge,
                ..
            } => ExecutableProcessNode::new(
                id,
                NodeKind::Join {
                    min: *min,
                    max: max.unwrap_or_else(|| incoming.get(id).copied().unwrap_or(0)),
                    multi_merge: *multi_merge,
                },
            ),
            NodeDto::Event { throwing, .. } => {
                ExecutableProcessNode::new(id, NodeKind::Event { throwing: *throwing })
            }
        };
        position.insert(id.to_string(), nodes.len());
        nodes.push(built);
    }

    // 3. Link edges; conditions live on the target, keyed by source
    for edge in &dto.edges {
        let from = position[&edge.from];
        let to = position[&edge.to];
        nodes[from].successors.push(NodeId::new(&edge.to));
        nodes[to].predecessors.push(NodeId::new(&edge.from));
        if let Some(condition) = edge.effective_condition() {
            nodes[to]
                .conditions
                .insert(NodeId::new(&edge.from), condition);
        }
    }

    ExecutableProcessModel::new(dto.id.clone(), nodes, dto.exports.clone())
        .with_context(|| format!("Building model {}", dto.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authoring::parse_process_yaml;

    const REVIEW: &str = r#"
id: review
nodes:
  - kind: Start
    id: start
  - kind: Split
    id: split
  - kind: Activity
    id: legal
    manual: true
  - kind: Activity
    id: finance
  - kind: Join
    id: join
    min: 2
  - kind: End
    id: end
edges:
  - from: start
    to: split
  - from: split
    to: legal
    condition: always
  - from: split
    to: finance
    is_default: true
  - from: legal
    to: join
    condition: always
  - from: finance
    to: join
    condition: always
  - from: join
    to: end
"#;

    #[test]
    fn test_yaml_to_model() {
        let dto = parse_process_yaml(REVIEW).unwrap();
        let model = dto_to_model(&dto, &BTreeMap::new()).unwrap();
        assert_eq!(model.name(), "review");

        let split = model.require_node(&"split".into()).unwrap();
        assert_eq!(split.fan_bounds(), Some((1, 2)));
        assert_eq!(split.successors, vec![NodeId::new("legal"), NodeId::new("finance")]);

        let finance = model.require_node(&"finance".into()).unwrap();
        assert_eq!(finance.condition_for(&"split".into()), Some(&Condition::Otherwise));

        let join = model.require_node(&"join".into()).unwrap();
        assert_eq!(join.fan_bounds(), Some((2, 2)));
        assert!(model.can_reach(&"start".into(), &"end".into()));
    }

    #[test]
    fn test_validation_errors_are_collected() {
        let mut dto = parse_process_yaml(REVIEW).unwrap();
        dto.nodes.push(NodeDto::activity("legal"));
        dto.edges.push(EdgeDto::new("legal", "ghost"));
        let err = dto_to_model(&dto, &BTreeMap::new()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("DTO validation failed"), "{msg}");
        assert!(msg.contains("[A1]") && msg.contains("[A2]"), "{msg}");
    }

    #[test]
    fn test_model_rules_surface_with_context() {
        let mut dto = parse_process_yaml(REVIEW).unwrap();
        dto.nodes.push(NodeDto::activity("orphan"));
        let err = dto_to_model(&dto, &BTreeMap::new()).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("Building model review"), "{msg}");
        assert!(msg.contains("orphan is unreachable"), "{msg}");
    }

    #[test]
    fn test_composite_requires_known_child() {
        let yaml = r#"
id: parent
nodes:
  - kind: Start
    id: start
  - kind: Composite
    id: sub
    child_model: review
  - kind: End
    id: end
edges:
  - from: start
    to: sub
  - from: sub
    to: end
"#;
        let dto = parse_process_yaml(yaml).unwrap();
        let err = dto_to_model(&dto, &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("child model review is not registered"));

        let child = dto_to_model(&parse_process_yaml(REVIEW).unwrap(), &BTreeMap::new()).unwrap();
        let known = BTreeMap::from([("review".to_string(), Arc::new(child))]);
        let parent = dto_to_model(&dto, &known).unwrap();
        assert!(parent.require_node(&"sub".into()).is_ok());
    }
}
