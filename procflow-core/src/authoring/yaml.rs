use super::dto::ProcessModelDto;
use anyhow::{Context, Result};

/// Parse a YAML string into a ProcessModelDto.
///
/// Validation is NOT performed here; `dto_to_model()` validates before it
/// builds.
pub fn parse_process_yaml(yaml_str: &str) -> Result<ProcessModelDto> {
    serde_yaml::from_str(yaml_str).context("Parsing process model YAML")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authoring::dto::*;
    use crate::model::Condition;

    #[test]
    fn test_basic_yaml_parse() {
        let yaml = r#"
id: onboarding
meta:
  name: Client onboarding
  version: "2"
nodes:
  - kind: Start
    id: start
  - kind: Activity
    id: collect
    message:
      service: documents
      operation: request
      body: { kind: passport }
    results:
      - name: passport
        path: /document
  - kind: End
    id: end
edges:
  - from: start
    to: collect
  - from: collect
    to: end
exports:
  - name: passport
    node: collect
    result: passport
"#;
        let dto = parse_process_yaml(yaml).unwrap();
        assert_eq!(dto.id, "onboarding");
        assert_eq!(dto.meta.as_ref().map(|m| m.name.as_str()), Some("Client onboarding"));
        assert_eq!(dto.nodes.len(), 3);
        assert_eq!(dto.edges.len(), 2);
        assert_eq!(dto.exports.len(), 1);

        let NodeDto::Activity { message, results, .. } = &dto.nodes[1] else {
            panic!("Expected Activity, got {:?}", dto.nodes[1]);
        };
        assert_eq!(message.as_ref().unwrap().operation, "request");
        assert_eq!(results[0].path.as_deref(), Some("/document"));
    }

    #[test]
    fn test_yaml_with_conditions() {
        let yaml = r#"
id: approval
nodes:
  - kind: Start
    id: start
  - kind: Activity
    id: review
    manual: true
    results:
      - name: approved
  - kind: Split
    id: route
    max: 1
  - kind: Activity
    id: publish
  - kind: Activity
    id: archive
  - kind: End
    id: end
edges:
  - from: start
    to: review
  - from: review
    to: route
  - from: route
    to: publish
    condition:
      result_equals:
        node: review
        result: approved
        value: true
  - from: route
    to: archive
    is_default: true
"#;
        let dto = parse_process_yaml(yaml).unwrap();
        let NodeDto::Split { min, max, .. } = &dto.nodes[2] else {
            panic!("Expected Split");
        };
        assert_eq!((*min, *max), (1, Some(1)));
        assert!(matches!(
            dto.edges[2].condition,
            Some(Condition::ResultEquals { .. })
        ));
        assert!(dto.edges[3].is_default);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let yaml = r#"
id: bad
nodes:
  - kind: Teleport
    id: t
edges: []
"#;
        let err = parse_process_yaml(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("Parsing process model YAML"));
    }
}
