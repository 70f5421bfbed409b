//! Helpers shared by the unit tests.

use crate::authoring::{dto_to_model, parse_process_yaml};
use crate::engine_data::EngineData;
use crate::model::NodeId;
use crate::node_instance::NodeInstance;
use crate::process_instance::ProcessInstanceBuilder;
use crate::types::*;
use std::sync::Arc;

/// Register `yaml` and start one instance of it.
pub(crate) fn started_process(yaml: &str) -> (EngineData, ProcessInstanceHandle) {
    let mut data = EngineData::default();
    let dto = parse_process_yaml(yaml).unwrap();
    let model = dto_to_model(&dto, data.models()).unwrap();
    let model = data.register_model(model);
    let name = model.name().to_string();
    let handle = data.create_process_instance(model, name, Principal::new("bob"), None, vec![]);
    ProcessInstanceBuilder::new(&mut data, handle).start().unwrap();
    (data, handle)
}

/// The live instance of `node` at entry 1.
pub(crate) fn child(owner: &ProcessInstanceBuilder<'_>, node: &str) -> Arc<NodeInstance> {
    owner
        .get_child_node_instance(&NodeId::new(node), 1)
        .unwrap()
        .unwrap_or_else(|| panic!("no instance of {node}"))
}
