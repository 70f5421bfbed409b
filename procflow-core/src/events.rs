use crate::model::NodeId;
use crate::types::*;
use serde::{Deserialize, Serialize};

/// Engine events: the audit trail of everything that happened to node and
/// process instances, in commit order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    ProcessCreated {
        process: ProcessInstanceHandle,
        model: String,
        parent: Option<NodeInstanceHandle>,
    },
    ProcessStateChanged {
        process: ProcessInstanceHandle,
        from: ProcessInstanceState,
        to: ProcessInstanceState,
    },
    NodeInstanceCreated {
        process: ProcessInstanceHandle,
        handle: NodeInstanceHandle,
        node: NodeId,
        entry_no: u32,
    },
    NodeStateChanged {
        handle: NodeInstanceHandle,
        node: NodeId,
        entry_no: u32,
        from: NodeInstanceState,
        to: NodeInstanceState,
    },
    MessageSent {
        handle: NodeInstanceHandle,
        service: String,
        operation: String,
        delivery: String,
    },
    TickleQueued {
        handle: NodeInstanceHandle,
    },
    Committed {
        node_instances: usize,
        process_instances: usize,
    },
}
