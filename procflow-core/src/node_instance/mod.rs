//! Node instances: the immutable snapshot, its persisted record, and the
//! copy-on-write builder that drives the lifecycle.

mod builder;
mod join;
mod kinds;
mod lifecycle;
mod split;

pub use builder::NodeInstanceBuilder;
pub use kinds::NodeInstanceKind;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::Result;
use crate::model::{ExecutableProcessModel, ExecutableProcessNode, NodeId};
use crate::types::*;

/// Kind-specific state carried by an instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceBody {
    #[default]
    Plain,
    Composite {
        child: Option<ProcessInstanceHandle>,
    },
}

/// Read-only view shared by stored instances and speculative ones.
pub trait NodeInstanceView {
    fn node(&self) -> &Arc<ExecutableProcessNode>;
    fn entry_no(&self) -> u32;
    fn state(&self) -> NodeInstanceState;
}

/// Immutable snapshot of one stored node instance.
#[derive(Clone, Debug)]
pub struct NodeInstance {
    pub(crate) node: Arc<ExecutableProcessNode>,
    pub(crate) process: ProcessInstanceHandle,
    pub(crate) handle: NodeInstanceHandle,
    pub(crate) predecessors: BTreeSet<NodeInstanceHandle>,
    pub(crate) owner: Principal,
    pub(crate) entry_no: u32,
    pub(crate) state: NodeInstanceState,
    pub(crate) results: Vec<ProcessData>,
    pub(crate) failure_cause: Option<String>,
    pub(crate) body: InstanceBody,
}

impl NodeInstance {
    pub fn node(&self) -> &Arc<ExecutableProcessNode> {
        &self.node
    }

    pub fn process(&self) -> ProcessInstanceHandle {
        self.process
    }

    pub fn handle(&self) -> NodeInstanceHandle {
        self.handle
    }

    pub fn predecessors(&self) -> &BTreeSet<NodeInstanceHandle> {
        &self.predecessors
    }

    pub fn owner(&self) -> &Principal {
        &self.owner
    }

    pub fn entry_no(&self) -> u32 {
        self.entry_no
    }

    pub fn state(&self) -> NodeInstanceState {
        self.state
    }

    pub fn results(&self) -> &[ProcessData] {
        &self.results
    }

    pub fn failure_cause(&self) -> Option<&str> {
        self.failure_cause.as_deref()
    }

    pub fn body(&self) -> &InstanceBody {
        &self.body
    }

    pub fn kind(&self) -> NodeInstanceKind {
        NodeInstanceKind::of(&self.node)
    }

    /// Child process of a composite instance, once created.
    pub fn child_process(&self) -> Option<ProcessInstanceHandle> {
        match self.body {
            InstanceBody::Composite { child } => child,
            InstanceBody::Plain => None,
        }
    }

    pub fn to_record(&self) -> NodeInstanceRecord {
        NodeInstanceRecord {
            handle: self.handle,
            process: self.process,
            node_id: self.node.id.clone(),
            predecessors: self.predecessors.iter().copied().collect(),
            owner: self.owner.clone(),
            entry_no: self.entry_no,
            state: self.state,
            results: self.results.clone(),
            failure_cause: self.failure_cause.clone(),
            body: self.body.clone(),
        }
    }

    /// Rebuild a snapshot, resolving the node id against `model`.
    pub fn from_record(record: NodeInstanceRecord, model: &ExecutableProcessModel) -> Result<Self> {
        let node = model.require_node(&record.node_id)?.clone();
        Ok(Self {
            node,
            process: record.process,
            handle: record.handle,
            predecessors: record.predecessors.into_iter().collect(),
            owner: record.owner,
            entry_no: record.entry_no,
            state: record.state,
            results: record.results,
            failure_cause: record.failure_cause,
            body: record.body,
        })
    }
}

impl NodeInstanceView for NodeInstance {
    fn node(&self) -> &Arc<ExecutableProcessNode> {
        &self.node
    }

    fn entry_no(&self) -> u32 {
        self.entry_no
    }

    fn state(&self) -> NodeInstanceState {
        self.state
    }
}

/// Serialized form written through the `EngineStore`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInstanceRecord {
    pub handle: NodeInstanceHandle,
    pub process: ProcessInstanceHandle,
    pub node_id: NodeId,
    pub predecessors: Vec<NodeInstanceHandle>,
    pub owner: Principal,
    pub entry_no: u32,
    pub state: NodeInstanceState,
    #[serde(default)]
    pub results: Vec<ProcessData>,
    #[serde(default)]
    pub failure_cause: Option<String>,
    #[serde(default)]
    pub body: InstanceBody,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActivitySpec, NodeKind};
    use serde_json::json;

    fn model() -> ExecutableProcessModel {
        let mut start = ExecutableProcessNode::new("start", NodeKind::Start);
        let mut review =
            ExecutableProcessNode::new("review", NodeKind::Activity(ActivitySpec::default()));
        let mut end = ExecutableProcessNode::new("end", NodeKind::End);
        start.successors.push("review".into());
        review.predecessors.push("start".into());
        review.successors.push("end".into());
        end.predecessors.push("review".into());
        ExecutableProcessModel::new("review", vec![start, review, end], vec![]).unwrap()
    }

    #[test]
    fn test_record_round_trip() {
        let model = model();
        let instance = NodeInstance {
            node: model.node(&"review".into()).unwrap().clone(),
            process: ProcessInstanceHandle(3),
            handle: NodeInstanceHandle(7),
            predecessors: [NodeInstanceHandle(5)].into_iter().collect(),
            owner: Principal::new("alice"),
            entry_no: 2,
            state: NodeInstanceState::Complete,
            results: vec![ProcessData::new("approved", json!(true))],
            failure_cause: None,
            body: InstanceBody::Plain,
        };

        let json = serde_json::to_string(&instance.to_record()).unwrap();
        let record: NodeInstanceRecord = serde_json::from_str(&json).unwrap();
        let back = NodeInstance::from_record(record, &model).unwrap();

        assert_eq!(back.node().id.as_str(), "review");
        assert_eq!(back.predecessors(), instance.predecessors());
        assert_eq!(back.state(), NodeInstanceState::Complete);
        assert_eq!(back.results(), instance.results());
        assert_eq!(back.entry_no(), 2);
    }

    #[test]
    fn test_record_with_unknown_node_is_rejected() {
        let model = model();
        let record = NodeInstanceRecord {
            handle: NodeInstanceHandle(0),
            process: ProcessInstanceHandle(0),
            node_id: "ghost".into(),
            predecessors: vec![],
            owner: Principal::new("alice"),
            entry_no: 1,
            state: NodeInstanceState::Pending,
            results: vec![],
            failure_cause: None,
            body: InstanceBody::Plain,
        };
        assert!(NodeInstance::from_record(record, &model).is_err());
    }
}
