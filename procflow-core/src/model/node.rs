use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{ConditionResult, ProcessData};

/// Identifier of a node definition, unique within one model.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ─── Node kinds ───────────────────────────────────────────────

/// Message sent by a message activity when its task is provided.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub service: String,
    pub operation: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivitySpec {
    /// Delivered through the message service; the activity then waits for an
    /// external take/finish.
    #[serde(default)]
    pub message: Option<MessageTemplate>,
    /// Named action from the `ActionRegistry`, run when the task starts.
    #[serde(default)]
    pub action: Option<String>,
    /// Requires a human to take and start the task.
    #[serde(default)]
    pub manual: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompositeSpec {
    /// Name of the registered model run as the child process.
    pub child_model: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Start,
    Activity(ActivitySpec),
    Composite(CompositeSpec),
    Split {
        min: usize,
        max: usize,
    },
    Join {
        min: usize,
        max: usize,
        multi_merge: bool,
    },
    End,
    Event {
        throwing: bool,
    },
}

// ─── Conditions ───────────────────────────────────────────────

/// Branch condition attached to a node, keyed by the predecessor it guards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Always,
    Never,
    /// Fires only when no sibling branch of the split fires.
    Otherwise,
    /// Undecided until re-evaluated.
    Await,
    /// Compares a result of the latest finished instance of `node`.
    ResultEquals {
        node: NodeId,
        result: String,
        value: serde_json::Value,
    },
}

impl Condition {
    pub fn is_otherwise(&self) -> bool {
        matches!(self, Condition::Otherwise)
    }

    /// Evaluate against the results of `node`'s latest instance, as supplied by
    /// `lookup`: `None` while that instance has not finished, `Some(None)` when
    /// it finished without completing.
    pub fn eval<'a>(
        &self,
        lookup: impl Fn(&NodeId) -> Option<Option<&'a [ProcessData]>>,
    ) -> ConditionResult {
        match self {
            Condition::Always => ConditionResult::True,
            Condition::Never => ConditionResult::Never,
            Condition::Otherwise | Condition::Await => ConditionResult::Maybe,
            Condition::ResultEquals {
                node,
                result,
                value,
            } => match lookup(node) {
                None => ConditionResult::Maybe,
                Some(None) => ConditionResult::Never,
                Some(Some(results)) => {
                    if results
                        .iter()
                        .any(|data| &data.name == result && &data.value == value)
                    {
                        ConditionResult::True
                    } else {
                        ConditionResult::Never
                    }
                }
            },
        }
    }
}

// ─── Data specs ───────────────────────────────────────────────

/// Extracts one named result from a finish payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultSpec {
    pub name: String,
    /// JSON pointer into the payload; the whole payload when absent.
    #[serde(default)]
    pub path: Option<String>,
}

impl ResultSpec {
    pub fn apply(&self, payload: &serde_json::Value) -> Option<ProcessData> {
        let value = match &self.path {
            Some(pointer) => payload.pointer(pointer)?.clone(),
            None => payload.clone(),
        };
        Some(ProcessData::new(self.name.clone(), value))
    }
}

/// Imports a result produced by another node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefineSpec {
    pub name: String,
    pub node: NodeId,
    pub result: String,
    #[serde(default)]
    pub path: Option<String>,
}

impl DefineSpec {
    pub fn apply(&self, results: &[ProcessData]) -> Option<ProcessData> {
        let source = results.iter().find(|data| data.name == self.result)?;
        let value = match &self.path {
            Some(pointer) => source.value.pointer(pointer)?.clone(),
            None => source.value.clone(),
        };
        Some(ProcessData::new(self.name.clone(), value))
    }
}

// ─── Node definition ──────────────────────────────────────────

/// Immutable node of a process model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutableProcessNode {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default)]
    pub predecessors: Vec<NodeId>,
    #[serde(default)]
    pub successors: Vec<NodeId>,
    #[serde(default)]
    pub conditions: BTreeMap<NodeId, Condition>,
    #[serde(default)]
    pub results: Vec<ResultSpec>,
    #[serde(default)]
    pub defines: Vec<DefineSpec>,
    #[serde(default)]
    pub multi_instance: bool,
}

impl ExecutableProcessNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: NodeId::new(id),
            kind,
            predecessors: Vec::new(),
            successors: Vec::new(),
            conditions: BTreeMap::new(),
            results: Vec::new(),
            defines: Vec::new(),
            multi_instance: false,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self.kind, NodeKind::Start)
    }

    pub fn is_end(&self) -> bool {
        matches!(self.kind, NodeKind::End)
    }

    pub fn is_split(&self) -> bool {
        matches!(self.kind, NodeKind::Split { .. })
    }

    pub fn is_join(&self) -> bool {
        matches!(self.kind, NodeKind::Join { .. })
    }

    pub fn is_multi_instance(&self) -> bool {
        self.multi_instance
    }

    pub fn is_multi_merge(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::Join {
                multi_merge: true,
                ..
            }
        )
    }

    /// `(min, max)` for splits and joins.
    pub fn fan_bounds(&self) -> Option<(usize, usize)> {
        match self.kind {
            NodeKind::Split { min, max } | NodeKind::Join { min, max, .. } => Some((min, max)),
            _ => None,
        }
    }

    pub fn condition_for(&self, predecessor: &NodeId) -> Option<&Condition> {
        self.conditions.get(predecessor)
    }

    pub fn message(&self) -> Option<&MessageTemplate> {
        match &self.kind {
            NodeKind::Activity(spec) => spec.message.as_ref(),
            _ => None,
        }
    }

    /// Whether a provided task may be taken without an external actor.
    pub fn can_provide_task_auto_progress(&self) -> bool {
        match &self.kind {
            NodeKind::Activity(spec) => spec.message.is_none() && !spec.manual,
            NodeKind::Event { throwing } => *throwing,
            _ => true,
        }
    }

    /// Whether a taken task may be started right away.
    pub fn can_take_task_auto_progress(&self) -> bool {
        match &self.kind {
            NodeKind::Activity(spec) => !spec.manual,
            _ => true,
        }
    }

    /// Whether a started task may finish on its own.
    pub fn can_start_task_auto_progress(&self) -> bool {
        match &self.kind {
            NodeKind::Activity(spec) => !spec.manual,
            _ => true,
        }
    }

    /// Results declared by this node, applied to a finish payload.
    pub fn apply_results(&self, payload: Option<&serde_json::Value>) -> Vec<ProcessData> {
        let Some(payload) = payload else {
            return Vec::new();
        };
        if self.results.is_empty() {
            return Vec::new();
        }
        self.results
            .iter()
            .filter_map(|spec| spec.apply(payload))
            .collect()
    }
}
