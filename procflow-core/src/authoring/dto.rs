use serde::{Deserialize, Serialize};

use crate::model::{Condition, DefineSpec, MessageTemplate, ResultSpec};

// ── Helper defaults for serde ──

fn default_one() -> usize {
    1
}

fn is_false(v: &bool) -> bool {
    !v
}

// ── Top-level DTO ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessModelDto {
    pub id: String,
    #[serde(default)]
    pub meta: Option<ModelMeta>,
    pub nodes: Vec<NodeDto>,
    pub edges: Vec<EdgeDto>,
    /// Process outputs, read from the results of finished nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exports: Vec<DefineSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMeta {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

// ── Edge ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDto {
    pub from: String,
    pub to: String,
    /// Unit conditions are plain strings (`always`); `result_equals` is a
    /// single-key map.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_yaml::with::singleton_map_recursive"
    )]
    pub condition: Option<Condition>,
    /// Shorthand for `condition: otherwise`.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_default: bool,
}

impl EdgeDto {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
            is_default: false,
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// The condition this edge contributes to its target, if any.
    pub fn effective_condition(&self) -> Option<Condition> {
        if self.is_default {
            Some(Condition::Otherwise)
        } else {
            self.condition.clone()
        }
    }
}

// ── Node (tagged enum) ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeDto {
    Start {
        id: String,
    },
    End {
        id: String,
    },
    Activity {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<MessageTemplate>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        manual: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        results: Vec<ResultSpec>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        defines: Vec<DefineSpec>,
        #[serde(default, skip_serializing_if = "is_false")]
        multi_instance: bool,
    },
    Composite {
        id: String,
        child_model: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        results: Vec<ResultSpec>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        defines: Vec<DefineSpec>,
    },
    Split {
        id: String,
        #[serde(default = "default_one")]
        min: usize,
        /// Defaults to the number of outgoing edges.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<usize>,
    },
    Join {
        id: String,
        #[serde(default = "default_one")]
        min: usize,
        /// Defaults to the number of incoming edges.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<usize>,
        #[serde(default, skip_serializing_if = "is_false")]
        multi_merge: bool,
    },
    Event {
        id: String,
        #[serde(default, skip_serializing_if = "is_false")]
        throwing: bool,
    },
}

impl NodeDto {
    pub fn id(&self) -> &str {
        match self {
            NodeDto::Start { id }
            | NodeDto::End { id }
            | NodeDto::Activity { id, .. }
            | NodeDto::Composite { id, .. }
            | NodeDto::Split { id, .. }
            | NodeDto::Join { id, .. }
            | NodeDto::Event { id, .. } => id,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeDto::Start { .. } => "Start",
            NodeDto::End { .. } => "End",
            NodeDto::Activity { .. } => "Activity",
            NodeDto::Composite { .. } => "Composite",
            NodeDto::Split { .. } => "Split",
            NodeDto::Join { .. } => "Join",
            NodeDto::Event { .. } => "Event",
        }
    }

    pub fn activity(id: impl Into<String>) -> Self {
        NodeDto::Activity {
            id: id.into(),
            message: None,
            action: None,
            manual: false,
            results: Vec::new(),
            defines: Vec::new(),
            multi_instance: false,
        }
    }
}

impl ProcessModelDto {
    /// Canonical JSON: nodes sorted by id, edges by (from, to).
    pub fn deterministic_json(&self) -> String {
        let mut sorted = self.clone();
        sorted.nodes.sort_by(|a, b| a.id().cmp(b.id()));
        sorted
            .edges
            .sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        serde_json::to_string_pretty(&sorted).unwrap_or_default()
    }
}
