//! Immutable process definitions: node kinds, conditions, data specs and the
//! validated model graph.

mod node;
mod process_model;

pub use node::{
    ActivitySpec, CompositeSpec, Condition, DefineSpec, ExecutableProcessNode, MessageTemplate,
    NodeId, NodeKind, ResultSpec,
};
pub use process_model::{ExecutableProcessModel, ModelError};
