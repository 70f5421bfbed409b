//! Typed engine error model.
//!
//! Modeling errors signal a defective process model or caller misuse and are
//! never retried. Task errors are raised only after the failure has been
//! recorded on the node instance.

use crate::types::{NodeInstanceHandle, NodeInstanceState, ProcessInstanceHandle};

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Modeling errors ──
    #[error("node {node} is not reentrant: instance {existing} (entry {existing_entry}) is still {state}")]
    IllegalReentry {
        node: String,
        existing: NodeInstanceHandle,
        existing_entry: u32,
        state: NodeInstanceState,
    },

    #[error("node {node} already has a live instance for entry {entry_no}")]
    DuplicateInstance { node: String, entry_no: u32 },

    #[error("join {join} follows split {split} without a condition for it")]
    UnconditionedJoin { join: String, split: String },

    #[error("instance {handle} of {node} cannot be cancelled from state {state}")]
    IllegalCancel {
        handle: NodeInstanceHandle,
        node: String,
        state: NodeInstanceState,
    },

    #[error("{node} is already final ({state})")]
    AlreadyFinal {
        node: String,
        state: NodeInstanceState,
    },

    #[error("composite {node} cannot finish before its child process finished")]
    ChildNotFinished { node: String },

    #[error("cannot provide {node}: predecessor {predecessor} is {state}")]
    PredecessorNotFinal {
        node: String,
        predecessor: NodeInstanceHandle,
        state: NodeInstanceState,
    },

    #[error("illegal transition of {node} from {from} to {to}")]
    IllegalStateTransition {
        node: String,
        from: NodeInstanceState,
        to: NodeInstanceState,
    },

    #[error("join {join} cannot finish: {complete} of at least {min} branches complete")]
    JoinQuorumNotMet {
        join: String,
        complete: usize,
        min: usize,
    },

    #[error("invalid process model: {0}")]
    InvalidModel(String),

    // ── Lookup errors ──
    #[error("unknown node instance {0}")]
    UnknownNodeInstance(NodeInstanceHandle),

    #[error("unknown process instance {0}")]
    UnknownProcessInstance(ProcessInstanceHandle),

    #[error("unknown node {node} in model {model}")]
    UnknownNode { model: String, node: String },

    #[error("unknown process model {0}")]
    UnknownModel(String),

    #[error("no action registered under {0}")]
    UnknownAction(String),

    // ── Task failures (already recorded on the instance) ──
    #[error("task creation for {node} failed: {cause}")]
    TaskCreation { node: String, cause: String },

    #[error("task execution for {node} failed: {cause}")]
    TaskExecution { node: String, cause: String },

    #[error("message delivery for {node} failed")]
    MessageDeliveryFailed { node: String },

    // ── Collaborators ──
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),

    #[error("store failure: {0}")]
    Store(String),
}

impl EngineError {
    /// Structural impossibilities. These are propagated and never retried.
    pub fn is_modeling_error(&self) -> bool {
        matches!(
            self,
            Self::IllegalReentry { .. }
                | Self::DuplicateInstance { .. }
                | Self::UnconditionedJoin { .. }
                | Self::IllegalCancel { .. }
                | Self::AlreadyFinal { .. }
                | Self::ChildNotFinished { .. }
                | Self::PredecessorNotFinal { .. }
                | Self::IllegalStateTransition { .. }
                | Self::JoinQuorumNotMet { .. }
                | Self::InvalidModel(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modeling_errors_are_classified() {
        let err = EngineError::UnconditionedJoin {
            join: "j".into(),
            split: "s".into(),
        };
        assert!(err.is_modeling_error());
        assert_eq!(
            err.to_string(),
            "join j follows split s without a condition for it"
        );

        let err = EngineError::TaskCreation {
            node: "a".into(),
            cause: "boom".into(),
        };
        assert!(!err.is_modeling_error());
    }

    #[test]
    fn test_collaborator_errors_convert() {
        let err: EngineError = anyhow::anyhow!("service down").into();
        assert!(matches!(err, EngineError::Collaborator(_)));
        assert_eq!(err.to_string(), "service down");
    }
}
