//! Process-execution core for procflow.
//!
//! This crate provides:
//! - `model` - immutable process definitions and the validated model graph
//! - `authoring` - YAML process models and their conversion into `model`
//! - `node_instance` - the node-instance state machine, its copy-on-write
//!   builder and split/join reconciliation
//! - `process_instance` - the owning aggregate of a process run
//! - `pseudo` - speculative overlay used to reason about unrealized branches
//! - `engine` - transactional entry points over `EngineData`

pub mod arena;
pub mod authoring;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod engine_data;
pub mod error;
pub mod events;
pub mod logging;
pub mod model;
pub mod node_instance;
pub mod process_instance;
pub mod pseudo;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use collaborators::{
    ActionRegistry, ActivityInstanceContext, DefaultContextFactory, DeliveryResult,
    LoggingMessageService, Message, MessageService, ProcessContextFactory,
};
pub use config::EngineConfig;
pub use engine::ProcessEngine;
pub use engine_data::EngineData;
pub use error::{EngineError, Result};
pub use events::EngineEvent;
pub use model::{ExecutableProcessModel, ExecutableProcessNode, NodeId, NodeKind};
pub use node_instance::{NodeInstance, NodeInstanceBuilder, NodeInstanceKind};
pub use process_instance::{ProcessInstance, ProcessInstanceBuilder};
pub use store::{EngineStore, MemoryStore};
pub use types::*;
