//! Services the engine calls out to. All of them are handed to `EngineData`
//! explicitly; nothing is looked up globally.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::model::{MessageTemplate, NodeId};
use crate::node_instance::NodeInstance;
use crate::process_instance::ProcessInstance;
use crate::types::*;

// ─── Messaging ────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub service: String,
    pub operation: String,
    pub body: serde_json::Value,
}

/// Outcome of handing a message to the message service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryResult {
    Sent,
    Acknowledged,
    Failed,
}

impl DeliveryResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
        }
    }
}

pub trait MessageService: Send + Sync {
    fn create_message(&self, template: &MessageTemplate) -> Result<Message> {
        Ok(Message {
            service: template.service.clone(),
            operation: template.operation.clone(),
            body: template.body.clone(),
        })
    }

    fn send_message(
        &self,
        message: &Message,
        context: &ActivityInstanceContext,
    ) -> Result<DeliveryResult>;
}

/// Accepts every message without delivering it anywhere.
#[derive(Debug, Default)]
pub struct LoggingMessageService;

impl MessageService for LoggingMessageService {
    fn send_message(
        &self,
        message: &Message,
        context: &ActivityInstanceContext,
    ) -> Result<DeliveryResult> {
        tracing::info!(
            service = %message.service,
            operation = %message.operation,
            node = %context.node,
            handle = %context.handle,
            "message accepted"
        );
        Ok(DeliveryResult::Sent)
    }
}

// ─── Activity context ─────────────────────────────────────────

/// What an external party gets to see of a running activity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityInstanceContext {
    pub process: ProcessInstanceHandle,
    pub process_uuid: Uuid,
    pub handle: NodeInstanceHandle,
    pub node: NodeId,
    pub entry_no: u32,
    pub owner: Principal,
    pub state: NodeInstanceState,
    pub inputs: Vec<ProcessData>,
}

pub trait ProcessContextFactory: Send + Sync {
    fn new_activity_instance_context(
        &self,
        process: &ProcessInstance,
        instance: &NodeInstance,
        inputs: Vec<ProcessData>,
    ) -> ActivityInstanceContext {
        ActivityInstanceContext {
            process: process.handle(),
            process_uuid: process.uuid(),
            handle: instance.handle(),
            node: instance.node().id.clone(),
            entry_no: instance.entry_no(),
            owner: instance.owner().clone(),
            state: instance.state(),
            inputs,
        }
    }

    /// Called once a node instance completes.
    fn on_activity_termination(&self, context: &ActivityInstanceContext) {
        tracing::debug!(node = %context.node, handle = %context.handle, "activity terminated");
    }
}

#[derive(Debug, Default)]
pub struct DefaultContextFactory;

impl ProcessContextFactory for DefaultContextFactory {}

// ─── Runnable actions ─────────────────────────────────────────

/// Body of a runnable activity: inputs from the node's defines in, finish
/// payload out.
pub type ActionFn = Arc<dyn Fn(&[ProcessData]) -> Result<serde_json::Value> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, ActionFn>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        action: impl Fn(&[ProcessData]) -> Result<serde_json::Value> + Send + Sync + 'static,
    ) {
        self.actions.insert(name.into(), Arc::new(action));
    }

    pub fn get(&self, name: &str) -> Option<ActionFn> {
        self.actions.get(name).cloned()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.actions.keys().collect();
        names.sort();
        f.debug_struct("ActionRegistry").field("actions", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_registry_lookup() {
        let mut registry = ActionRegistry::new();
        registry.register("double", |inputs| {
            let n = inputs
                .first()
                .and_then(|d| d.value.as_i64())
                .unwrap_or_default();
            Ok(json!(n * 2))
        });

        let action = registry.get("double").unwrap();
        let out = action(&[ProcessData::new("n", json!(21))]).unwrap();
        assert_eq!(out, json!(42));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_default_message_from_template() {
        let template = MessageTemplate {
            service: "crm".into(),
            operation: "notify".into(),
            body: json!({"x": 1}),
        };
        let msg = LoggingMessageService.create_message(&template).unwrap();
        assert_eq!(msg.service, "crm");
        assert_eq!(msg.body, json!({"x": 1}));
    }
}
