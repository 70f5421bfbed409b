//! Kind-specific lifecycle hooks. Each hook returns whether the lifecycle
//! may continue on its own into the next step.

use super::NodeInstanceBuilder;
use crate::collaborators::DeliveryResult;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::model::{ExecutableProcessNode, NodeKind};
use crate::process_instance::ProcessInstanceBuilder;
use crate::types::*;

/// Closed set of instance behaviours, derived from the node definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeInstanceKind {
    /// Start, end, plain, manual and message activities.
    Default,
    RunnableActivity,
    Composite,
    Split,
    Join,
    Event,
}

impl NodeInstanceKind {
    pub fn of(node: &ExecutableProcessNode) -> Self {
        match &node.kind {
            NodeKind::Activity(spec) if spec.action.is_some() => Self::RunnableActivity,
            NodeKind::Start | NodeKind::End | NodeKind::Activity(_) => Self::Default,
            NodeKind::Composite(_) => Self::Composite,
            NodeKind::Split { .. } => Self::Split,
            NodeKind::Join { .. } => Self::Join,
            NodeKind::Event { .. } => Self::Event,
        }
    }
}

impl NodeInstanceBuilder {
    pub(super) fn do_provide_task(&mut self, owner: &mut ProcessInstanceBuilder<'_>) -> Result<bool> {
        match self.kind() {
            NodeInstanceKind::Default if self.node().message().is_some() => {
                self.send_message(owner)
            }
            NodeInstanceKind::Event => Ok(matches!(
                self.node().kind,
                NodeKind::Event { throwing: true }
            )),
            NodeInstanceKind::Composite => {
                self.create_child_process(owner)?;
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    pub(super) fn do_take_task(&mut self, _owner: &mut ProcessInstanceBuilder<'_>) -> Result<bool> {
        Ok(true)
    }

    pub(super) fn do_start_task(&mut self, owner: &mut ProcessInstanceBuilder<'_>) -> Result<bool> {
        match self.kind() {
            NodeInstanceKind::Default => Ok(self.node().message().is_none()
                && self.node().can_start_task_auto_progress()),
            NodeInstanceKind::RunnableActivity => {
                self.run_action(owner)?;
                Ok(true)
            }
            NodeInstanceKind::Composite => {
                let child = self.child_process().ok_or_else(|| EngineError::TaskExecution {
                    node: self.describe(),
                    cause: "composite has no child process".to_string(),
                })?;
                ProcessInstanceBuilder::new(owner.data(), child).start()?;
                // the child's completion finishes this instance
                Ok(false)
            }
            NodeInstanceKind::Split => self.update_split_state(owner),
            NodeInstanceKind::Join => self.update_join_state(owner, NodeInstanceState::Skipped),
            NodeInstanceKind::Event => Ok(true),
        }
    }

    pub(super) fn do_finish_task(
        &mut self,
        owner: &mut ProcessInstanceBuilder<'_>,
        payload: Option<&serde_json::Value>,
    ) -> Result<()> {
        match self.kind() {
            NodeInstanceKind::Composite => {
                let child = self
                    .child_process()
                    .ok_or_else(|| EngineError::ChildNotFinished {
                        node: self.describe(),
                    })?;
                let process = owner.data_ref().instance(child)?;
                if process.state() != ProcessInstanceState::Finished {
                    return Err(EngineError::ChildNotFinished {
                        node: self.describe(),
                    });
                }
                let mut results = process.outputs().to_vec();
                results.extend(self.node().apply_results(payload));
                self.set_results(results);
            }
            NodeInstanceKind::Join => self.check_join_quorum(owner)?,
            NodeInstanceKind::Split => {}
            _ => {
                if payload.is_some() {
                    let results = self.node().apply_results(payload);
                    self.set_results(results);
                }
            }
        }
        Ok(())
    }

    pub(super) fn do_cancel(&mut self, owner: &mut ProcessInstanceBuilder<'_>) -> Result<()> {
        if let Some(child) = self.child_process() {
            let mut process = ProcessInstanceBuilder::new(owner.data(), child);
            process.cancel()?;
        }
        Ok(())
    }

    // ── Kind helpers ──

    fn send_message(&mut self, owner: &mut ProcessInstanceBuilder<'_>) -> Result<bool> {
        let Some(template) = self.node().message().cloned() else {
            return Ok(true);
        };
        let handle = self.store(owner)?;
        let service = owner.data_ref().message_service();
        let message = service.create_message(&template)?;
        let snapshot = self.build()?;
        let context = owner.activity_context(&snapshot)?;
        let delivery = service.send_message(&message, &context)?;
        tracing::info!(
            instance = %self.describe(),
            service = %message.service,
            operation = %message.operation,
            delivery = delivery.as_str(),
            "message sent"
        );
        owner.data().record(EngineEvent::MessageSent {
            handle,
            service: message.service,
            operation: message.operation,
            delivery: delivery.as_str().to_string(),
        });
        match delivery {
            DeliveryResult::Sent => Ok(false),
            DeliveryResult::Acknowledged => {
                self.set_state(NodeInstanceState::Acknowledged)?;
                self.store(owner)?;
                Ok(false)
            }
            DeliveryResult::Failed => Err(EngineError::MessageDeliveryFailed {
                node: self.describe(),
            }),
        }
    }

    fn run_action(&mut self, owner: &mut ProcessInstanceBuilder<'_>) -> Result<()> {
        let name = match &self.node().kind {
            NodeKind::Activity(spec) => spec.action.clone(),
            _ => None,
        }
        .unwrap_or_default();
        let action = owner
            .data_ref()
            .actions()
            .get(&name)
            .ok_or_else(|| EngineError::UnknownAction(name.clone()))?;
        let inputs = owner.resolve_defines(&self.node().defines);
        let output = action(&inputs).map_err(|err| EngineError::TaskExecution {
            node: self.describe(),
            cause: format!("{err:#}"),
        })?;
        tracing::debug!(instance = %self.describe(), action = %name, "action ran");
        let results = self.node().apply_results(Some(&output));
        self.set_results(results);
        self.store(owner)?;
        Ok(())
    }

    fn create_child_process(&mut self, owner: &mut ProcessInstanceBuilder<'_>) -> Result<()> {
        if self.child_process().is_some() {
            return Ok(());
        }
        let NodeKind::Composite(spec) = &self.node().kind else {
            return Ok(());
        };
        let model = owner.data_ref().model(&spec.child_model)?;
        let handle = self.store(owner)?;
        let inputs = owner.resolve_defines(&self.node().defines);
        let owner_principal = self.owner().clone();
        let name = format!("{}/{}", owner.instance()?.name(), self.node().id);
        let child = owner.data().create_process_instance(
            model,
            name,
            owner_principal,
            Some(handle),
            inputs,
        );
        tracing::debug!(instance = %self.describe(), %child, "created child process");
        self.set_child_process(child);
        self.store(owner)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActivitySpec, CompositeSpec};

    #[test]
    fn test_kind_dispatch() {
        let runnable = ExecutableProcessNode::new(
            "calc",
            NodeKind::Activity(ActivitySpec {
                action: Some("calc".into()),
                ..Default::default()
            }),
        );
        assert_eq!(NodeInstanceKind::of(&runnable), NodeInstanceKind::RunnableActivity);

        let plain = ExecutableProcessNode::new("a", NodeKind::Activity(ActivitySpec::default()));
        assert_eq!(NodeInstanceKind::of(&plain), NodeInstanceKind::Default);

        let sub = ExecutableProcessNode::new(
            "sub",
            NodeKind::Composite(CompositeSpec {
                child_model: "child".into(),
            }),
        );
        assert_eq!(NodeInstanceKind::of(&sub), NodeInstanceKind::Composite);
        assert_eq!(
            NodeInstanceKind::of(&ExecutableProcessNode::new("s", NodeKind::Split { min: 1, max: 2 })),
            NodeInstanceKind::Split
        );
    }
}
