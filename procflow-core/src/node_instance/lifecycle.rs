//! The node-instance state machine. Each transition persists through the
//! owning process builder before any kind hook or propagation runs.

use std::sync::Arc;

use super::{NodeInstanceBuilder, NodeInstanceKind};
use crate::error::{EngineError, Result};
use crate::model::ExecutableProcessNode;
use crate::process_instance::ProcessInstanceBuilder;
use crate::types::*;

impl ExecutableProcessNode {
    /// Builder for the instance of this node reached from `predecessor` at
    /// `entry_no`.
    ///
    /// A live instance at that entry is reused. A finished one means the node
    /// is being re-entered and a new entry is opened, except for ordinary
    /// joins, which fire once per entry. A non-multi-instance node must not
    /// have a pending instance at another entry; skipped leftovers from
    /// earlier passes are invalidated.
    pub fn create_or_reuse_instance(
        self: &Arc<Self>,
        owner: &mut ProcessInstanceBuilder<'_>,
        predecessor: Option<NodeInstanceHandle>,
        entry_no: u32,
    ) -> Result<NodeInstanceBuilder> {
        let siblings = owner.get_children(&self.id)?;
        let max_entry = siblings.iter().map(|s| s.entry_no()).max();

        let entry_no = if self.is_multi_instance() {
            max_entry.map_or(entry_no, |max| max + 1)
        } else {
            match siblings.iter().find(|s| s.entry_no() == entry_no) {
                Some(existing)
                    if !existing.state().is_final()
                        || (self.is_join() && !self.is_multi_merge()) =>
                {
                    let mut builder = NodeInstanceBuilder::from_instance(existing.clone());
                    if let Some(predecessor) = predecessor {
                        builder.add_predecessor(predecessor);
                    }
                    return Ok(builder);
                }
                Some(_) => max_entry.map_or(entry_no, |max| max + 1),
                None => entry_no,
            }
        };

        if !self.is_multi_instance() && !self.is_multi_merge() {
            for other in siblings.iter().filter(|s| s.entry_no() != entry_no) {
                let state = other.state();
                if state.is_skipped() {
                    owner.update_child(other.handle(), |builder, owner| {
                        builder.invalidate_task(owner)
                    })?;
                } else if !state.is_final() && !state.is_committed() {
                    return Err(EngineError::IllegalReentry {
                        node: self.id.to_string(),
                        existing: other.handle(),
                        existing_entry: other.entry_no(),
                        state,
                    });
                }
            }
        }

        Ok(NodeInstanceBuilder::new(
            self.clone(),
            owner.handle(),
            predecessor,
            owner.owner()?,
            entry_no,
        ))
    }
}

impl NodeInstanceBuilder {
    fn require_handle(&self) -> Result<NodeInstanceHandle> {
        self.handle().ok_or_else(|| {
            EngineError::Store(format!("{} has not been stored yet", self.describe()))
        })
    }

    fn already_final(&self) -> EngineError {
        EngineError::AlreadyFinal {
            node: self.describe(),
            state: self.state(),
        }
    }

    // ── Forward transitions ──

    /// `Pending → Sent`, optionally continuing into take.
    pub fn provide_task(
        &mut self,
        owner: &mut ProcessInstanceBuilder<'_>,
        auto_continue: bool,
    ) -> Result<()> {
        if self.state() == NodeInstanceState::FailRetry {
            self.set_state(NodeInstanceState::Pending)?;
        }
        if self.state() != NodeInstanceState::Pending {
            return Err(EngineError::IllegalStateTransition {
                node: self.describe(),
                from: self.state(),
                to: NodeInstanceState::Sent,
            });
        }
        for predecessor in self.predecessors().clone() {
            let instance = owner.data_ref().node_instance(predecessor)?;
            if !instance.node().is_split() && !instance.state().is_final() {
                return Err(EngineError::PredecessorNotFinal {
                    node: self.describe(),
                    predecessor,
                    state: instance.state(),
                });
            }
        }
        self.store(owner)?;

        let auto_take = match self.do_provide_task(owner) {
            Ok(auto_take) => auto_take,
            Err(err) => {
                self.fail_task_creation(owner, &err)?;
                return Err(err);
            }
        };
        self.soft_update_state(NodeInstanceState::Pending, NodeInstanceState::Sent)?;
        self.store(owner)?;

        if auto_continue
            && auto_take
            && self.node().can_provide_task_auto_progress()
            && !self.state().is_final()
        {
            self.take_task(owner, None, true)?;
        }
        Ok(())
    }

    /// Claim the task, optionally for `assigned_user`.
    pub fn take_task(
        &mut self,
        owner: &mut ProcessInstanceBuilder<'_>,
        assigned_user: Option<Principal>,
        auto_continue: bool,
    ) -> Result<()> {
        let state = self.state();
        if state.is_final() {
            return Err(self.already_final());
        }
        if !matches!(state, NodeInstanceState::Sent | NodeInstanceState::Acknowledged) {
            return Err(EngineError::IllegalStateTransition {
                node: self.describe(),
                from: state,
                to: NodeInstanceState::Taken,
            });
        }
        let auto_start = self.do_take_task(owner)?;
        if let Some(user) = assigned_user {
            self.set_owner(user);
        }
        self.set_state(NodeInstanceState::Taken)?;
        self.store(owner)?;

        if auto_continue && auto_start && self.node().can_take_task_auto_progress() {
            self.start_task(owner, true)?;
        }
        Ok(())
    }

    /// Begin work. A failing start hook fails the task.
    pub fn start_task(&mut self, owner: &mut ProcessInstanceBuilder<'_>, auto_continue: bool) -> Result<()> {
        let state = self.state();
        if state.is_final() {
            return Err(self.already_final());
        }
        if !matches!(
            state,
            NodeInstanceState::Sent | NodeInstanceState::Acknowledged | NodeInstanceState::Taken
        ) {
            return Err(EngineError::IllegalStateTransition {
                node: self.describe(),
                from: state,
                to: NodeInstanceState::Started,
            });
        }
        self.set_state(NodeInstanceState::Started)?;
        self.store(owner)?;

        let auto_finish = match self.do_start_task(owner) {
            Ok(auto_finish) => auto_finish,
            Err(err) => {
                self.invalidate_builder(owner.data_ref())?;
                if !self.state().is_final() {
                    self.fail_task_execution(owner, &err)?;
                }
                return Err(err);
            }
        };
        // the hook may have stored a newer version of this instance
        self.invalidate_builder(owner.data_ref())?;

        if auto_continue && auto_finish && !self.state().is_final() {
            self.finish_task(owner, None)?;
        }
        Ok(())
    }

    /// Complete the task and propagate: splits, successors, splits again,
    /// then the process state. That order keeps a split from cancelling a
    /// sibling that is completing in the same call.
    pub fn finish_task(
        &mut self,
        owner: &mut ProcessInstanceBuilder<'_>,
        payload: Option<serde_json::Value>,
    ) -> Result<()> {
        if self.state().is_final() {
            return Err(self.already_final());
        }
        self.do_finish_task(owner, payload.as_ref())?;
        self.set_state(NodeInstanceState::Complete)?;
        self.store(owner)?;

        let snapshot = self.build()?;
        tracing::info!(instance = %self.describe(), "task complete");
        let context = owner.activity_context(&snapshot)?;
        owner
            .data_ref()
            .context_factory()
            .on_activity_termination(&context);

        if self.kind() == NodeInstanceKind::Join {
            self.skip_predecessors(owner)?;
        }
        owner.update_splits()?;
        owner.start_successors(&snapshot)?;
        owner.update_splits()?;
        owner.update_state()
    }

    // ── Skips, cancellation and failure ──

    /// Mark the instance as not taken and cascade to its successors. A final
    /// instance is left alone.
    pub fn skip_task(
        &mut self,
        owner: &mut ProcessInstanceBuilder<'_>,
        skip_state: NodeInstanceState,
    ) -> Result<()> {
        if !skip_state.is_skipped() || skip_state == NodeInstanceState::SkippedInvalidated {
            return Err(EngineError::IllegalStateTransition {
                node: self.describe(),
                from: self.state(),
                to: skip_state,
            });
        }
        if self.state().is_final() {
            return Ok(());
        }
        if self.kind() == NodeInstanceKind::Join {
            return self.skip_join(owner, skip_state);
        }
        self.set_state(skip_state)?;
        self.store(owner)?;
        tracing::debug!(instance = %self.describe(), state = %skip_state, "skipped");

        let snapshot = self.build()?;
        owner.skip_successors(&snapshot, skip_state)?;
        owner.update_state()
    }

    /// Stop the instance without touching its successors.
    pub fn cancel(&mut self, owner: &mut ProcessInstanceBuilder<'_>) -> Result<()> {
        match self.state() {
            NodeInstanceState::Pending | NodeInstanceState::FailRetry => {
                self.set_state(NodeInstanceState::Skipped)?;
            }
            NodeInstanceState::Sent
            | NodeInstanceState::Acknowledged
            | NodeInstanceState::Taken
            | NodeInstanceState::Started => {
                self.do_cancel(owner)?;
                self.invalidate_builder(owner.data_ref())?;
                if !self.state().is_skipped() {
                    self.set_state(NodeInstanceState::AutoCancelled)?;
                }
            }
            NodeInstanceState::Complete if self.node().is_start() => {
                self.set_state(NodeInstanceState::AutoCancelled)?;
            }
            state => {
                return Err(EngineError::IllegalCancel {
                    handle: self.require_handle()?,
                    node: self.describe(),
                    state,
                });
            }
        }
        tracing::debug!(instance = %self.describe(), state = %self.state(), "cancelled");
        self.store(owner)?;
        Ok(())
    }

    /// Cancel, then skip everything downstream.
    pub fn cancel_and_skip(&mut self, owner: &mut ProcessInstanceBuilder<'_>) -> Result<()> {
        self.cancel(owner)?;
        let snapshot = self.build()?;
        owner.skip_successors(&snapshot, NodeInstanceState::SkippedCancel)?;
        owner.update_state()
    }

    /// Record a failure. A task that never left `Pending` may be retried.
    pub fn fail_task(
        &mut self,
        owner: &mut ProcessInstanceBuilder<'_>,
        cause: impl Into<String>,
    ) -> Result<()> {
        if self.state().is_final() {
            return Err(self.already_final());
        }
        let cause = cause.into();
        let next = if self.state() == NodeInstanceState::Pending {
            NodeInstanceState::FailRetry
        } else {
            NodeInstanceState::Failed
        };
        tracing::warn!(instance = %self.describe(), %cause, state = %next, "task failed");
        self.set_failure_cause(Some(cause));
        self.set_state(next)?;
        self.store(owner)?;

        let snapshot = self.build()?;
        owner.skip_successors(&snapshot, NodeInstanceState::SkippedFail)?;
        owner.update_state()
    }

    /// The task could not be created; leave it retryable and queue a tickle.
    pub fn fail_task_creation(
        &mut self,
        owner: &mut ProcessInstanceBuilder<'_>,
        cause: &EngineError,
    ) -> Result<()> {
        self.invalidate_builder(owner.data_ref())?;
        if self.state().is_final() {
            return Ok(());
        }
        tracing::warn!(instance = %self.describe(), %cause, "task creation failed");
        self.set_failure_cause(Some(cause.to_string()));
        self.set_state(NodeInstanceState::FailRetry)?;
        let handle = self.store(owner)?;
        owner.data().queue_tickle(handle);
        Ok(())
    }

    pub fn fail_task_execution(
        &mut self,
        owner: &mut ProcessInstanceBuilder<'_>,
        cause: &EngineError,
    ) -> Result<()> {
        self.fail_task(owner, cause.to_string())
    }

    /// Retire an instance that will never run, typically a skipped leftover
    /// from an earlier loop pass.
    pub fn invalidate_task(&mut self, owner: &mut ProcessInstanceBuilder<'_>) -> Result<()> {
        let state = self.state();
        if !(state.is_skipped() || matches!(state, NodeInstanceState::Pending | NodeInstanceState::Sent)) {
            return Err(EngineError::IllegalStateTransition {
                node: self.describe(),
                from: state,
                to: NodeInstanceState::SkippedInvalidated,
            });
        }
        self.set_state(NodeInstanceState::SkippedInvalidated)?;
        self.store(owner)?;
        Ok(())
    }

    /// Retry a task waiting for (re)provisioning.
    pub fn tickle(&mut self, owner: &mut ProcessInstanceBuilder<'_>) -> Result<()> {
        match self.state() {
            NodeInstanceState::Pending | NodeInstanceState::FailRetry => {
                self.provide_task(owner, true)
            }
            _ => Ok(()),
        }
    }
}
