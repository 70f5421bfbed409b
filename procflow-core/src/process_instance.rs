//! The owning aggregate: a process instance and the builder through which
//! node instances reach their siblings.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::collaborators::ActivityInstanceContext;
use crate::engine_data::EngineData;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::model::{DefineSpec, ExecutableProcessModel, ExecutableProcessNode, NodeId};
use crate::node_instance::{NodeInstance, NodeInstanceBuilder};
use crate::types::*;

#[derive(Clone, Debug)]
pub struct ProcessInstance {
    pub(crate) handle: ProcessInstanceHandle,
    pub(crate) uuid: Uuid,
    pub(crate) model: Arc<ExecutableProcessModel>,
    pub(crate) name: String,
    pub(crate) owner: Principal,
    pub(crate) state: ProcessInstanceState,
    pub(crate) children: Vec<NodeInstanceHandle>,
    pub(crate) parent_activity: Option<NodeInstanceHandle>,
    pub(crate) inputs: Vec<ProcessData>,
    pub(crate) outputs: Vec<ProcessData>,
}

impl ProcessInstance {
    pub(crate) fn new(
        handle: ProcessInstanceHandle,
        model: Arc<ExecutableProcessModel>,
        name: String,
        owner: Principal,
        parent_activity: Option<NodeInstanceHandle>,
        inputs: Vec<ProcessData>,
    ) -> Self {
        Self {
            handle,
            uuid: Uuid::new_v4(),
            model,
            name,
            owner,
            state: ProcessInstanceState::New,
            children: Vec::new(),
            parent_activity,
            inputs,
            outputs: Vec::new(),
        }
    }

    pub fn handle(&self) -> ProcessInstanceHandle {
        self.handle
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn model(&self) -> &Arc<ExecutableProcessModel> {
        &self.model
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &Principal {
        &self.owner
    }

    pub fn state(&self) -> ProcessInstanceState {
        self.state
    }

    pub fn children(&self) -> &[NodeInstanceHandle] {
        &self.children
    }

    pub fn parent_activity(&self) -> Option<NodeInstanceHandle> {
        self.parent_activity
    }

    pub fn inputs(&self) -> &[ProcessData] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ProcessData] {
        &self.outputs
    }

    pub fn to_record(&self) -> ProcessInstanceRecord {
        ProcessInstanceRecord {
            handle: self.handle,
            uuid: self.uuid,
            model: self.model.name().to_string(),
            name: self.name.clone(),
            owner: self.owner.clone(),
            state: self.state,
            children: self.children.clone(),
            parent_activity: self.parent_activity,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstanceRecord {
    pub handle: ProcessInstanceHandle,
    pub uuid: Uuid,
    pub model: String,
    pub name: String,
    pub owner: Principal,
    pub state: ProcessInstanceState,
    pub children: Vec<NodeInstanceHandle>,
    #[serde(default)]
    pub parent_activity: Option<NodeInstanceHandle>,
    #[serde(default)]
    pub inputs: Vec<ProcessData>,
    #[serde(default)]
    pub outputs: Vec<ProcessData>,
}

/// Mutable access to one process instance and its children for the length
/// of one engine operation.
pub struct ProcessInstanceBuilder<'a> {
    data: &'a mut EngineData,
    handle: ProcessInstanceHandle,
}

impl<'a> ProcessInstanceBuilder<'a> {
    pub fn new(data: &'a mut EngineData, handle: ProcessInstanceHandle) -> Self {
        Self { data, handle }
    }

    pub fn handle(&self) -> ProcessInstanceHandle {
        self.handle
    }

    pub fn data(&mut self) -> &mut EngineData {
        self.data
    }

    pub fn data_ref(&self) -> &EngineData {
        self.data
    }

    pub fn instance(&self) -> Result<&ProcessInstance> {
        self.data.instance(self.handle)
    }

    pub fn owner(&self) -> Result<Principal> {
        Ok(self.instance()?.owner.clone())
    }

    pub fn model(&self) -> Result<Arc<ExecutableProcessModel>> {
        Ok(self.instance()?.model.clone())
    }

    pub fn state(&self) -> Result<ProcessInstanceState> {
        Ok(self.instance()?.state)
    }

    /// Mark the aggregate for re-persisting on the next commit.
    pub(crate) fn touch(&mut self) {
        self.data.mark_process_dirty(self.handle);
    }

    // ── Child lookup ──

    pub fn all_child_node_instances(
        &self,
        predicate: impl Fn(&NodeInstance) -> bool,
    ) -> Result<Vec<Arc<NodeInstance>>> {
        let mut found = Vec::new();
        for handle in &self.instance()?.children {
            let child = self.data.node_instance(*handle)?;
            if predicate(&child) {
                found.push(child);
            }
        }
        Ok(found)
    }

    /// Every live (not invalidated) instance of `node`.
    pub fn get_children(&self, node: &NodeId) -> Result<Vec<Arc<NodeInstance>>> {
        self.all_child_node_instances(|child| {
            &child.node().id == node && child.state() != NodeInstanceState::SkippedInvalidated
        })
    }

    pub fn get_child_node_instance(
        &self,
        node: &NodeId,
        entry_no: u32,
    ) -> Result<Option<Arc<NodeInstance>>> {
        Ok(self
            .get_children(node)?
            .into_iter()
            .find(|child| child.entry_no() == entry_no))
    }

    /// Live children that list `handle` among their predecessors.
    pub fn get_direct_successors_for(
        &self,
        handle: NodeInstanceHandle,
    ) -> Result<Vec<Arc<NodeInstance>>> {
        self.all_child_node_instances(|child| {
            child.predecessors().contains(&handle)
                && child.state() != NodeInstanceState::SkippedInvalidated
        })
    }

    /// Latest finished instance of `node`, by entry number.
    fn latest_finished(&self, node: &NodeId) -> Option<&NodeInstance> {
        let instance = self.data.instance(self.handle).ok()?;
        instance
            .children
            .iter()
            .filter_map(|handle| self.data.node_instance_ref(*handle))
            .filter(|child| {
                &child.node().id == node
                    && child.state().is_final()
                    && child.state() != NodeInstanceState::SkippedInvalidated
            })
            .max_by_key(|child| child.entry_no())
    }

    // ── Child persistence ──

    /// First store of a node instance: assigns its handle and links it to
    /// this process.
    pub fn store_child(&mut self, builder: &mut NodeInstanceBuilder) -> Result<NodeInstanceHandle> {
        let node = builder.node().clone();
        if !node.is_multi_instance() {
            if let Some(existing) = self.get_child_node_instance(&node.id, builder.entry_no())? {
                tracing::warn!(
                    node = %node.id,
                    entry = builder.entry_no(),
                    existing = %existing.handle(),
                    "duplicate node instance rejected"
                );
                return Err(EngineError::DuplicateInstance {
                    node: node.id.to_string(),
                    entry_no: builder.entry_no(),
                });
            }
        }
        let instance = self.data.insert_node_instance(|handle| builder.build_new(handle));
        let handle = instance.handle();
        self.data.instance_mut(self.handle)?.children.push(handle);
        builder.rebase(instance);
        tracing::debug!(node = %node.id, entry = builder.entry_no(), %handle, "stored node instance");
        Ok(handle)
    }

    /// Load a child into a builder, run `body` on it and store the result.
    pub fn update_child(
        &mut self,
        handle: NodeInstanceHandle,
        body: impl FnOnce(&mut NodeInstanceBuilder, &mut Self) -> Result<()>,
    ) -> Result<()> {
        let instance = self.data.node_instance(handle)?;
        let mut builder = NodeInstanceBuilder::from_instance(instance);
        body(&mut builder, self)?;
        builder.store(self)?;
        Ok(())
    }

    // ── Data flow ──

    /// Verdict of `node`'s condition on the edge from `predecessor`. An edge
    /// without a condition always fires.
    pub fn eval_condition(&self, node: &ExecutableProcessNode, predecessor: &NodeId) -> ConditionResult {
        match node.condition_for(predecessor) {
            None => ConditionResult::True,
            Some(condition) => condition.eval(|id| {
                self.latest_finished(id).map(|instance| {
                    (instance.state() == NodeInstanceState::Complete).then_some(instance.results())
                })
            }),
        }
    }

    pub fn resolve_defines(&self, defines: &[DefineSpec]) -> Vec<ProcessData> {
        let inputs = self
            .instance()
            .map(|instance| instance.inputs.clone())
            .unwrap_or_default();
        defines
            .iter()
            .filter_map(|define| {
                let produced = self
                    .latest_finished(&define.node)
                    .filter(|source| source.state() == NodeInstanceState::Complete)
                    .and_then(|source| define.apply(source.results()));
                // anything the named node did not produce comes from the process inputs
                produced.or_else(|| define.apply(&inputs))
            })
            .collect()
    }

    pub fn activity_context(&self, instance: &NodeInstance) -> Result<ActivityInstanceContext> {
        let inputs = self.resolve_defines(&instance.node().defines);
        let process = self.instance()?;
        Ok(self
            .data
            .context_factory()
            .new_activity_instance_context(process, instance, inputs))
    }

    // ── Propagation ──

    /// Create or advance the successors of a completed instance. Splits
    /// drive their own successors and are ignored here.
    pub fn start_successors(&mut self, finished: &NodeInstance) -> Result<()> {
        if finished.state() != NodeInstanceState::Complete || finished.node().is_split() {
            return Ok(());
        }
        let model = self.model()?;
        for successor_id in &finished.node().successors {
            let successor = model.require_node(successor_id)?.clone();
            let mut builder = successor.create_or_reuse_instance(
                self,
                Some(finished.handle()),
                finished.entry_no(),
            )?;
            builder.store(self)?;
            let state = builder.state();
            if state.is_final() {
                continue;
            }
            if successor.is_join() && state.is_active() {
                builder.progress_join(self, NodeInstanceState::Skipped)?;
            } else if state == NodeInstanceState::Pending {
                builder.provide_task(self, true)?;
            }
        }
        Ok(())
    }

    /// Propagate a skip to the successors of `instance` at the same entry.
    pub fn skip_successors(
        &mut self,
        instance: &NodeInstance,
        skip_state: NodeInstanceState,
    ) -> Result<()> {
        let model = self.model()?;
        for successor_id in &instance.node().successors {
            let successor = model.require_node(successor_id)?.clone();
            let mut builder =
                match self.get_child_node_instance(successor_id, instance.entry_no())? {
                    Some(existing) if existing.state().is_final() => continue,
                    Some(existing) => {
                        let mut builder = NodeInstanceBuilder::from_instance(existing);
                        builder.add_predecessor(instance.handle());
                        builder
                    }
                    None => successor.create_or_reuse_instance(
                        self,
                        Some(instance.handle()),
                        instance.entry_no(),
                    )?,
                };
            if successor.is_join() {
                builder.store(self)?;
                builder.skip_task(self, skip_state)?;
            } else if matches!(
                builder.state(),
                NodeInstanceState::Pending | NodeInstanceState::FailRetry
            ) {
                builder.skip_task(self, skip_state)?;
            }
        }
        Ok(())
    }

    /// Re-run reconciliation of every split still in flight.
    pub fn update_splits(&mut self) -> Result<()> {
        let splits =
            self.all_child_node_instances(|child| child.node().is_split() && child.state().is_active())?;
        for split in splits {
            let current = self.data.node_instance(split.handle())?;
            if !current.state().is_active() {
                continue;
            }
            let mut builder = NodeInstanceBuilder::from_instance(current);
            let done = builder.update_split_state(self)?;
            builder.invalidate_builder(self.data_ref())?;
            if done && !builder.state().is_final() {
                builder.finish_task(self, None)?;
            }
        }
        Ok(())
    }

    /// Settle the process state once every child is final.
    pub fn update_state(&mut self) -> Result<()> {
        if self.state()? != ProcessInstanceState::Started {
            return Ok(());
        }
        let children = self.all_child_node_instances(|_| true)?;
        if children.iter().any(|child| !child.state().is_final()) {
            return Ok(());
        }
        // a completion whose successors are still being created
        let unpropagated = children.iter().any(|child| {
            child.state() == NodeInstanceState::Complete
                && child.node().successors.iter().any(|successor| {
                    !children.iter().any(|other| {
                        &other.node().id == successor && other.predecessors().contains(&child.handle())
                    })
                })
        });
        if unpropagated {
            return Ok(());
        }

        let next = if children
            .iter()
            .any(|child| child.node().is_end() && child.state() == NodeInstanceState::Complete)
        {
            ProcessInstanceState::Finished
        } else if children
            .iter()
            .any(|child| child.state() == NodeInstanceState::Failed)
        {
            ProcessInstanceState::Failed
        } else {
            ProcessInstanceState::Cancelled
        };

        if next == ProcessInstanceState::Finished {
            let model = self.model()?;
            let outputs = self.resolve_defines(model.exports());
            self.data.instance_mut(self.handle)?.outputs = outputs;
        }
        self.set_state(next)?;

        let Some(parent) = self.instance()?.parent_activity else {
            return Ok(());
        };
        let activity = self.data.node_instance(parent)?;
        if activity.state().is_final() {
            return Ok(());
        }
        let mut parent_owner = ProcessInstanceBuilder::new(&mut *self.data, activity.process());
        let mut builder = NodeInstanceBuilder::from_instance(activity);
        match next {
            ProcessInstanceState::Finished => builder.finish_task(&mut parent_owner, None),
            ProcessInstanceState::Failed => {
                builder.fail_task(&mut parent_owner, format!("child process {} failed", self.handle))
            }
            _ => builder.cancel_and_skip(&mut parent_owner),
        }
    }

    fn set_state(&mut self, next: ProcessInstanceState) -> Result<()> {
        let handle = self.handle;
        let instance = self.data.instance_mut(handle)?;
        let from = instance.state;
        if from == next {
            return Ok(());
        }
        instance.state = next;
        tracing::info!(process = %handle, %from, to = %next, "process state change");
        self.data.record(EngineEvent::ProcessStateChanged {
            process: handle,
            from,
            to: next,
        });
        Ok(())
    }

    // ── Lifecycle ──

    /// Create the `Pending` start node instances.
    pub fn initialize(&mut self) -> Result<()> {
        if self.state()? != ProcessInstanceState::New {
            return Ok(());
        }
        let model = self.model()?;
        let owner = self.owner()?;
        let starts: Vec<Arc<ExecutableProcessNode>> = model.start_nodes().cloned().collect();
        for start in starts {
            let mut builder = NodeInstanceBuilder::new(start, self.handle, [], owner.clone(), 1);
            builder.store(self)?;
        }
        self.set_state(ProcessInstanceState::Initialized)
    }

    /// Provide every start node with auto-continue.
    pub fn start(&mut self) -> Result<()> {
        if self.state()? == ProcessInstanceState::New {
            self.initialize()?;
        }
        if self.state()? != ProcessInstanceState::Initialized {
            return Ok(());
        }
        self.set_state(ProcessInstanceState::Started)?;
        let starts = self.all_child_node_instances(|child| {
            child.node().is_start() && child.state() == NodeInstanceState::Pending
        })?;
        for start in starts {
            self.update_child(start.handle(), |builder, owner| {
                builder.provide_task(owner, true)
            })?;
        }
        Ok(())
    }

    /// Cancel every unfinished child and the process itself.
    pub fn cancel(&mut self) -> Result<()> {
        if self.state()?.is_final() {
            return Ok(());
        }
        let open = self.all_child_node_instances(|child| !child.state().is_final())?;
        for child in open {
            if self.data.node_instance(child.handle())?.state().is_final() {
                continue;
            }
            self.update_child(child.handle(), |builder, owner| builder.cancel(owner))?;
        }
        self.set_state(ProcessInstanceState::Cancelled)
    }
}
