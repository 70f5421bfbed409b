//! Transaction-scoped working set: every node and process instance touched
//! by an engine operation lives here until `commit` writes it out.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::arena::Arena;
use crate::collaborators::{
    ActionRegistry, DefaultContextFactory, LoggingMessageService, MessageService,
    ProcessContextFactory,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::model::ExecutableProcessModel;
use crate::node_instance::NodeInstance;
use crate::process_instance::ProcessInstance;
use crate::store::{EngineStore, MemoryStore};
use crate::types::*;

pub struct EngineData {
    config: EngineConfig,
    models: BTreeMap<String, Arc<ExecutableProcessModel>>,
    node_instances: Arena<Arc<NodeInstance>>,
    process_instances: Arena<ProcessInstance>,
    dirty_nodes: BTreeSet<NodeInstanceHandle>,
    dirty_processes: BTreeSet<ProcessInstanceHandle>,
    tickles: VecDeque<NodeInstanceHandle>,
    events: VecDeque<(u64, EngineEvent)>,
    next_seq: u64,
    message_service: Arc<dyn MessageService>,
    context_factory: Arc<dyn ProcessContextFactory>,
    actions: ActionRegistry,
    store: Box<dyn EngineStore>,
}

impl Default for EngineData {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl EngineData {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            models: BTreeMap::new(),
            node_instances: Arena::new(),
            process_instances: Arena::new(),
            dirty_nodes: BTreeSet::new(),
            dirty_processes: BTreeSet::new(),
            tickles: VecDeque::new(),
            events: VecDeque::new(),
            next_seq: 0,
            message_service: Arc::new(LoggingMessageService),
            context_factory: Arc::new(DefaultContextFactory),
            actions: ActionRegistry::new(),
            store: Box::new(MemoryStore::new()),
        }
    }

    pub fn with_message_service(mut self, service: Arc<dyn MessageService>) -> Self {
        self.message_service = service;
        self
    }

    pub fn with_context_factory(mut self, factory: Arc<dyn ProcessContextFactory>) -> Self {
        self.context_factory = factory;
        self
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_store(mut self, store: Box<dyn EngineStore>) -> Self {
        self.store = store;
        self
    }

    // ── Collaborators ──

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn message_service(&self) -> Arc<dyn MessageService> {
        self.message_service.clone()
    }

    pub fn context_factory(&self) -> Arc<dyn ProcessContextFactory> {
        self.context_factory.clone()
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn store(&self) -> &dyn EngineStore {
        self.store.as_ref()
    }

    // ── Models ──

    pub fn register_model(&mut self, model: ExecutableProcessModel) -> Arc<ExecutableProcessModel> {
        let model = Arc::new(model);
        tracing::info!(model = %model.name(), "registered process model");
        self.models.insert(model.name().to_string(), model.clone());
        model
    }

    pub fn model(&self, name: &str) -> Result<Arc<ExecutableProcessModel>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownModel(name.to_string()))
    }

    pub fn models(&self) -> &BTreeMap<String, Arc<ExecutableProcessModel>> {
        &self.models
    }

    // ── Node instances ──

    pub fn node_instance(&self, handle: NodeInstanceHandle) -> Result<Arc<NodeInstance>> {
        self.node_instances
            .get(handle.0)
            .cloned()
            .ok_or(EngineError::UnknownNodeInstance(handle))
    }

    pub(crate) fn node_instance_ref(&self, handle: NodeInstanceHandle) -> Option<&NodeInstance> {
        self.node_instances.get(handle.0).map(Arc::as_ref)
    }

    pub(crate) fn insert_node_instance(
        &mut self,
        make: impl FnOnce(NodeInstanceHandle) -> NodeInstance,
    ) -> Arc<NodeInstance> {
        let handle = NodeInstanceHandle(self.node_instances.next_index());
        let instance = Arc::new(make(handle));
        self.node_instances.insert(instance.clone());
        self.dirty_nodes.insert(handle);
        self.record(EngineEvent::NodeInstanceCreated {
            process: instance.process(),
            handle,
            node: instance.node().id.clone(),
            entry_no: instance.entry_no(),
        });
        if instance.state() != NodeInstanceState::Pending {
            self.record(EngineEvent::NodeStateChanged {
                handle,
                node: instance.node().id.clone(),
                entry_no: instance.entry_no(),
                from: NodeInstanceState::Pending,
                to: instance.state(),
            });
        }
        instance
    }

    pub(crate) fn replace_node_instance(&mut self, instance: Arc<NodeInstance>) -> Result<()> {
        let handle = instance.handle();
        let previous = self
            .node_instances
            .replace(handle.0, instance.clone())
            .ok_or(EngineError::UnknownNodeInstance(handle))?;
        if previous.state() != instance.state() {
            self.record(EngineEvent::NodeStateChanged {
                handle,
                node: instance.node().id.clone(),
                entry_no: instance.entry_no(),
                from: previous.state(),
                to: instance.state(),
            });
        }
        self.dirty_nodes.insert(handle);
        Ok(())
    }

    // ── Process instances ──

    pub fn instance(&self, handle: ProcessInstanceHandle) -> Result<&ProcessInstance> {
        self.process_instances
            .get(handle.0)
            .ok_or(EngineError::UnknownProcessInstance(handle))
    }

    pub(crate) fn instance_mut(&mut self, handle: ProcessInstanceHandle) -> Result<&mut ProcessInstance> {
        self.dirty_processes.insert(handle);
        self.process_instances
            .get_mut(handle.0)
            .ok_or(EngineError::UnknownProcessInstance(handle))
    }

    pub(crate) fn create_process_instance(
        &mut self,
        model: Arc<ExecutableProcessModel>,
        name: String,
        owner: Principal,
        parent_activity: Option<NodeInstanceHandle>,
        inputs: Vec<ProcessData>,
    ) -> ProcessInstanceHandle {
        let model_name = model.name().to_string();
        let index = self.process_instances.insert_with(|index| {
            ProcessInstance::new(
                ProcessInstanceHandle(index),
                model,
                name,
                owner,
                parent_activity,
                inputs,
            )
        });
        let handle = ProcessInstanceHandle(index);
        self.dirty_processes.insert(handle);
        self.record(EngineEvent::ProcessCreated {
            process: handle,
            model: model_name,
            parent: parent_activity,
        });
        handle
    }

    pub(crate) fn mark_process_dirty(&mut self, handle: ProcessInstanceHandle) {
        self.dirty_processes.insert(handle);
    }

    pub fn process_instances(&self) -> impl Iterator<Item = &ProcessInstance> {
        self.process_instances.iter().map(|(_, p)| p)
    }

    // ── Tickles ──

    pub fn queue_tickle(&mut self, handle: NodeInstanceHandle) {
        if !self.tickles.contains(&handle) {
            self.tickles.push_back(handle);
            self.record(EngineEvent::TickleQueued { handle });
        }
    }

    pub(crate) fn take_tickles(&mut self) -> Vec<NodeInstanceHandle> {
        self.tickles.drain(..).collect()
    }

    pub fn pending_tickles(&self) -> usize {
        self.tickles.len()
    }

    // ── Events ──

    /// Append to the log, dropping the oldest entries beyond
    /// `event_log_capacity`. Sequence numbers keep counting.
    pub(crate) fn record(&mut self, event: EngineEvent) {
        self.events.push_back((self.next_seq, event));
        self.next_seq += 1;
        while self.events.len() > self.config.event_log_capacity.max(1) {
            self.events.pop_front();
        }
    }

    /// Hand every retained event to the caller and clear the log.
    pub fn drain_events(&mut self) -> Vec<(u64, EngineEvent)> {
        self.events.drain(..).collect()
    }

    /// Events with a sequence number of at least `seq`.
    pub fn events_since(&self, seq: u64) -> Vec<(u64, EngineEvent)> {
        self.events
            .iter()
            .filter(|(s, _)| *s >= seq)
            .cloned()
            .collect()
    }

    pub fn next_event_seq(&self) -> u64 {
        self.next_seq
    }

    // ── Commit ──

    /// Number of records the next commit would write.
    pub fn pending_writes(&self) -> usize {
        self.dirty_nodes.len() + self.dirty_processes.len()
    }

    /// Write every record touched since the last commit.
    pub fn commit(&mut self) -> Result<usize> {
        let nodes = std::mem::take(&mut self.dirty_nodes);
        let processes = std::mem::take(&mut self.dirty_processes);

        for handle in &nodes {
            if let Some(instance) = self.node_instances.get(handle.0) {
                self.store.put_node_instance(&instance.to_record())?;
            }
        }
        for handle in &processes {
            if let Some(instance) = self.process_instances.get(handle.0) {
                self.store.put_process_instance(&instance.to_record())?;
            }
        }

        let written = nodes.len() + processes.len();
        if written > 0 {
            tracing::debug!(
                node_instances = nodes.len(),
                process_instances = processes.len(),
                "committed"
            );
            self.record(EngineEvent::Committed {
                node_instances: nodes.len(),
                process_instances: processes.len(),
            });
        }
        Ok(written)
    }
}

impl std::fmt::Debug for EngineData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineData")
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .field("node_instances", &self.node_instances.len())
            .field("process_instances", &self.process_instances.len())
            .field("pending_writes", &self.pending_writes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_log_keeps_newest_entries() {
        let mut data = EngineData::new(EngineConfig {
            event_log_capacity: 2,
            ..EngineConfig::default()
        });
        for handle in 0..4 {
            data.queue_tickle(NodeInstanceHandle(handle));
        }
        let seqs: Vec<u64> = data.events_since(0).into_iter().map(|(seq, _)| seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(data.next_event_seq(), 4);
    }

    #[test]
    fn test_drain_events_empties_the_log() {
        let mut data = EngineData::default();
        data.queue_tickle(NodeInstanceHandle(1));
        data.queue_tickle(NodeInstanceHandle(1));
        let drained = data.drain_events();
        assert_eq!(
            drained,
            vec![(0, EngineEvent::TickleQueued { handle: NodeInstanceHandle(1) })]
        );
        assert!(data.events_since(0).is_empty());
        assert_eq!(data.pending_tickles(), 1);
    }
}
