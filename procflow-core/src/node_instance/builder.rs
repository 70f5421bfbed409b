use std::collections::BTreeSet;
use std::sync::Arc;

use super::{InstanceBody, NodeInstance, NodeInstanceKind};
use crate::engine_data::EngineData;
use crate::error::{EngineError, Result};
use crate::model::ExecutableProcessNode;
use crate::process_instance::ProcessInstanceBuilder;
use crate::types::*;

#[derive(Clone, Debug)]
struct Fields {
    predecessors: BTreeSet<NodeInstanceHandle>,
    owner: Principal,
    state: NodeInstanceState,
    results: Vec<ProcessData>,
    failure_cause: Option<String>,
    body: InstanceBody,
}

impl Fields {
    fn of(instance: &NodeInstance) -> Self {
        Self {
            predecessors: instance.predecessors.clone(),
            owner: instance.owner.clone(),
            state: instance.state,
            results: instance.results.clone(),
            failure_cause: instance.failure_cause.clone(),
            body: instance.body.clone(),
        }
    }
}

/// Which fields differ from the base snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Dirty {
    predecessors: bool,
    owner: bool,
    state: bool,
    results: bool,
    failure_cause: bool,
    body: bool,
}

impl Dirty {
    fn any(&self) -> bool {
        self.predecessors
            || self.owner
            || self.state
            || self.results
            || self.failure_cause
            || self.body
    }
}

/// Transaction-scoped staging area for one node instance.
///
/// A builder without a base stands for an instance that was never stored;
/// its handle is assigned by the owning process on the first `store`. A
/// builder over a stored snapshot only writes when some field actually
/// changed.
#[derive(Clone, Debug)]
pub struct NodeInstanceBuilder {
    node: Arc<ExecutableProcessNode>,
    process: ProcessInstanceHandle,
    handle: Option<NodeInstanceHandle>,
    entry_no: u32,
    base: Option<Arc<NodeInstance>>,
    fields: Fields,
    dirty: Dirty,
}

impl NodeInstanceBuilder {
    /// Builder for a brand-new `Pending` instance.
    pub fn new(
        node: Arc<ExecutableProcessNode>,
        process: ProcessInstanceHandle,
        predecessors: impl IntoIterator<Item = NodeInstanceHandle>,
        owner: Principal,
        entry_no: u32,
    ) -> Self {
        let body = match NodeInstanceKind::of(&node) {
            NodeInstanceKind::Composite => InstanceBody::Composite { child: None },
            _ => InstanceBody::Plain,
        };
        Self {
            node,
            process,
            handle: None,
            entry_no,
            base: None,
            fields: Fields {
                predecessors: predecessors.into_iter().collect(),
                owner,
                state: NodeInstanceState::Pending,
                results: Vec::new(),
                failure_cause: None,
                body,
            },
            dirty: Dirty::default(),
        }
    }

    /// Builder over a stored snapshot.
    pub fn from_instance(instance: Arc<NodeInstance>) -> Self {
        Self {
            node: instance.node.clone(),
            process: instance.process,
            handle: Some(instance.handle),
            entry_no: instance.entry_no,
            fields: Fields::of(&instance),
            base: Some(instance),
            dirty: Dirty::default(),
        }
    }

    // ── Accessors ──

    pub fn node(&self) -> &Arc<ExecutableProcessNode> {
        &self.node
    }

    pub fn kind(&self) -> NodeInstanceKind {
        NodeInstanceKind::of(&self.node)
    }

    pub fn process(&self) -> ProcessInstanceHandle {
        self.process
    }

    pub fn handle(&self) -> Option<NodeInstanceHandle> {
        self.handle
    }

    pub fn entry_no(&self) -> u32 {
        self.entry_no
    }

    pub fn state(&self) -> NodeInstanceState {
        self.fields.state
    }

    pub fn predecessors(&self) -> &BTreeSet<NodeInstanceHandle> {
        &self.fields.predecessors
    }

    pub fn owner(&self) -> &Principal {
        &self.fields.owner
    }

    pub fn results(&self) -> &[ProcessData] {
        &self.fields.results
    }

    pub fn failure_cause(&self) -> Option<&str> {
        self.fields.failure_cause.as_deref()
    }

    pub fn child_process(&self) -> Option<ProcessInstanceHandle> {
        match self.fields.body {
            InstanceBody::Composite { child } => child,
            InstanceBody::Plain => None,
        }
    }

    /// Whether a `store` would write anything.
    pub fn changed(&self) -> bool {
        self.base.is_none() || self.dirty.any()
    }

    pub(crate) fn describe(&self) -> String {
        match self.handle {
            Some(handle) => format!("{}[{}]#{}", self.node.id, self.entry_no, handle.0),
            None => format!("{}[{}]", self.node.id, self.entry_no),
        }
    }

    // ── Setters (each records whether the value really changed) ──

    pub fn add_predecessor(&mut self, predecessor: NodeInstanceHandle) {
        if self.fields.predecessors.insert(predecessor) {
            self.dirty.predecessors = true;
        }
    }

    pub fn set_owner(&mut self, owner: Principal) {
        if self.fields.owner != owner {
            self.fields.owner = owner;
            self.dirty.owner = true;
        }
    }

    pub fn set_results(&mut self, results: Vec<ProcessData>) {
        if self.fields.results != results {
            self.fields.results = results;
            self.dirty.results = true;
        }
    }

    pub fn set_failure_cause(&mut self, cause: Option<String>) {
        if self.fields.failure_cause != cause {
            self.fields.failure_cause = cause;
            self.dirty.failure_cause = true;
        }
    }

    pub(crate) fn set_child_process(&mut self, child: ProcessInstanceHandle) {
        let body = InstanceBody::Composite { child: Some(child) };
        if self.fields.body != body {
            self.fields.body = body;
            self.dirty.body = true;
        }
    }

    /// Change state, rejecting any move out of a final state other than the
    /// few the state machine allows.
    pub fn set_state(&mut self, next: NodeInstanceState) -> Result<()> {
        let current = self.fields.state;
        let allowed = current.can_transition_to(next)
            && !(current == NodeInstanceState::Complete
                && next == NodeInstanceState::AutoCancelled
                && !self.node.is_start());
        if !allowed {
            return Err(EngineError::IllegalStateTransition {
                node: self.describe(),
                from: current,
                to: next,
            });
        }
        if current != next {
            tracing::debug!(instance = %self.describe(), from = %current, to = %next, "state change");
            self.fields.state = next;
            self.dirty.state = true;
        }
        Ok(())
    }

    /// Compare-and-set; returns whether the state was `expected`.
    pub fn soft_update_state(
        &mut self,
        expected: NodeInstanceState,
        next: NodeInstanceState,
    ) -> Result<bool> {
        if self.fields.state != expected {
            return Ok(false);
        }
        self.set_state(next)?;
        Ok(true)
    }

    // ── Snapshots ──

    fn snapshot(&self, handle: NodeInstanceHandle) -> NodeInstance {
        NodeInstance {
            node: self.node.clone(),
            process: self.process,
            handle,
            predecessors: self.fields.predecessors.clone(),
            owner: self.fields.owner.clone(),
            entry_no: self.entry_no,
            state: self.fields.state,
            results: self.fields.results.clone(),
            failure_cause: self.fields.failure_cause.clone(),
            body: self.fields.body.clone(),
        }
    }

    /// Produce the immutable snapshot. The base is handed back untouched
    /// when nothing changed.
    pub fn build(&self) -> Result<Arc<NodeInstance>> {
        match (&self.base, self.handle) {
            (Some(base), _) if !self.dirty.any() => Ok(base.clone()),
            (_, Some(handle)) => Ok(Arc::new(self.snapshot(handle))),
            (_, None) => Err(EngineError::Store(format!(
                "{} has not been stored yet",
                self.describe()
            ))),
        }
    }

    /// Make `snapshot` the new base; called right after it was written.
    pub(crate) fn rebase(&mut self, snapshot: Arc<NodeInstance>) {
        self.handle = Some(snapshot.handle);
        self.fields = Fields::of(&snapshot);
        self.base = Some(snapshot);
        self.dirty = Dirty::default();
    }

    /// First store of a base-less builder; the owner supplies the handle.
    pub(crate) fn build_new(&self, handle: NodeInstanceHandle) -> NodeInstance {
        self.snapshot(handle)
    }

    /// Write pending changes into the engine data and re-persist the owning
    /// process. A builder with no changes writes nothing.
    pub fn store(&mut self, owner: &mut ProcessInstanceBuilder<'_>) -> Result<NodeInstanceHandle> {
        let Some(handle) = self.handle else {
            return owner.store_child(self);
        };
        if self.dirty.any() {
            let snapshot = Arc::new(self.snapshot(handle));
            owner.data().replace_node_instance(snapshot.clone())?;
            owner.touch();
            self.rebase(snapshot);
        }
        Ok(handle)
    }

    /// Drop local edits and reload the stored snapshot. Needed whenever a
    /// nested operation may have stored a newer version of this instance.
    pub fn invalidate_builder(&mut self, data: &EngineData) -> Result<()> {
        if let Some(handle) = self.handle {
            let current = data.node_instance(handle)?;
            self.rebase(current);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActivitySpec, NodeKind};

    fn builder() -> NodeInstanceBuilder {
        let node = Arc::new(ExecutableProcessNode::new(
            "a",
            NodeKind::Activity(ActivitySpec::default()),
        ));
        NodeInstanceBuilder::new(node, ProcessInstanceHandle(0), [], Principal::new("bob"), 1)
    }

    #[test]
    fn test_new_builder_is_changed_and_pending() {
        let b = builder();
        assert!(b.changed());
        assert_eq!(b.state(), NodeInstanceState::Pending);
        assert!(b.handle().is_none());
        assert!(b.build().is_err());
    }

    #[test]
    fn test_identical_assignment_is_not_a_change() {
        let mut b = builder();
        let snapshot = Arc::new(b.build_new(NodeInstanceHandle(4)));
        b.rebase(snapshot.clone());
        assert!(!b.changed());

        b.set_owner(Principal::new("bob"));
        b.set_state(NodeInstanceState::Pending).unwrap();
        assert!(!b.changed());
        assert!(Arc::ptr_eq(&b.build().unwrap(), &snapshot));

        b.set_state(NodeInstanceState::Sent).unwrap();
        assert!(b.changed());
        assert_eq!(b.build().unwrap().state(), NodeInstanceState::Sent);
    }

    #[test]
    fn test_final_state_guard() {
        let mut b = builder();
        b.set_state(NodeInstanceState::Complete).unwrap();
        let err = b.set_state(NodeInstanceState::Started).unwrap_err();
        assert!(matches!(err, EngineError::IllegalStateTransition { .. }));
        // only start nodes may be auto-cancelled after completing
        assert!(b.set_state(NodeInstanceState::AutoCancelled).is_err());
    }

    #[test]
    fn test_soft_update_only_from_expected() {
        let mut b = builder();
        assert!(!b
            .soft_update_state(NodeInstanceState::Sent, NodeInstanceState::Taken)
            .unwrap());
        assert!(b
            .soft_update_state(NodeInstanceState::Pending, NodeInstanceState::Sent)
            .unwrap());
        assert_eq!(b.state(), NodeInstanceState::Sent);
    }
}
