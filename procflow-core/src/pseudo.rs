//! Speculative overlay over the stored instances of one process.
//!
//! Answers "which instances would precede this one" for branches that were
//! never instantiated. Speculative instances live in their own address
//! space (`PseudoHandle`) and are dropped with the context; nothing here is
//! ever stored.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::error::Result;
use crate::model::{ExecutableProcessModel, ExecutableProcessNode};
use crate::node_instance::{NodeInstance, NodeInstanceView};
use crate::process_instance::ProcessInstanceBuilder;
use crate::types::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PseudoHandle(pub u32);

/// A node instance that is either stored or speculative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstanceRef {
    Real(NodeInstanceHandle),
    Pseudo(PseudoHandle),
}

#[derive(Clone, Debug)]
pub struct PseudoInstance {
    node: Arc<ExecutableProcessNode>,
    entry_no: u32,
    state: NodeInstanceState,
    predecessors: BTreeSet<InstanceRef>,
}

impl PseudoInstance {
    pub fn predecessors(&self) -> &BTreeSet<InstanceRef> {
        &self.predecessors
    }
}

impl NodeInstanceView for PseudoInstance {
    fn node(&self) -> &Arc<ExecutableProcessNode> {
        &self.node
    }

    fn entry_no(&self) -> u32 {
        self.entry_no
    }

    fn state(&self) -> NodeInstanceState {
        self.state
    }
}

pub struct PseudoContext {
    model: Arc<ExecutableProcessModel>,
    real: BTreeMap<NodeInstanceHandle, Arc<NodeInstance>>,
    /// Derived links onto stored instances, kept apart from the snapshots.
    extra_links: BTreeMap<NodeInstanceHandle, BTreeSet<InstanceRef>>,
    pseudo: Vec<PseudoInstance>,
}

impl PseudoContext {
    /// Snapshot the children of `owner`.
    pub fn new(owner: &ProcessInstanceBuilder<'_>) -> Result<Self> {
        let real = owner
            .all_child_node_instances(|child| child.state() != NodeInstanceState::SkippedInvalidated)?
            .into_iter()
            .map(|child| (child.handle(), child))
            .collect();
        Ok(Self {
            model: owner.model()?,
            real,
            extra_links: BTreeMap::new(),
            pseudo: Vec::new(),
        })
    }

    pub fn get_node_instance(&self, instance: InstanceRef) -> Option<&dyn NodeInstanceView> {
        match instance {
            InstanceRef::Real(handle) => self
                .real
                .get(&handle)
                .map(|i| i.as_ref() as &dyn NodeInstanceView),
            InstanceRef::Pseudo(handle) => self
                .pseudo
                .get(handle.0 as usize)
                .map(|i| i as &dyn NodeInstanceView),
        }
    }

    /// Stored and derived predecessors of `instance`.
    pub fn predecessors(&self, instance: InstanceRef) -> Vec<InstanceRef> {
        match instance {
            InstanceRef::Real(handle) => {
                let mut found: BTreeSet<InstanceRef> = self
                    .real
                    .get(&handle)
                    .map(|i| i.predecessors().iter().map(|p| InstanceRef::Real(*p)).collect())
                    .unwrap_or_default();
                if let Some(extra) = self.extra_links.get(&handle) {
                    found.extend(extra.iter().copied());
                }
                found.into_iter().collect()
            }
            InstanceRef::Pseudo(handle) => self
                .pseudo
                .get(handle.0 as usize)
                .map(|i| i.predecessors().iter().copied().collect())
                .unwrap_or_default(),
        }
    }

    pub fn pseudo_count(&self) -> usize {
        self.pseudo.len()
    }

    pub fn set_state(&mut self, handle: PseudoHandle, state: NodeInstanceState) {
        if let Some(instance) = self.pseudo.get_mut(handle.0 as usize) {
            instance.state = state;
        }
    }

    /// The instance of `node` at `entry_no` reached from `predecessor`:
    /// a stored instance already linked to it, a stored instance at that
    /// entry, a speculative one, or a new speculative one.
    pub fn get_or_create(
        &mut self,
        predecessor: InstanceRef,
        node: &Arc<ExecutableProcessNode>,
        entry_no: u32,
    ) -> InstanceRef {
        if let InstanceRef::Real(pred) = predecessor {
            if let Some(handle) = self
                .real
                .values()
                .find(|i| i.node().id == node.id && i.predecessors().contains(&pred))
                .map(|i| i.handle())
            {
                return InstanceRef::Real(handle);
            }
        }

        if let Some(handle) = self
            .real
            .values()
            .find(|i| i.node().id == node.id && i.entry_no() == entry_no)
            .map(|i| i.handle())
        {
            self.extra_links
                .entry(handle)
                .or_default()
                .insert(predecessor);
            return InstanceRef::Real(handle);
        }

        if let Some(index) = self
            .pseudo
            .iter()
            .position(|p| p.node.id == node.id && p.entry_no == entry_no)
        {
            self.pseudo[index].predecessors.insert(predecessor);
            return InstanceRef::Pseudo(PseudoHandle(index as u32));
        }

        let handle = PseudoHandle(self.pseudo.len() as u32);
        self.pseudo.push(PseudoInstance {
            node: node.clone(),
            entry_no,
            state: NodeInstanceState::Pending,
            predecessors: [predecessor].into_iter().collect(),
        });
        InstanceRef::Pseudo(handle)
    }

    /// Derive the full predecessor set of `target` by replaying the graph
    /// forward from every start instance that can reach it.
    pub fn populate_predecessors_for(&mut self, target: InstanceRef) {
        let Some(target_node) = self.get_node_instance(target).map(|t| t.node().id.clone()) else {
            return;
        };

        let mut queue: VecDeque<InstanceRef> = self
            .real
            .values()
            .filter(|i| i.node().is_start() && self.model.can_reach(&i.node().id, &target_node))
            .map(|i| InstanceRef::Real(i.handle()))
            .collect();
        let mut visited = BTreeSet::new();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            let Some((node, entry_no)) = self
                .get_node_instance(current)
                .map(|v| (v.node().clone(), v.entry_no()))
            else {
                continue;
            };
            if node.id == target_node {
                continue;
            }
            for successor_id in &node.successors {
                if !self.model.can_reach(successor_id, &target_node) {
                    continue;
                }
                let Some(successor) = self.model.node(successor_id).cloned() else {
                    continue;
                };
                let next = self.get_or_create(current, &successor, entry_no);
                queue.push_back(next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeId;
    use crate::testing::{child, started_process};

    const FORK: &str = r#"
id: fork
nodes:
  - { kind: Start, id: start }
  - { kind: Split, id: split }
  - { kind: Activity, id: a, manual: true }
  - { kind: Activity, id: c, manual: true }
  - { kind: Join, id: join }
  - { kind: End, id: end }
edges:
  - { from: start, to: split }
  - { from: split, to: a, condition: always }
  - { from: split, to: c, condition: always }
  - { from: a, to: join }
  - { from: c, to: join }
  - { from: join, to: end }
"#;

    fn node(owner: &ProcessInstanceBuilder<'_>, id: &str) -> Arc<ExecutableProcessNode> {
        owner.model().unwrap().require_node(&NodeId::new(id)).unwrap().clone()
    }

    #[test]
    fn test_get_or_create_prefers_stored_instances() {
        let (mut data, handle) = started_process(FORK);
        let owner = ProcessInstanceBuilder::new(&mut data, handle);
        let start = InstanceRef::Real(child(&owner, "start").handle());
        let split = child(&owner, "split").handle();
        let a = InstanceRef::Real(child(&owner, "a").handle());
        let c = InstanceRef::Real(child(&owner, "c").handle());
        let mut context = PseudoContext::new(&owner).unwrap();

        assert_eq!(
            context.get_or_create(start, &node(&owner, "split"), 1),
            InstanceRef::Real(split)
        );

        let join = context.get_or_create(a, &node(&owner, "join"), 1);
        assert!(matches!(join, InstanceRef::Pseudo(PseudoHandle(0))));
        assert_eq!(context.get_or_create(c, &node(&owner, "join"), 1), join);
        assert_eq!(context.predecessors(join), vec![a, c]);
        assert_eq!(context.pseudo_count(), 1);

        let view = context.get_node_instance(join).unwrap();
        assert_eq!(view.state(), NodeInstanceState::Pending);
        assert_eq!(view.entry_no(), 1);

        context.set_state(PseudoHandle(0), NodeInstanceState::AutoCancelled);
        assert_eq!(
            context.get_node_instance(join).unwrap().state(),
            NodeInstanceState::AutoCancelled
        );
        // nothing speculative reaches the engine data
        assert!(owner.get_child_node_instance(&NodeId::new("join"), 1).unwrap().is_none());
    }

    #[test]
    fn test_populate_derives_unrealized_predecessors() {
        let (mut data, handle) = started_process(FORK);
        let owner = ProcessInstanceBuilder::new(&mut data, handle);
        let a = InstanceRef::Real(child(&owner, "a").handle());
        let c = InstanceRef::Real(child(&owner, "c").handle());
        let mut context = PseudoContext::new(&owner).unwrap();

        let join = context.get_or_create(a, &node(&owner, "join"), 1);
        let end = context.get_or_create(join, &node(&owner, "end"), 1);
        context.populate_predecessors_for(end);

        assert_eq!(context.predecessors(end), vec![join]);
        assert_eq!(context.predecessors(join), vec![a, c]);
        assert_eq!(context.pseudo_count(), 2);
    }

    #[test]
    fn test_derived_links_onto_stored_instances() {
        let (mut data, handle) = started_process(FORK);
        let mut owner = ProcessInstanceBuilder::new(&mut data, handle);
        // the join exists once one branch has reached it
        let c = child(&owner, "c");
        let mut builder = crate::node_instance::NodeInstanceBuilder::from_instance(c.clone());
        builder.start_task(&mut owner, true).unwrap();
        builder.finish_task(&mut owner, None).unwrap();
        let join = child(&owner, "join");
        let a = child(&owner, "a");
        assert!(!join.predecessors().contains(&a.handle()));

        let mut context = PseudoContext::new(&owner).unwrap();
        let target = InstanceRef::Real(join.handle());
        context.populate_predecessors_for(target);

        assert_eq!(
            context.predecessors(target),
            vec![InstanceRef::Real(a.handle()), InstanceRef::Real(c.handle())]
        );
        assert_eq!(context.pseudo_count(), 0);
    }
}
