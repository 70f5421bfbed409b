use std::sync::Arc;

use super::{NodeInstance, NodeInstanceBuilder};
use crate::error::{EngineError, Result};
use crate::model::NodeId;
use crate::process_instance::ProcessInstanceBuilder;
use crate::types::*;

/// Successor outcome counts for one split instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SplitTally {
    skipped: usize,
    failed: usize,
    active: usize,
    committed: usize,
}

impl SplitTally {
    fn of(successors: &[Arc<NodeInstance>]) -> Self {
        let mut tally = Self::default();
        for successor in successors {
            let state = successor.state();
            if state.is_skipped()
                || matches!(state, NodeInstanceState::Cancelled | NodeInstanceState::AutoCancelled)
            {
                tally.skipped += 1;
            } else if state == NodeInstanceState::Failed {
                tally.failed += 1;
            }
            if state.is_active() {
                tally.active += 1;
            }
            if state.is_committed() {
                tally.committed += 1;
            }
        }
        tally
    }
}

/// Provide a branch that fired. A task failure the branch has already
/// recorded on itself (`FailRetry` awaiting a tickle, or `Failed`) stays with
/// the branch and is counted by the tally; only other errors reach the split.
fn provide_branch(
    owner: &mut ProcessInstanceBuilder<'_>,
    branch: &mut NodeInstanceBuilder,
) -> Result<()> {
    let err = match branch.provide_task(owner, true) {
        Ok(()) => return Ok(()),
        Err(err) if err.is_modeling_error() => return Err(err),
        Err(err) => err,
    };
    let recorded = match branch.handle() {
        Some(handle) => matches!(
            owner.data_ref().node_instance(handle)?.state(),
            NodeInstanceState::FailRetry | NodeInstanceState::Failed
        ),
        None => false,
    };
    if !recorded {
        return Err(err);
    }
    tracing::warn!(branch = %branch.describe(), error = %err, "branch failed, split keeps reconciling");
    Ok(())
}

impl NodeInstanceBuilder {
    /// Reconcile a split with its successors. Re-entrant: every call
    /// re-evaluates the undecided branches. Returns whether the split is
    /// done; the caller finishes it.
    pub(crate) fn update_split_state(&mut self, owner: &mut ProcessInstanceBuilder<'_>) -> Result<bool> {
        if self.state().is_final() {
            return Ok(true);
        }
        let handle = self.store(owner)?;
        let split = self.node().clone();
        let (min, max) = split.fan_bounds().unwrap_or((1, 1));
        let entry_no = self.entry_no();
        let model = owner.model()?;

        let mut committed = SplitTally::of(&owner.get_direct_successors_for(handle)?).committed;
        let mut direct_joins: Vec<NodeInstanceBuilder> = Vec::new();
        let mut otherwise: Option<NodeInstanceHandle> = None;

        for successor_id in &split.successors {
            if committed + direct_joins.len() >= max {
                break;
            }
            let successor = model.require_node(successor_id)?.clone();
            let condition = successor.condition_for(&split.id);
            if successor.is_join() && condition.is_none() {
                return Err(EngineError::UnconditionedJoin {
                    join: successor.id.to_string(),
                    split: split.id.to_string(),
                });
            }
            let is_otherwise = condition.is_some_and(|c| c.is_otherwise());

            let live_elsewhere = !successor.is_multi_instance()
                && owner
                    .get_children(successor_id)?
                    .iter()
                    .any(|c| c.entry_no() != entry_no && !c.state().is_final());
            if live_elsewhere {
                continue;
            }

            let mut builder = match owner.get_child_node_instance(successor_id, entry_no)? {
                Some(existing) => {
                    let mut builder = NodeInstanceBuilder::from_instance(existing);
                    builder.add_predecessor(handle);
                    builder
                }
                None => successor.create_or_reuse_instance(owner, Some(handle), entry_no)?,
            };
            let state = builder.state();
            if !(state == NodeInstanceState::Pending || (successor.is_join() && state.is_active())) {
                continue;
            }

            match owner.eval_condition(&successor, &split.id) {
                ConditionResult::True if successor.is_join() => {
                    builder.store(owner)?;
                    direct_joins.push(builder);
                }
                ConditionResult::True => {
                    builder.store(owner)?;
                    tracing::debug!(split = %self.describe(), branch = %successor.id, "branch fires");
                    provide_branch(owner, &mut builder)?;
                    self.invalidate_builder(owner.data_ref())?;
                    if self.state().is_final() {
                        return Ok(true);
                    }
                    committed = SplitTally::of(&owner.get_direct_successors_for(handle)?).committed;
                }
                ConditionResult::Never => {
                    tracing::debug!(split = %self.describe(), branch = %successor.id, "branch skipped");
                    builder.skip_task(owner, NodeInstanceState::Skipped)?;
                    self.invalidate_builder(owner.data_ref())?;
                    if self.state().is_final() {
                        return Ok(true);
                    }
                }
                ConditionResult::Maybe => {
                    let branch = builder.store(owner)?;
                    if is_otherwise {
                        otherwise = Some(branch);
                    }
                }
            }
        }

        let direct_join_count = direct_joins.len();
        for mut join in direct_joins {
            join.invalidate_builder(owner.data_ref())?;
            match join.state() {
                NodeInstanceState::Pending => join.provide_task(owner, true)?,
                state if state.is_active() => join.progress_join(owner, NodeInstanceState::Skipped)?,
                _ => {}
            }
            self.invalidate_builder(owner.data_ref())?;
            if self.state().is_final() {
                return Ok(true);
            }
        }

        let successors = owner.get_direct_successors_for(handle)?;
        let tally = SplitTally::of(&successors);
        let total = split.successors.len();

        if total.saturating_sub(tally.skipped + tally.failed) < min {
            tracing::info!(split = %self.describe(), ?tally, min, "split cannot reach its minimum");
            for successor in successors.iter().filter(|s| !s.state().is_final()) {
                if owner.data_ref().node_instance(successor.handle())?.state().is_final() {
                    continue;
                }
                owner.update_child(successor.handle(), |builder, owner| builder.cancel(owner))?;
            }
            self.invalidate_builder(owner.data_ref())?;
            if !self.state().is_final() {
                let reachable = total.saturating_sub(tally.skipped + tally.failed);
                self.fail_task(owner, format!("only {reachable} of {min} branches can still fire"))?;
            }
            return Ok(true);
        }

        if tally.committed + direct_join_count >= max {
            tracing::debug!(split = %self.describe(), ?tally, max, "split reached its maximum");
            self.close_other_branches(owner, handle, &split.successors)?;
            return Ok(true);
        }

        if tally.active == 0 && tally.skipped + tally.failed + tally.committed >= total {
            return Ok(true);
        }

        let unaccounted = self.unaccounted_branches(owner, handle, &split.successors)?;
        if let ([(_, Some(branch))], Some(fallback)) = (unaccounted.as_slice(), otherwise) {
            if *branch == fallback {
                tracing::debug!(split = %self.describe(), "otherwise branch fires");
                let mut builder = NodeInstanceBuilder::from_instance(owner.data_ref().node_instance(fallback)?);
                provide_branch(owner, &mut builder)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Successor nodes whose instance at this entry is neither committed nor
    /// final, paired with that instance if one exists.
    fn unaccounted_branches(
        &self,
        owner: &ProcessInstanceBuilder<'_>,
        handle: NodeInstanceHandle,
        successors: &[NodeId],
    ) -> Result<Vec<(NodeId, Option<NodeInstanceHandle>)>> {
        let linked = owner.get_direct_successors_for(handle)?;
        let mut open = Vec::new();
        for id in successors {
            match linked.iter().find(|s| &s.node().id == id) {
                Some(instance) if instance.state().is_final() || instance.state().is_committed() => {}
                Some(instance) => open.push((id.clone(), Some(instance.handle()))),
                None => open.push((id.clone(), None)),
            }
        }
        Ok(open)
    }

    /// Cancel and skip every branch that has not committed, materializing a
    /// skipped instance for branches never instantiated so that downstream
    /// joins see them accounted for.
    fn close_other_branches(
        &mut self,
        owner: &mut ProcessInstanceBuilder<'_>,
        handle: NodeInstanceHandle,
        successors: &[NodeId],
    ) -> Result<()> {
        let model = owner.model()?;
        for (id, instance) in self.unaccounted_branches(owner, handle, successors)? {
            match instance {
                Some(branch) => {
                    if owner.data_ref().node_instance(branch)?.state().is_final() {
                        continue;
                    }
                    owner.update_child(branch, |builder, owner| builder.cancel_and_skip(owner))?;
                }
                None => {
                    let node = model.require_node(&id)?.clone();
                    if owner.get_child_node_instance(&id, self.entry_no())?.is_some() {
                        continue;
                    }
                    let mut builder =
                        node.create_or_reuse_instance(owner, Some(handle), self.entry_no())?;
                    if node.is_join() {
                        builder.store(owner)?;
                    }
                    builder.skip_task(owner, NodeInstanceState::SkippedCancel)?;
                }
            }
        }
        self.invalidate_builder(owner.data_ref())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{child, started_process};

    const FIRST_OF_THREE: &str = r#"
id: first-of-three
nodes:
  - { kind: Start, id: start }
  - { kind: Split, id: split, max: 1 }
  - { kind: Activity, id: x1 }
  - { kind: Activity, id: x2 }
  - { kind: Activity, id: x3 }
  - { kind: Join, id: join }
  - { kind: End, id: end }
edges:
  - { from: start, to: split }
  - { from: split, to: x1, condition: always }
  - { from: split, to: x2, condition: always }
  - { from: split, to: x3, condition: always }
  - { from: x1, to: join }
  - { from: x2, to: join }
  - { from: x3, to: join }
  - { from: join, to: end }
"#;

    const OPEN_BRANCH: &str = r#"
id: open-branch
nodes:
  - { kind: Start, id: start }
  - { kind: Split, id: split, max: 2 }
  - { kind: Activity, id: a, manual: true }
  - { kind: Activity, id: b, manual: true }
  - { kind: Join, id: join }
  - { kind: End, id: end }
edges:
  - { from: start, to: split }
  - { from: split, to: a, condition: always }
  - { from: split, to: b, condition: await }
  - { from: a, to: join }
  - { from: b, to: join }
  - { from: join, to: end }
"#;

    #[test]
    fn test_max_bounds_committed_branches() {
        let (mut data, handle) = started_process(FIRST_OF_THREE);
        let mut owner = ProcessInstanceBuilder::new(&mut data, handle);

        let split = child(&owner, "split");
        let successors = owner.get_direct_successors_for(split.handle()).unwrap();
        let tally = SplitTally::of(&successors);
        assert_eq!(tally.committed, 1);
        assert_eq!(tally.skipped, 2);

        assert_eq!(child(&owner, "x1").state(), NodeInstanceState::Complete);
        for branch in ["x2", "x3"] {
            assert_eq!(child(&owner, branch).state(), NodeInstanceState::SkippedCancel, "{branch}");
        }
        assert_eq!(split.state(), NodeInstanceState::Complete);
        assert_eq!(owner.state().unwrap(), ProcessInstanceState::Finished);

        // a decided split stays decided
        let mut builder = NodeInstanceBuilder::from_instance(split);
        assert!(builder.update_split_state(&mut owner).unwrap());
    }

    #[test]
    fn test_reconciliation_is_reentrant() {
        let (mut data, handle) = started_process(OPEN_BRANCH);
        let mut owner = ProcessInstanceBuilder::new(&mut data, handle);
        let split = child(&owner, "split");
        assert_eq!(split.state(), NodeInstanceState::Started);
        assert_eq!(child(&owner, "a").state(), NodeInstanceState::Sent);
        assert_eq!(child(&owner, "b").state(), NodeInstanceState::Pending);
        let children = owner.instance().unwrap().children().len();

        for _ in 0..2 {
            let mut builder = NodeInstanceBuilder::from_instance(split.clone());
            assert!(!builder.update_split_state(&mut owner).unwrap());
        }
        assert_eq!(owner.instance().unwrap().children().len(), children);
        assert_eq!(child(&owner, "b").state(), NodeInstanceState::Pending);

        let open = NodeInstanceBuilder::from_instance(child(&owner, "split"))
            .unaccounted_branches(&owner, split.handle(), &split.node().successors)
            .unwrap();
        let open: Vec<_> = open.into_iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(open, ["a", "b"]);
    }
}
