use std::collections::{BTreeSet, VecDeque};

use super::NodeInstanceBuilder;
use crate::error::{EngineError, Result};
use crate::process_instance::ProcessInstanceBuilder;
use crate::pseudo::{InstanceRef, PseudoContext};
use crate::types::*;

/// How the declared predecessors of a join have turned out so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct JoinTally {
    pub total: usize,
    pub complete: usize,
    pub skipped_or_never: usize,
    pub realized: usize,
}

impl JoinTally {
    pub fn pending(&self) -> usize {
        self.total - self.complete - self.skipped_or_never
    }
}

impl NodeInstanceBuilder {
    /// Link final predecessor instances at this entry that reached the join
    /// without passing through it, e.g. skipped branches.
    fn link_realized_predecessors(&mut self, owner: &ProcessInstanceBuilder<'_>) -> Result<()> {
        for id in &self.node().predecessors.clone() {
            let linked = self.predecessors().iter().any(|handle| {
                owner
                    .data_ref()
                    .node_instance(*handle)
                    .is_ok_and(|p| &p.node().id == id)
            });
            if linked {
                continue;
            }
            if let Some(instance) = owner.get_child_node_instance(id, self.entry_no())? {
                if instance.state().is_final() {
                    self.add_predecessor(instance.handle());
                }
            }
        }
        Ok(())
    }

    fn join_tally(&self, owner: &ProcessInstanceBuilder<'_>, must_decide: bool) -> Result<JoinTally> {
        let mut tally = JoinTally {
            total: self.node().predecessors.len(),
            ..Default::default()
        };
        let mut linked = Vec::new();
        for handle in self.predecessors() {
            linked.push(owner.data_ref().node_instance(*handle)?);
        }
        for id in &self.node().predecessors {
            let Some(instance) = linked
                .iter()
                .filter(|p| &p.node().id == id)
                .max_by_key(|p| p.entry_no())
            else {
                continue;
            };
            let state = instance.state();
            // a split counts as arrived once it is running
            let arrived = if instance.node().is_split() {
                state.is_committed()
            } else {
                state == NodeInstanceState::Complete
            };
            if arrived {
                tally.realized += 1;
                match owner.eval_condition(self.node(), id) {
                    ConditionResult::True => tally.complete += 1,
                    ConditionResult::Never => tally.skipped_or_never += 1,
                    ConditionResult::Maybe if must_decide => tally.skipped_or_never += 1,
                    ConditionResult::Maybe => {}
                }
            } else if state.is_final() {
                tally.realized += 1;
                tally.skipped_or_never += 1;
            }
        }
        Ok(tally)
    }

    fn all_predecessors_realized(&self, owner: &ProcessInstanceBuilder<'_>) -> Result<bool> {
        Ok(self.join_tally(owner, false)?.realized == self.node().predecessors.len())
    }

    /// Reconcile a join with its predecessors. Returns whether the join is
    /// decided: either enough branches completed, or it can no longer
    /// succeed and has been failed or skipped via `cancel_state`.
    pub(crate) fn update_join_state(
        &mut self,
        owner: &mut ProcessInstanceBuilder<'_>,
        cancel_state: NodeInstanceState,
    ) -> Result<bool> {
        if self.state().is_final() {
            return Ok(true);
        }
        let (min, max) = self.node().fan_bounds().unwrap_or((1, 1));
        self.link_realized_predecessors(owner)?;

        let must_decide = self.all_predecessors_realized(owner)?;
        if must_decide && self.state() != NodeInstanceState::Started {
            self.set_state(NodeInstanceState::Started)?;
        }
        self.store(owner)?;

        let tally = self.join_tally(owner, must_decide)?;
        tracing::debug!(join = %self.describe(), ?tally, must_decide, "join reconciliation");

        if tally.total - tally.skipped_or_never < min {
            if tally.complete > 0 {
                self.fail_task(
                    owner,
                    format!(
                        "{} of {min} required branches completed, the rest will not arrive",
                        tally.complete
                    ),
                )?;
            } else {
                self.apply_cancel_state(owner, cancel_state)?;
            }
            return Ok(true);
        }

        if tally.complete >= min
            && (tally.pending() == 0 || tally.complete >= max || must_decide)
        {
            return Ok(true);
        }

        // unreachable with MAYBE resolved as NEVER above, kept as a backstop
        if must_decide {
            self.apply_cancel_state(owner, cancel_state)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn apply_cancel_state(
        &mut self,
        owner: &mut ProcessInstanceBuilder<'_>,
        cancel_state: NodeInstanceState,
    ) -> Result<()> {
        tracing::info!(join = %self.describe(), state = %cancel_state, "join cannot succeed");
        match cancel_state {
            NodeInstanceState::Failed => self.fail_task(owner, "join cannot reach its minimum"),
            state if state.is_skipped() && state != NodeInstanceState::SkippedInvalidated => {
                self.set_state(state)?;
                self.store(owner)?;
                self.skip_predecessors(owner)?;
                let snapshot = self.build()?;
                owner.skip_successors(&snapshot, state)?;
                owner.update_state()
            }
            _ => self.cancel_and_skip(owner),
        }
    }

    /// Reconcile and finish the join if that decided it.
    pub(crate) fn progress_join(
        &mut self,
        owner: &mut ProcessInstanceBuilder<'_>,
        cancel_state: NodeInstanceState,
    ) -> Result<()> {
        let done = self.update_join_state(owner, cancel_state)?;
        self.invalidate_builder(owner.data_ref())?;
        if done && !self.state().is_final() {
            self.finish_task(owner, None)?;
        }
        Ok(())
    }

    /// A skip reaching a join is one more predecessor accounted for; the join
    /// itself is only skipped when it can no longer succeed.
    pub(super) fn skip_join(
        &mut self,
        owner: &mut ProcessInstanceBuilder<'_>,
        skip_state: NodeInstanceState,
    ) -> Result<()> {
        self.progress_join(owner, skip_state)
    }

    /// Finishing gate: enough branches must have completed.
    pub(super) fn check_join_quorum(&self, owner: &ProcessInstanceBuilder<'_>) -> Result<()> {
        let (min, _) = self.node().fan_bounds().unwrap_or((1, 1));
        let tally = self.join_tally(owner, true)?;
        if tally.complete < min {
            return Err(EngineError::JoinQuorumNotMet {
                join: self.describe(),
                complete: tally.complete,
                min,
            });
        }
        Ok(())
    }

    /// Cancel and skip every unfinished instance upstream of this join, up to
    /// the nearest split. Multi-merge joins leave their predecessors alone.
    pub(crate) fn skip_predecessors(&mut self, owner: &mut ProcessInstanceBuilder<'_>) -> Result<()> {
        if self.node().is_multi_merge() {
            return Ok(());
        }
        let Some(handle) = self.handle() else {
            return Ok(());
        };

        let mut context = PseudoContext::new(owner)?;
        let target = InstanceRef::Real(handle);
        context.populate_predecessors_for(target);

        let mut queue: VecDeque<InstanceRef> = context.predecessors(target).into_iter().collect();
        let mut seen = BTreeSet::new();
        let mut doomed = Vec::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            let Some(view) = context.get_node_instance(current) else {
                continue;
            };
            if view.state().is_final() {
                continue;
            }
            // splits stay live for their other branches; the walk goes on past them
            if view.node().is_split() {
                queue.extend(context.predecessors(current));
                continue;
            }
            match current {
                InstanceRef::Real(real) => doomed.push(real),
                InstanceRef::Pseudo(pseudo) => {
                    context.set_state(pseudo, NodeInstanceState::AutoCancelled)
                }
            }
            queue.extend(context.predecessors(current));
        }
        tracing::debug!(
            join = %self.describe(),
            stragglers = doomed.len(),
            speculative = context.pseudo_count(),
            "predecessor walk done"
        );
        drop(context);

        for straggler in doomed {
            if owner.data_ref().node_instance(straggler)?.state().is_final() {
                continue;
            }
            tracing::debug!(join = %self.describe(), %straggler, "cancelling straggler");
            owner.update_child(straggler, |builder, owner| builder.cancel_and_skip(owner))?;
        }
        self.invalidate_builder(owner.data_ref())?;
        Ok(())
    }
}
