//! State-machine properties under random operation sequences.

use std::collections::BTreeMap;

use proptest::prelude::*;

use procflow_core::{
    EngineEvent, NodeId, NodeInstanceState, Principal, ProcessEngine, ProcessInstanceHandle,
};

const PARALLEL: &str = r#"
id: parallel
nodes:
  - { kind: Start, id: start }
  - { kind: Split, id: split, min: 1, max: 2 }
  - { kind: Activity, id: a, manual: true }
  - { kind: Activity, id: b, manual: true }
  - { kind: Join, id: join, min: 1 }
  - { kind: Activity, id: wrap_up, manual: true }
  - { kind: End, id: end }
edges:
  - { from: start, to: split }
  - { from: split, to: a, condition: always }
  - { from: split, to: b, condition: await }
  - { from: a, to: join }
  - { from: b, to: join }
  - { from: join, to: wrap_up }
  - { from: wrap_up, to: end }
"#;

#[derive(Clone, Copy, Debug)]
enum Op {
    Take,
    Start,
    Finish,
    Cancel,
    Fail,
    Tickle,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Take),
        Just(Op::Start),
        Just(Op::Finish),
        Just(Op::Cancel),
        Just(Op::Fail),
        Just(Op::Tickle),
    ]
}

/// Split over automatic branches `x0..xn`, one per verdict, merging in a join.
fn fan_out_model(verdicts: &[&str], max: usize, join_min: usize) -> String {
    let mut yaml = format!(
        "id: fan-out\nnodes:\n  - {{ kind: Start, id: start }}\n  - {{ kind: Split, id: split, max: {max} }}\n"
    );
    for i in 0..verdicts.len() {
        yaml += &format!("  - {{ kind: Activity, id: x{i} }}\n");
    }
    yaml += &format!(
        "  - {{ kind: Join, id: join, min: {join_min} }}\n  - {{ kind: End, id: end }}\nedges:\n  - {{ from: start, to: split }}\n"
    );
    for (i, verdict) in verdicts.iter().enumerate() {
        yaml += &format!("  - {{ from: split, to: x{i}, condition: {verdict} }}\n");
        yaml += &format!("  - {{ from: x{i}, to: join }}\n");
    }
    yaml += "  - { from: join, to: end }\n";
    yaml
}

/// Branch verdicts plus a split maximum and a join minimum that fit them.
fn fan_out() -> impl Strategy<Value = (Vec<&'static str>, usize, usize)> {
    prop::collection::vec(prop_oneof![Just("always"), Just("never"), Just("await")], 2..=4)
        .prop_flat_map(|verdicts| {
            let n = verdicts.len();
            (Just(verdicts), 1..=n, 1..=n)
        })
}

/// Register the fan-out model and start it; start failures stay recorded.
fn run_fan_out(verdicts: &[&str], max: usize, join_min: usize) -> (ProcessEngine, ProcessInstanceHandle) {
    let mut engine = ProcessEngine::default();
    engine.register_yaml(&fan_out_model(verdicts, max, join_min)).unwrap();
    let _ = engine.start_process("fan-out", None, vec![]);
    let process = engine.data().process_instances().next().unwrap().handle();
    (engine, process)
}

/// Apply `op` to the `pick`-th unfinished instance, ignoring rejections.
fn apply(engine: &mut ProcessEngine, process: ProcessInstanceHandle, op: Op, pick: usize) {
    let open: Vec<_> = engine
        .children(process)
        .unwrap()
        .into_iter()
        .filter(|child| !child.state().is_final())
        .collect();
    if open.is_empty() {
        return;
    }
    let target = open[pick % open.len()].handle();
    let _ = match op {
        Op::Take => engine.take_task(target, Some(Principal::new("prop"))),
        Op::Start => engine.start_task(target),
        Op::Finish => engine.finish_task(target, None),
        Op::Cancel => engine.cancel_task(target),
        Op::Fail => engine.fail_task(target, "random failure"),
        Op::Tickle => engine.tickle(target),
    };
}

proptest! {
    #[test]
    fn final_states_are_monotonic(steps in prop::collection::vec((op(), 0usize..8), 1..16)) {
        let mut engine = ProcessEngine::default();
        engine.register_yaml(PARALLEL).unwrap();
        let process = engine.start_process("parallel", None, vec![]).unwrap();

        for (op, pick) in steps {
            apply(&mut engine, process, op, pick);
            // every operation commits, whatever its outcome
            prop_assert_eq!(engine.data().pending_writes(), 0);
        }

        for (_, event) in engine.data().events_since(0) {
            if let EngineEvent::NodeStateChanged { node, from, to, .. } = event {
                if from.is_final() {
                    let allowed = (from.is_skipped() && to == NodeInstanceState::SkippedInvalidated)
                        || (from == NodeInstanceState::Complete
                            && to == NodeInstanceState::AutoCancelled
                            && node == NodeId::new("start"));
                    prop_assert!(allowed, "{} left final state {} for {}", node, from, to);
                }
            }
        }
    }

    #[test]
    fn one_live_instance_per_entry(steps in prop::collection::vec((op(), 0usize..8), 1..16)) {
        let mut engine = ProcessEngine::default();
        engine.register_yaml(PARALLEL).unwrap();
        let process = engine.start_process("parallel", None, vec![]).unwrap();

        for (op, pick) in steps {
            apply(&mut engine, process, op, pick);
            let mut live: BTreeMap<(NodeId, u32), usize> = BTreeMap::new();
            for child in engine.children(process).unwrap() {
                if child.state() != NodeInstanceState::SkippedInvalidated {
                    *live.entry((child.node().id.clone(), child.entry_no())).or_default() += 1;
                }
            }
            for ((node, entry), count) in live {
                prop_assert!(count == 1, "{} has {} live instances at entry {}", node, count, entry);
            }
        }
    }

    #[test]
    fn settled_process_has_only_final_children(steps in prop::collection::vec((op(), 0usize..8), 1..24)) {
        let mut engine = ProcessEngine::default();
        engine.register_yaml(PARALLEL).unwrap();
        let process = engine.start_process("parallel", None, vec![]).unwrap();

        for (op, pick) in steps {
            apply(&mut engine, process, op, pick);
        }
        if engine.process_instance(process).unwrap().state().is_final() {
            for child in engine.children(process).unwrap() {
                prop_assert!(child.state().is_final(), "{} is still {}", child.node().id, child.state());
            }
        }
    }

    #[test]
    fn split_never_commits_past_max((verdicts, max, join_min) in fan_out()) {
        let (engine, process) = run_fan_out(&verdicts, max, join_min);
        let children = engine.children(process).unwrap();
        let split = children.iter().find(|c| c.node().id == NodeId::new("split")).unwrap();

        let committed = children
            .iter()
            .filter(|c| c.predecessors().contains(&split.handle()) && c.state().is_committed())
            .count();
        prop_assert!(committed <= max, "{} branches committed, max {}", committed, max);
        if verdicts.iter().filter(|v| **v == "always").count() >= max {
            prop_assert_eq!(committed, max);
        }
    }

    #[test]
    fn join_decision_matches_branch_outcomes((verdicts, max, join_min) in fan_out()) {
        let (engine, process) = run_fan_out(&verdicts, max, join_min);
        let children = engine.children(process).unwrap();
        let completed = children
            .iter()
            .filter(|c| c.node().successors.contains(&NodeId::new("join")))
            .filter(|c| c.state() == NodeInstanceState::Complete)
            .count();
        let Some(join) = children.iter().find(|c| c.node().id == NodeId::new("join")) else {
            return Ok(());
        };
        match join.state() {
            NodeInstanceState::Complete => prop_assert!(completed >= join_min),
            NodeInstanceState::Failed => prop_assert!(completed > 0 && completed < join_min),
            // branches may still complete after the join gave up on them
            state if state.is_skipped() => prop_assert!(completed < join_min),
            _ => {}
        }
    }
}
