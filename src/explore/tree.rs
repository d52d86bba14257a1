//! The backtracking tree.
//!
//! Each node is a scheduling prefix (the path from the root), each
//! edge a thread choice. A node remembers the runnable set it saw,
//! the action each explored child took, and the alternatives still to
//! be tried (`backtrack`, with a conservative flag for points added
//! because the preemption bound introduces artificial dependencies).
//! An entry of `backtrack` whose thread has no child edge yet is an
//! unexplored leaf for the search loop to descend to.

use std::collections::BTreeMap;

use crate::trace::dependence::dependent_lookahead;
use crate::trace::{Decision, Lookahead, ThreadAction};
use crate::types::{MemType, ThreadId};

/// One scheduling point of a finished execution, as the search sees
/// it: the runnable set offered to the scheduler, the decision taken,
/// and the action that ran.
#[derive(Debug, Clone)]
pub(crate) struct SchedStep {
    pub chosen: ThreadId,
    pub decision: Decision,
    pub action: ThreadAction,
    pub runnable: BTreeMap<ThreadId, Lookahead>,
}

/// A node of the backtracking tree.
#[derive(Debug, Default)]
pub(crate) struct Node {
    /// Runnable set observed when this prefix was first reached.
    /// Empty means the node has never been visited.
    pub runnable: BTreeMap<ThreadId, Lookahead>,
    /// Alternatives to explore: thread id to conservative flag.
    pub backtrack: BTreeMap<ThreadId, bool>,
    /// Explored edges and the action each ran.
    pub taken: BTreeMap<ThreadId, ThreadAction>,
    pub children: BTreeMap<ThreadId, Node>,
}

impl Node {
    fn visited(&self) -> bool {
        !self.runnable.is_empty()
    }

    /// Backtrack targets not yet explored.
    fn todo(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.backtrack
            .keys()
            .copied()
            .filter(|t| !self.children.contains_key(t))
    }
}

/// Finds the next unexplored scheduling prefix, shallowest first.
pub(crate) fn find_prefix(root: &Node) -> Option<Vec<ThreadId>> {
    if !root.visited() {
        return Some(Vec::new());
    }
    let mut path = Vec::new();
    find_in(root, &mut path)
}

fn find_in(node: &Node, path: &mut Vec<ThreadId>) -> Option<Vec<ThreadId>> {
    if let Some(target) = node.todo().next() {
        let mut prefix = path.clone();
        prefix.push(target);
        return Some(prefix);
    }
    for (thread, child) in &node.children {
        path.push(*thread);
        if let Some(prefix) = find_in(child, path) {
            return Some(prefix);
        }
        path.pop();
    }
    None
}

/// Grows the tree with the steps of a finished execution, marking the
/// taken edges as explored.
pub(crate) fn incorporate(root: &mut Node, steps: &[SchedStep]) {
    let mut node = root;
    for step in steps {
        if !node.visited() {
            node.runnable = step.runnable.clone();
        }
        node.taken.insert(step.chosen, step.action.clone());
        node = node.children.entry(step.chosen).or_default();
    }
}

/// Inserts backtracking points derived from one execution.
///
/// For every scheduling point and every runnable thread at it, the
/// most recent earlier step whose action is dependent with that
/// thread's pending action becomes a backtrack point targeting the
/// thread; a conservative point is added at the context switch
/// immediately before it. Candidates whose prefix would exceed the
/// preemption bound are discarded.
pub(crate) fn add_backtracks(
    root: &mut Node,
    steps: &[SchedStep],
    mem: MemType,
    bound: u32,
) {
    for j in 0..steps.len() {
        for (&u, look) in &steps[j].runnable {
            let race = (0..j).rev().find(|&i| {
                steps[i].chosen != u
                    && dependent_lookahead(mem, steps[i].chosen, &steps[i].action, u, look)
            });
            let Some(i) = race else { continue };
            backtrack_at(root, steps, i, u, false, bound);
            if let Some(c) = last_context_switch(steps, i) {
                backtrack_at(root, steps, c, u, true, bound);
            }
        }
    }
}

/// The most recent context switch strictly before `i` (the first step
/// of an execution is a start, not a switch).
fn last_context_switch(steps: &[SchedStep], i: usize) -> Option<usize> {
    (1..i)
        .rev()
        .find(|&c| !matches!(steps[c].decision, Decision::Continue))
}

/// Records `target` as an alternative at step `i`, if the resulting
/// prefix respects the preemption bound. When the target was not
/// runnable there, every runnable thread is added instead.
fn backtrack_at(
    root: &mut Node,
    steps: &[SchedStep],
    i: usize,
    target: ThreadId,
    conservative: bool,
    bound: u32,
) {
    let Some(node) = node_at(root, steps, i) else {
        return;
    };
    let candidates: Vec<ThreadId> = if node.runnable.contains_key(&target) {
        vec![target]
    } else {
        node.runnable.keys().copied().collect()
    };
    for candidate in candidates {
        if node.children.contains_key(&candidate) {
            continue;
        }
        if !within_bound(steps, i, candidate, bound) {
            continue;
        }
        node.backtrack
            .entry(candidate)
            .and_modify(|c| *c &= conservative)
            .or_insert(conservative);
    }
}

fn node_at<'a>(root: &'a mut Node, steps: &[SchedStep], i: usize) -> Option<&'a mut Node> {
    let mut node = root;
    for step in &steps[..i] {
        node = node.children.get_mut(&step.chosen)?;
    }
    Some(node)
}

/// Preemptions in `steps[..i]` plus the candidate decision at `i`.
fn within_bound(steps: &[SchedStep], i: usize, candidate: ThreadId, bound: u32) -> bool {
    let mut count = 0_u32;
    for m in 1..i {
        if let Decision::SwitchTo(t) = steps[m].decision {
            if !t.is_commit() && !steps[m - 1].action.is_yield_like() {
                count += 1;
            }
        }
    }
    if i > 0 {
        let prior = steps[i - 1].chosen;
        let prior_runnable = steps[i].runnable.contains_key(&prior);
        let preempts = candidate != prior
            && prior_runnable
            && !candidate.is_commit()
            && !steps[i - 1].action.is_yield_like();
        if preempts {
            count += 1;
        }
    }
    count <= bound
}

/// Discards pending alternatives that consist only of commit threads
/// at nodes where every explored action synchronises anyway — the
/// commits are confluent there and add no observable schedules.
pub(crate) fn prune_commits(node: &mut Node) {
    let todo_all_commits = {
        let mut todo = node.todo().peekable();
        todo.peek().is_some() && node.todo().all(|t| t.is_commit())
    };
    let taken_all_sync =
        !node.taken.is_empty() && node.taken.values().all(ThreadAction::is_barrier);
    if todo_all_commits && taken_all_sync {
        let keep: Vec<ThreadId> = node
            .backtrack
            .keys()
            .copied()
            .filter(|t| node.children.contains_key(t))
            .collect();
        node.backtrack.retain(|t, _| keep.contains(t));
    }
    for child in node.children.values_mut() {
        prune_commits(child);
    }
}
