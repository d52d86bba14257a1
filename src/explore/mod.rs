//! Systematic exploration of schedules.
//!
//! The search driver repeatedly executes a program, each time with a
//! scheduling prefix taken from the backtracking tree: the prefix is
//! replayed decision for decision, and from there the BPOR scheduler
//! continues non-preemptively. Every finished execution grows the
//! tree, inserts backtracking points where dependent steps could have
//! been reordered (within the preemption bound), prunes confluent
//! commit-only alternatives, and the loop ends when no unexplored
//! point remains.
//!
//! A seeded random walk ([`search_random`]) is available as a cheaper
//! companion when systematic coverage is not needed.

pub(crate) mod tree;

mod report;

pub use report::SearchReport;

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use crate::error::ExecResult;
use crate::program::Action;
use crate::runtime::driver::run_execution;
use crate::sched::{RandomScheduler, Scheduler};
use crate::trace::{Lookahead, ThreadAction, Trace};
use crate::types::{MemType, ThreadId};

use tree::{add_backtracks, find_prefix, incorporate, prune_commits, Node, SchedStep};

/// Tuning for a systematic search.
///
/// Built in the move-based builder style: each method consumes the
/// config and returns the updated one.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Preemption bound (`blim`).
    pub preemption_bound: u32,
    /// Initial capability count exposed to programs.
    pub capabilities: usize,
    /// Hard ceiling on the number of executions, as a safety valve.
    pub max_executions: Option<u64>,
    /// Hard ceiling on steps per execution; exceeding it reports
    /// `Abort` for that execution.
    pub max_steps: Option<u64>,
}

impl SearchConfig {
    /// A search with the given preemption bound and the conventional
    /// two capabilities.
    #[must_use]
    pub fn new(preemption_bound: u32) -> Self {
        Self {
            preemption_bound,
            capabilities: 2,
            max_executions: None,
            max_steps: None,
        }
    }

    #[must_use]
    pub fn capabilities(mut self, capabilities: usize) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn max_executions(mut self, max_executions: u64) -> Self {
        self.max_executions = Some(max_executions);
        self
    }

    #[must_use]
    pub fn max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }
}

/// The BPOR scheduler: replays a prefix, then continues
/// non-preemptively, recording the runnable set at every decision for
/// the search driver.
struct BporScheduler {
    prefix: VecDeque<ThreadId>,
    records: Vec<SchedRecord>,
}

struct SchedRecord {
    chosen: ThreadId,
    runnable: BTreeMap<ThreadId, Lookahead>,
}

impl BporScheduler {
    fn new(prefix: Vec<ThreadId>) -> Self {
        Self {
            prefix: prefix.into(),
            records: Vec::new(),
        }
    }
}

impl Scheduler for BporScheduler {
    fn schedule(
        &mut self,
        prior: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
    ) -> Option<ThreadId> {
        let chosen = if let Some(next) = self.prefix.pop_front() {
            next
        } else if let Some((p, _)) = prior.filter(|(p, _)| runnable.iter().any(|(t, _)| t == p)) {
            // Free mode: continuing the prior thread never adds a
            // preemption.
            p
        } else {
            runnable.first().map(|(t, _)| *t)?
        };
        self.records.push(SchedRecord {
            chosen,
            runnable: runnable.iter().copied().collect(),
        });
        Some(chosen)
    }
}

/// Pairs the scheduler's per-decision records with the trace actions
/// they produced. `StopSubconcurrency` markers and the trailing
/// buffer flush consume no decision and are skipped.
fn merge_steps(records: Vec<SchedRecord>, trace: &Trace) -> Vec<SchedStep> {
    let mut records = records.into_iter();
    let mut steps = Vec::new();
    for item in trace.items() {
        if matches!(item.action, ThreadAction::StopSubconcurrency) {
            continue;
        }
        let Some(record) = records.next() else { break };
        steps.push(SchedStep {
            chosen: record.chosen,
            decision: item.decision,
            action: item.action.clone(),
            runnable: record.runnable,
        });
    }
    steps
}

/// Systematic bounded search: explores every schedule within the
/// preemption bound, up to commit-thread pruning, and returns one
/// `(result, trace)` pair per distinguishable execution explored.
pub fn search(
    memtype: MemType,
    config: &SearchConfig,
    program: impl Fn() -> Action,
) -> Vec<(ExecResult, Trace)> {
    let mut root = Node::default();
    let mut results = Vec::new();

    while let Some(prefix) = find_prefix(&root) {
        if config
            .max_executions
            .is_some_and(|max| results.len() as u64 >= max)
        {
            debug!(executions = results.len(), "search stopped at execution cap");
            break;
        }

        let mut sched = BporScheduler::new(prefix.clone());
        let (result, trace) = run_execution(
            program(),
            &mut sched,
            memtype,
            config.capabilities,
            config.max_steps,
        );
        let steps = merge_steps(sched.records, &trace);

        incorporate(&mut root, &steps);
        ensure_explored(&mut root, &prefix, &steps);
        add_backtracks(&mut root, &steps, memtype, config.preemption_bound);
        prune_commits(&mut root);

        debug!(
            execution = results.len() + 1,
            prefix_len = prefix.len(),
            trace_len = trace.len(),
            failed = result.is_err(),
            "explored schedule"
        );
        results.push((result, trace));
    }
    results
}

/// Guarantees search progress: when a prefix was not fully
/// incorporated (its last step ended the execution without a trace
/// entry, or — which deterministic replay should make impossible —
/// the run diverged), drop the stale backtrack entry rather than
/// retry it forever.
fn ensure_explored(root: &mut Node, prefix: &[ThreadId], steps: &[SchedStep]) {
    let followed = steps.len() >= prefix.len()
        && prefix
            .iter()
            .zip(steps)
            .all(|(want, step)| *want == step.chosen);
    if followed {
        return;
    }
    debug!(?prefix, "prefix not fully incorporated; retiring its target");
    let Some((last, path)) = prefix.split_last() else {
        return;
    };
    let mut node = root;
    for thread in path {
        match node.children.get_mut(thread) {
            Some(child) => node = child,
            None => return,
        }
    }
    node.backtrack.remove(last);
}

/// Seeded random-walk exploration: `runs` executions under the random
/// scheduler, deterministic in `seed`.
pub fn search_random(
    memtype: MemType,
    caps: usize,
    seed: u64,
    runs: u64,
    program: impl Fn() -> Action,
) -> Vec<(ExecResult, Trace)> {
    (0..runs)
        .map(|i| {
            let mut sched = RandomScheduler::new(seed.wrapping_add(i));
            run_execution(program(), &mut sched, memtype, caps, None)
        })
        .collect()
}
