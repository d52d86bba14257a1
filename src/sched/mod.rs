//! The scheduler seam.
//!
//! A [`Scheduler`] is the only source of nondeterminism in an
//! execution: at every step the driver hands it the previous step and
//! the runnable threads (real and synthetic commit threads, sorted by
//! id, each with a lookahead) and the scheduler picks one. Returning
//! `None` aborts the execution.
//!
//! Three deterministic schedulers ship with the core: a non-preemptive
//! round-robin (also used for `dont_check` setup phases), a seeded
//! random scheduler for cheap exploration, and a prefix-replay
//! scheduler that reproduces a recorded execution.

use crate::trace::{Lookahead, ThreadAction};
use crate::types::ThreadId;
use crate::util::SplitMix64;

/// Picks the next thread to run.
pub trait Scheduler {
    /// Chooses from `runnable` (non-empty, sorted by thread id) given
    /// the previous step, or returns `None` to abort the execution.
    fn schedule(
        &mut self,
        prior: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
    ) -> Option<ThreadId>;
}

/// Non-preemptive round-robin: keeps running the prior thread until it
/// yields, blocks or terminates, then rotates to the next thread above
/// it in id order.
#[derive(Debug, Default, Clone)]
pub struct RoundRobin;

impl RoundRobin {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for RoundRobin {
    fn schedule(
        &mut self,
        prior: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
    ) -> Option<ThreadId> {
        if let Some((p, action)) = prior {
            let prior_runnable = runnable.iter().any(|(t, _)| *t == p);
            if prior_runnable && !action.is_yield_like() {
                return Some(p);
            }
            if let Some((t, _)) = runnable.iter().find(|(t, _)| *t > p) {
                return Some(*t);
            }
        }
        runnable.first().map(|(t, _)| *t)
    }
}

/// Uniform random choice from the runnable set, seeded and
/// deterministic.
#[derive(Debug, Clone)]
pub struct RandomScheduler {
    rng: SplitMix64,
}

impl RandomScheduler {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SplitMix64::new(seed),
        }
    }
}

impl Scheduler for RandomScheduler {
    fn schedule(
        &mut self,
        _prior: Option<(ThreadId, &ThreadAction)>,
        runnable: &[(ThreadId, Lookahead)],
    ) -> Option<ThreadId> {
        let index = self.rng.next_index(runnable.len());
        runnable.get(index).map(|(t, _)| *t)
    }
}

/// Replays a recorded thread order, then aborts.
///
/// Replay of a prefix of a previously observed execution reproduces
/// that execution exactly, because everything apart from scheduling is
/// deterministic.
#[derive(Debug, Clone)]
pub struct PrefixScheduler {
    prefix: std::collections::VecDeque<ThreadId>,
}

impl PrefixScheduler {
    #[must_use]
    pub fn new(prefix: impl IntoIterator<Item = ThreadId>) -> Self {
        Self {
            prefix: prefix.into_iter().collect(),
        }
    }

    /// Decisions not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.prefix.len()
    }
}

impl Scheduler for PrefixScheduler {
    fn schedule(
        &mut self,
        _prior: Option<(ThreadId, &ThreadAction)>,
        _runnable: &[(ThreadId, Lookahead)],
    ) -> Option<ThreadId> {
        self.prefix.pop_front()
    }
}
