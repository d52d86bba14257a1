//! Execution traces.
//!
//! Each step of an execution is recorded as a [`TraceItem`]: the
//! scheduling [`Decision`] that picked a thread, the runnable
//! alternatives that were not picked (with a [`Lookahead`] summary of
//! what each would have done), and the [`ThreadAction`] that actually
//! happened. The search driver consumes traces to decide where
//! dependent actions could have been reordered; collaborators consume
//! them to render and classify results.
//!
//! Traces carry identifiers only, never payload values, so they are
//! cheap to clone and JSON-export.

pub mod dependence;

use serde::Serialize;

use crate::types::{IORefId, MVarId, MaskingState, TVarId, ThreadId};

/// How the driver arrived at the thread chosen for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Decision {
    /// The previous thread can no longer run (or this is the first
    /// step); a new thread starts.
    Start(ThreadId),
    /// The same thread keeps running.
    Continue,
    /// A different thread is scheduled while the previous one could
    /// still run.
    SwitchTo(ThreadId),
}

impl Decision {
    /// Computes the decision for `chosen` given the prior thread and
    /// whether that prior thread is still runnable.
    #[must_use]
    pub fn new(chosen: ThreadId, prior: Option<ThreadId>, prior_runnable: bool) -> Self {
        match prior {
            Some(p) if p == chosen => Self::Continue,
            Some(_) if prior_runnable => Self::SwitchTo(chosen),
            _ => Self::Start(chosen),
        }
    }

    /// The thread this decision runs, given the thread that ran before.
    #[must_use]
    pub fn thread(self, prior: Option<ThreadId>) -> Option<ThreadId> {
        match self {
            Self::Start(t) | Self::SwitchTo(t) => Some(t),
            Self::Continue => prior,
        }
    }
}

/// A cheap summary of a thread's next primitive action, sufficient
/// for dependence decisions without executing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lookahead {
    WillFork,
    WillForkOs,
    WillMyThreadId,
    WillGetNumCapabilities,
    WillSetNumCapabilities(usize),
    WillIsCurrentThreadBound,
    WillYield,
    WillThreadDelay(u64),
    WillNewMVar,
    WillPutMVar(MVarId),
    WillTryPutMVar(MVarId),
    WillReadMVar(MVarId),
    WillTryReadMVar(MVarId),
    WillTakeMVar(MVarId),
    WillTryTakeMVar(MVarId),
    WillNewIORef,
    WillReadIORef(IORefId),
    WillReadForCas(IORefId),
    WillWriteIORef(IORefId),
    WillModIORef(IORefId),
    WillCasIORef(IORefId),
    /// Synthetic commit thread: will flush one buffered write to this cell.
    WillCommitIORef(IORefId),
    WillStm,
    WillCatching,
    WillPopCatching,
    WillMask,
    WillResetMask,
    WillThrow,
    WillThrowTo(ThreadId),
    WillLift,
    WillSubconcurrency,
    WillDontCheck,
    WillReturn,
    WillStop,
}

/// One step of a transaction's nested trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TAction {
    TNew(TVarId),
    TRead(TVarId),
    TWrite(TVarId),
    /// The transaction aborted asking to be re-run.
    TRetry,
    /// First-branch trace, and the second branch's if the first retried.
    TOrElse(Vec<TAction>, Option<Vec<TAction>>),
    /// Guarded trace, and the handler's if an exception was caught.
    TCatch(Vec<TAction>, Option<Vec<TAction>>),
    TThrow,
    TStop,
}

/// Collects every TVar mentioned in a transactional trace.
#[must_use]
pub fn tvars_of(trace: &[TAction]) -> std::collections::BTreeSet<TVarId> {
    let mut out = std::collections::BTreeSet::new();
    collect_tvars(trace, &mut out);
    out
}

fn collect_tvars(trace: &[TAction], out: &mut std::collections::BTreeSet<TVarId>) {
    for action in trace {
        match action {
            TAction::TNew(t) | TAction::TRead(t) | TAction::TWrite(t) => {
                out.insert(*t);
            }
            TAction::TOrElse(first, second) | TAction::TCatch(first, second) => {
                collect_tvars(first, out);
                if let Some(second) = second {
                    collect_tvars(second, out);
                }
            }
            TAction::TRetry | TAction::TThrow | TAction::TStop => {}
        }
    }
}

/// A primitive step as it appears in the trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ThreadAction {
    /// Forked a new thread.
    Fork(ThreadId),
    /// Forked a new OS-bound thread.
    ForkOs(ThreadId),
    MyThreadId,
    GetNumCapabilities(usize),
    SetNumCapabilities(usize),
    IsCurrentThreadBound(bool),
    Yield,
    /// Modeled as a yield; the duration is recorded, not waited.
    ThreadDelay(u64),
    NewMVar(MVarId),
    /// Filled the MVar, waking the listed threads (readers first, then
    /// at most one taker).
    PutMVar(MVarId, Vec<ThreadId>),
    BlockedPutMVar(MVarId),
    TryPutMVar(MVarId, bool, Vec<ThreadId>),
    ReadMVar(MVarId),
    BlockedReadMVar(MVarId),
    TryReadMVar(MVarId, bool),
    /// Emptied the MVar, waking at most one blocked putter.
    TakeMVar(MVarId, Vec<ThreadId>),
    BlockedTakeMVar(MVarId),
    TryTakeMVar(MVarId, bool, Vec<ThreadId>),
    NewIORef(IORefId),
    ReadIORef(IORefId),
    ReadForCas(IORefId),
    /// A buffered write under TSO/PSO, an immediate one under SC.
    WriteIORef(IORefId),
    ModIORef(IORefId),
    CasIORef(IORefId, bool),
    /// A synthetic commit thread flushed one buffered write made by
    /// the named thread.
    CommitIORef(ThreadId, IORefId),
    /// A committed transaction with its nested trace and woken threads.
    Stm(Vec<TAction>, Vec<ThreadId>),
    /// A retried transaction; the thread blocked on its read set.
    BlockedStm(Vec<TAction>),
    Catching,
    PopCatching,
    Throw,
    ThrowTo(ThreadId, bool),
    BlockedThrowTo(ThreadId),
    SetMasking(MaskingState, MaskingState),
    ResetMasking(MaskingState, MaskingState),
    /// A lifted native effect ran.
    Lift,
    Return,
    Stop,
    Subconcurrency,
    StopSubconcurrency,
    /// The unsystematic setup phase ran, with its own nested trace.
    DontCheck(Vec<TraceItem>),
}

impl ThreadAction {
    /// True for actions that emit a full write barrier (flushing every
    /// buffered write) before their effect.
    #[must_use]
    pub fn is_barrier(&self) -> bool {
        matches!(
            self,
            Self::PutMVar(..)
                | Self::BlockedPutMVar(..)
                | Self::ReadMVar(..)
                | Self::BlockedReadMVar(..)
                | Self::TakeMVar(..)
                | Self::BlockedTakeMVar(..)
                | Self::ReadForCas(..)
                | Self::ModIORef(..)
                | Self::CasIORef(..)
                | Self::Stm(..)
                | Self::BlockedStm(..)
                | Self::ThrowTo(..)
                | Self::BlockedThrowTo(..)
        )
    }

    /// The MVar this action operates on, if any.
    #[must_use]
    pub fn mvar(&self) -> Option<MVarId> {
        match self {
            Self::NewMVar(m)
            | Self::PutMVar(m, _)
            | Self::BlockedPutMVar(m)
            | Self::TryPutMVar(m, _, _)
            | Self::ReadMVar(m)
            | Self::BlockedReadMVar(m)
            | Self::TryReadMVar(m, _)
            | Self::TakeMVar(m, _)
            | Self::BlockedTakeMVar(m)
            | Self::TryTakeMVar(m, _, _) => Some(*m),
            _ => None,
        }
    }

    /// The IORef this action operates on, if any, and how.
    #[must_use]
    pub fn ioref(&self) -> Option<(IORefId, IORefUse)> {
        match self {
            Self::ReadIORef(r) | Self::ReadForCas(r) => Some((*r, IORefUse::Read)),
            Self::WriteIORef(r) => Some((*r, IORefUse::BufferedWrite)),
            Self::NewIORef(r) | Self::ModIORef(r) | Self::CasIORef(r, _) => {
                Some((*r, IORefUse::CommittedWrite))
            }
            Self::CommitIORef(_, r) => Some((*r, IORefUse::CommittedWrite)),
            _ => None,
        }
    }

    /// True for the synthetic commit-thread step.
    #[must_use]
    pub fn is_commit(&self) -> bool {
        matches!(self, Self::CommitIORef(..))
    }

    /// True for steps after which a context switch is not a preemption.
    #[must_use]
    pub fn is_yield_like(&self) -> bool {
        matches!(self, Self::Yield | Self::ThreadDelay(_))
    }
}

/// How an action touches an IORef.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IORefUse {
    Read,
    /// A write still sitting in a thread's buffer.
    BufferedWrite,
    /// A write applied to the committed value (including commits).
    CommittedWrite,
}

impl IORefUse {
    #[must_use]
    pub fn is_write(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// One recorded step: decision, unchosen alternatives, and the action
/// that ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceItem {
    pub decision: Decision,
    /// Runnable threads not chosen at this step, with lookaheads.
    pub alternatives: Vec<(ThreadId, Lookahead)>,
    pub action: ThreadAction,
}

/// The full trace of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Trace {
    items: Vec<TraceItem>,
}

impl Trace {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub(crate) fn push(&mut self, item: TraceItem) {
        self.items.push(item);
    }

    pub(crate) fn drain_items(&mut self) -> Vec<TraceItem> {
        std::mem::take(&mut self.items)
    }

    /// The recorded steps, in execution order.
    #[must_use]
    pub fn items(&self) -> &[TraceItem] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The sequence of threads the trace ran, one entry per step.
    ///
    /// # Panics
    ///
    /// Panics if the first decision is `Continue`, which no driver
    /// produces.
    #[must_use]
    pub fn thread_order(&self) -> Vec<ThreadId> {
        let mut prior = None;
        self.items
            .iter()
            .map(|item| {
                let t = item
                    .decision
                    .thread(prior)
                    .expect("Continue cannot be the first decision");
                prior = Some(t);
                t
            })
            .collect()
    }

    /// The thread choices a scheduler must make to reproduce this
    /// execution: one per step, skipping the markers and trailing
    /// commits the driver emits without consulting the scheduler.
    ///
    /// Feeding this to a prefix scheduler replays the execution
    /// byte-for-byte.
    #[must_use]
    pub fn schedule_order(&self) -> Vec<ThreadId> {
        let mut prior = None;
        let mut order = Vec::new();
        let mut stopped = false;
        for item in &self.items {
            let t = item
                .decision
                .thread(prior)
                .expect("Continue cannot be the first decision");
            prior = Some(t);
            if matches!(item.action, ThreadAction::StopSubconcurrency) {
                continue;
            }
            if stopped {
                // Trailing buffer flush after the initial thread
                // terminated.
                continue;
            }
            if matches!(item.action, ThreadAction::Stop) && t == ThreadId::INITIAL {
                stopped = true;
            }
            order.push(t);
        }
        order
    }

    /// Serialises the trace for artifact storage.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.items).unwrap_or(serde_json::Value::Null)
    }
}

impl<'a> IntoIterator for &'a Trace {
    type Item = &'a TraceItem;
    type IntoIter = std::slice::Iter<'a, TraceItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::id::ThreadId;

    fn tid(n: u32) -> ThreadId {
        ThreadId::new(n, None)
    }

    #[test]
    fn decision_classification() {
        assert_eq!(Decision::new(tid(0), None, false), Decision::Start(tid(0)));
        assert_eq!(Decision::new(tid(0), Some(tid(0)), true), Decision::Continue);
        assert_eq!(
            Decision::new(tid(1), Some(tid(0)), true),
            Decision::SwitchTo(tid(1))
        );
        assert_eq!(
            Decision::new(tid(1), Some(tid(0)), false),
            Decision::Start(tid(1))
        );
    }

    #[test]
    fn thread_order_follows_decisions() {
        let mut trace = Trace::new();
        trace.push(TraceItem {
            decision: Decision::Start(tid(0)),
            alternatives: vec![],
            action: ThreadAction::Yield,
        });
        trace.push(TraceItem {
            decision: Decision::Continue,
            alternatives: vec![],
            action: ThreadAction::Yield,
        });
        trace.push(TraceItem {
            decision: Decision::SwitchTo(tid(1)),
            alternatives: vec![],
            action: ThreadAction::Stop,
        });
        assert_eq!(trace.thread_order(), vec![tid(0), tid(0), tid(1)]);
    }

    #[test]
    fn tvars_of_descends_into_branches() {
        let t1 = crate::types::TVarId::new(1, None);
        let t2 = crate::types::TVarId::new(2, None);
        let trace = vec![
            TAction::TRead(t1),
            TAction::TOrElse(vec![TAction::TRetry], Some(vec![TAction::TWrite(t2)])),
            TAction::TStop,
        ];
        let tvars = tvars_of(&trace);
        assert!(tvars.contains(&t1));
        assert!(tvars.contains(&t2));
        assert_eq!(tvars.len(), 2);
    }

    #[test]
    fn barrier_classification() {
        let m = crate::types::MVarId::new(0, None);
        let r = crate::types::IORefId::new(0, None);
        assert!(ThreadAction::PutMVar(m, vec![]).is_barrier());
        assert!(ThreadAction::CasIORef(r, true).is_barrier());
        assert!(!ThreadAction::WriteIORef(r).is_barrier());
        assert!(!ThreadAction::ReadIORef(r).is_barrier());
        assert!(!ThreadAction::CommitIORef(tid(0), r).is_barrier());
    }
}
