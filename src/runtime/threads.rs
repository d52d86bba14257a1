//! The thread table.
//!
//! Maps `ThreadId` to the thread record: pending continuation, block
//! state, masking, handler stack and the OS-bound flag. The table is a
//! sorted map so every iteration — scheduling, waking, killing — is in
//! ascending `ThreadId` order, which keeps executions deterministic.

use std::collections::{BTreeMap, BTreeSet};

use smallvec::SmallVec;

use crate::program::{Action, HandlerFn};
use crate::types::{MVarId, MaskingState, TVarId, ThreadId};

/// Why a thread is not runnable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BlockedOn {
    /// Waiting for the MVar to become full (a take or read on empty).
    MVarFull(MVarId),
    /// Waiting for the MVar to become empty (a put on full).
    MVarEmpty(MVarId),
    /// A retried transaction waiting for any of these TVars to change.
    TVar(BTreeSet<TVarId>),
    /// A `throw_to` sender waiting for its target to become
    /// interruptible.
    Mask(ThreadId),
}

/// One installed exception handler and the masking state to restore
/// when it is entered.
pub(crate) struct HandlerFrame {
    pub handler: HandlerFn,
    pub masking: MaskingState,
}

/// A modeled thread.
pub(crate) struct Thread {
    pub cont: Option<Action>,
    pub blocking: Option<BlockedOn>,
    pub masking: MaskingState,
    pub handlers: Vec<HandlerFrame>,
    pub bound: bool,
}

impl Thread {
    fn new(cont: Action, masking: MaskingState, bound: bool) -> Self {
        Self {
            cont: Some(cont),
            blocking: None,
            masking,
            handlers: Vec::new(),
            bound,
        }
    }

    /// A thread can be scheduled when it is not blocked and has a
    /// pending continuation (the continuation is absent only while the
    /// thread is parked behind a nested execution).
    pub fn runnable(&self) -> bool {
        self.blocking.is_none() && self.cont.is_some()
    }

    /// True when an asynchronous exception may be delivered now:
    /// unmasked, or interruptibly masked while blocked on a blocking
    /// primitive.
    pub fn interruptible(&self) -> bool {
        match self.masking {
            MaskingState::Unmasked => true,
            MaskingState::MaskedInterruptible => self.blocking.is_some(),
            MaskingState::MaskedUninterruptible => false,
        }
    }
}

/// All live threads of one execution, sorted by id.
#[derive(Default)]
pub(crate) struct ThreadTable {
    threads: BTreeMap<ThreadId, Thread>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new runnable thread.
    pub fn launch(&mut self, id: ThreadId, cont: Action, masking: MaskingState, bound: bool) {
        debug_assert!(!self.threads.contains_key(&id), "thread id reused");
        self.threads.insert(id, Thread::new(cont, masking, bound));
    }

    /// Replaces a thread's continuation.
    pub fn goto(&mut self, id: ThreadId, cont: Action) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.cont = Some(cont);
        }
    }

    pub fn block(&mut self, id: ThreadId, reason: BlockedOn) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.blocking = Some(reason);
        }
    }

    pub fn unblock(&mut self, id: ThreadId) {
        if let Some(thread) = self.threads.get_mut(&id) {
            thread.blocking = None;
        }
    }

    pub fn kill(&mut self, id: ThreadId) -> Option<Thread> {
        self.threads.remove(&id)
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.threads.contains_key(&id)
    }

    pub fn get(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(&id)
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, &Thread)> {
        self.threads.iter().map(|(id, t)| (*id, t))
    }

    /// Ids of threads blocked on any TVar in `written`, unblocked and
    /// returned in ascending order.
    pub fn wake_on_tvars(&mut self, written: &BTreeSet<TVarId>) -> SmallVec<[ThreadId; 4]> {
        let woken: SmallVec<[ThreadId; 4]> = self
            .threads
            .iter()
            .filter_map(|(id, thread)| match &thread.blocking {
                Some(BlockedOn::TVar(reads)) if !reads.is_disjoint(written) => Some(*id),
                _ => None,
            })
            .collect();
        for id in &woken {
            self.unblock(*id);
        }
        woken
    }

    /// Ids of threads blocked waiting to interrupt `target`, unblocked
    /// and returned in ascending order.
    pub fn wake_on_mask(&mut self, target: ThreadId) -> SmallVec<[ThreadId; 4]> {
        let woken: SmallVec<[ThreadId; 4]> = self
            .threads
            .iter()
            .filter_map(|(id, thread)| match thread.blocking {
                Some(BlockedOn::Mask(t)) if t == target => Some(*id),
                _ => None,
            })
            .collect();
        for id in &woken {
            self.unblock(*id);
        }
        woken
    }
}
