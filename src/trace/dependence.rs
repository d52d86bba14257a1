//! The dependence relation between trace steps.
//!
//! Two steps depend when swapping them could change a
//! program-observable outcome: they touch the same cell and at least
//! one mutates it, or one is a synchronisation (MVar operation, STM,
//! CAS, barrier) that orders relative to the other. The relation is
//! memory-model aware: under TSO/PSO a buffered write conflicts with
//! other threads only through its commit, while any barrier orders
//! against pending buffer state.
//!
//! The search driver backtracks only at dependent pairs, so this
//! relation may over-approximate (claim dependence where there is
//! none) at the cost of extra exploration, but must never
//! under-approximate.

use crate::trace::{tvars_of, IORefUse, Lookahead, ThreadAction};
use crate::types::{IORefId, MemType, MVarId, ThreadId};

/// True when the steps `(thread_a, a)` and `(thread_b, b)` depend.
///
/// Steps of the same thread are always dependent (program order).
#[must_use]
pub fn dependent(
    mem: MemType,
    thread_a: ThreadId,
    a: &ThreadAction,
    thread_b: ThreadId,
    b: &ThreadAction,
) -> bool {
    if thread_a == thread_b {
        return true;
    }

    if targets_thread(a, thread_b) || targets_thread(b, thread_a) {
        return true;
    }

    if let (Some(m1), Some(m2)) = (a.mvar(), b.mvar()) {
        if m1 == m2 {
            return true;
        }
    }

    if shares_tvar(a, b) {
        return true;
    }

    ioref_dependent(mem, a, b)
}

/// True when `action` synchronises with (or mutates) the named thread.
fn targets_thread(action: &ThreadAction, thread: ThreadId) -> bool {
    match action {
        ThreadAction::ThrowTo(t, _) | ThreadAction::BlockedThrowTo(t) => *t == thread,
        ThreadAction::Fork(t) | ThreadAction::ForkOs(t) => *t == thread,
        _ => false,
    }
}

fn shares_tvar(a: &ThreadAction, b: &ThreadAction) -> bool {
    let (ta, tb) = (stm_trace(a), stm_trace(b));
    match (ta, tb) {
        (Some(ta), Some(tb)) => !tvars_of(ta).is_disjoint(&tvars_of(tb)),
        _ => false,
    }
}

fn stm_trace(action: &ThreadAction) -> Option<&[crate::trace::TAction]> {
    match action {
        ThreadAction::Stm(trace, _) | ThreadAction::BlockedStm(trace) => Some(trace),
        _ => None,
    }
}

fn ioref_dependent(mem: MemType, a: &ThreadAction, b: &ThreadAction) -> bool {
    match (a.ioref(), b.ioref()) {
        (Some((r1, u1)), Some((r2, u2))) if r1 == r2 => {
            if !u1.is_write() && !u2.is_write() {
                return false;
            }
            match mem {
                MemType::SequentialConsistency => true,
                // Buffered writes of different threads land in
                // different buffers and only conflict via commits.
                MemType::TotalStoreOrder | MemType::PartialStoreOrder => {
                    !(u1 == IORefUse::BufferedWrite && u2 == IORefUse::BufferedWrite)
                }
            }
        }
        _ => match mem {
            MemType::SequentialConsistency => false,
            // A barrier flushes every pending buffer, so it orders
            // against buffered writes and commits of any cell.
            MemType::TotalStoreOrder | MemType::PartialStoreOrder => {
                (a.is_barrier() && touches_buffer(b)) || (b.is_barrier() && touches_buffer(a))
            }
        },
    }
}

fn touches_buffer(action: &ThreadAction) -> bool {
    matches!(
        action,
        ThreadAction::WriteIORef(_) | ThreadAction::CommitIORef(..)
    )
}

/// True when the executed step `(thread_a, a)` depends on what thread
/// `thread_b` would do next, summarised by `l`.
///
/// This is the relation the search driver uses to place backtracking
/// points: an unchosen runnable thread whose pending action conflicts
/// with an executed step must be tried before it. A thread's own
/// pending action is always dependent (program order). Fork edges are
/// deliberately not dependent here: a thread can never be scheduled
/// before the fork that creates it.
#[must_use]
pub fn dependent_lookahead(
    mem: MemType,
    thread_a: ThreadId,
    a: &ThreadAction,
    thread_b: ThreadId,
    l: &Lookahead,
) -> bool {
    if thread_a == thread_b {
        return true;
    }

    if let Lookahead::WillThrowTo(t) = l {
        if *t == thread_a {
            return true;
        }
    }
    if matches!(a, ThreadAction::ThrowTo(t, _) | ThreadAction::BlockedThrowTo(t) if *t == thread_b)
    {
        return true;
    }

    if let (Some(m1), Some(m2)) = (a.mvar(), lookahead_mvar(l)) {
        if m1 == m2 {
            return true;
        }
    }

    // A pending transaction's footprint is unknown until it runs, so
    // any STM pair is conservatively dependent.
    if matches!(l, Lookahead::WillStm) && stm_trace(a).is_some() {
        return true;
    }

    match (a.ioref(), lookahead_ioref(l)) {
        (Some((r1, u1)), Some((r2, u2))) if r1 == r2 => {
            if !u1.is_write() && !u2.is_write() {
                return false;
            }
            match mem {
                MemType::SequentialConsistency => true,
                MemType::TotalStoreOrder | MemType::PartialStoreOrder => {
                    !(u1 == IORefUse::BufferedWrite && u2 == IORefUse::BufferedWrite)
                }
            }
        }
        _ => match mem {
            MemType::SequentialConsistency => false,
            MemType::TotalStoreOrder | MemType::PartialStoreOrder => {
                (a.is_barrier() && lookahead_touches_buffer(l))
                    || (lookahead_is_barrier(l) && touches_buffer(a))
            }
        },
    }
}

fn lookahead_mvar(l: &Lookahead) -> Option<MVarId> {
    match l {
        Lookahead::WillPutMVar(m)
        | Lookahead::WillTryPutMVar(m)
        | Lookahead::WillReadMVar(m)
        | Lookahead::WillTryReadMVar(m)
        | Lookahead::WillTakeMVar(m)
        | Lookahead::WillTryTakeMVar(m) => Some(*m),
        _ => None,
    }
}

fn lookahead_ioref(l: &Lookahead) -> Option<(IORefId, IORefUse)> {
    match l {
        Lookahead::WillReadIORef(r) | Lookahead::WillReadForCas(r) => Some((*r, IORefUse::Read)),
        Lookahead::WillWriteIORef(r) => Some((*r, IORefUse::BufferedWrite)),
        Lookahead::WillModIORef(r) | Lookahead::WillCasIORef(r) => {
            Some((*r, IORefUse::CommittedWrite))
        }
        Lookahead::WillCommitIORef(r) => Some((*r, IORefUse::CommittedWrite)),
        _ => None,
    }
}

fn lookahead_is_barrier(l: &Lookahead) -> bool {
    matches!(
        l,
        Lookahead::WillPutMVar(_)
            | Lookahead::WillReadMVar(_)
            | Lookahead::WillTakeMVar(_)
            | Lookahead::WillReadForCas(_)
            | Lookahead::WillModIORef(_)
            | Lookahead::WillCasIORef(_)
            | Lookahead::WillStm
            | Lookahead::WillThrowTo(_)
    )
}

fn lookahead_touches_buffer(l: &Lookahead) -> bool {
    matches!(
        l,
        Lookahead::WillWriteIORef(_) | Lookahead::WillCommitIORef(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TAction;
    use crate::types::{IORefId, MVarId, TVarId};

    fn tid(n: u32) -> ThreadId {
        ThreadId::new(n, None)
    }

    fn ioref(n: u32) -> IORefId {
        IORefId::new(n, None)
    }

    #[test]
    fn same_thread_is_always_dependent() {
        assert!(dependent(
            MemType::SequentialConsistency,
            tid(1),
            &ThreadAction::Yield,
            tid(1),
            &ThreadAction::Yield,
        ));
    }

    #[test]
    fn reads_of_the_same_ioref_commute() {
        let r = ioref(0);
        assert!(!dependent(
            MemType::SequentialConsistency,
            tid(1),
            &ThreadAction::ReadIORef(r),
            tid(2),
            &ThreadAction::ReadIORef(r),
        ));
    }

    #[test]
    fn write_read_conflict_under_sc() {
        let r = ioref(0);
        assert!(dependent(
            MemType::SequentialConsistency,
            tid(1),
            &ThreadAction::WriteIORef(r),
            tid(2),
            &ThreadAction::ReadIORef(r),
        ));
    }

    #[test]
    fn buffered_writes_commute_under_tso() {
        let r = ioref(0);
        assert!(!dependent(
            MemType::TotalStoreOrder,
            tid(1),
            &ThreadAction::WriteIORef(r),
            tid(2),
            &ThreadAction::WriteIORef(r),
        ));
        // But the commit conflicts with a read of the same cell.
        assert!(dependent(
            MemType::TotalStoreOrder,
            tid(1),
            &ThreadAction::CommitIORef(tid(1), r),
            tid(2),
            &ThreadAction::ReadIORef(r),
        ));
    }

    #[test]
    fn same_mvar_operations_conflict() {
        let m = MVarId::new(0, None);
        assert!(dependent(
            MemType::SequentialConsistency,
            tid(1),
            &ThreadAction::PutMVar(m, vec![]),
            tid(2),
            &ThreadAction::TakeMVar(m, vec![]),
        ));
    }

    #[test]
    fn transactions_sharing_a_tvar_conflict() {
        let t = TVarId::new(0, None);
        let a = ThreadAction::Stm(vec![TAction::TWrite(t), TAction::TStop], vec![]);
        let b = ThreadAction::BlockedStm(vec![TAction::TRead(t), TAction::TRetry]);
        assert!(dependent(MemType::SequentialConsistency, tid(1), &a, tid(2), &b));

        let other = TVarId::new(9, None);
        let c = ThreadAction::Stm(vec![TAction::TRead(other), TAction::TStop], vec![]);
        assert!(!dependent(MemType::SequentialConsistency, tid(1), &a, tid(2), &c));
    }

    #[test]
    fn throw_to_conflicts_with_target_actions() {
        let e = ThreadAction::ThrowTo(tid(2), true);
        assert!(dependent(
            MemType::SequentialConsistency,
            tid(1),
            &e,
            tid(2),
            &ThreadAction::Yield,
        ));
        assert!(!dependent(
            MemType::SequentialConsistency,
            tid(1),
            &e,
            tid(3),
            &ThreadAction::Yield,
        ));
    }

    #[test]
    fn lookahead_dependence_sees_pending_conflicts() {
        let m = MVarId::new(0, None);
        let take = ThreadAction::BlockedTakeMVar(m);
        assert!(dependent_lookahead(
            MemType::SequentialConsistency,
            tid(0),
            &take,
            tid(2),
            &Lookahead::WillPutMVar(m),
        ));
        assert!(!dependent_lookahead(
            MemType::SequentialConsistency,
            tid(0),
            &take,
            tid(2),
            &Lookahead::WillYield,
        ));
        // A commit of a cell conflicts with a pending read of it.
        let r = ioref(0);
        assert!(dependent_lookahead(
            MemType::TotalStoreOrder,
            tid(0),
            &ThreadAction::CommitIORef(tid(1), r),
            tid(2),
            &Lookahead::WillReadIORef(r),
        ));
    }

    #[test]
    fn barrier_orders_against_pending_commits_under_tso() {
        let r1 = ioref(0);
        let r2 = ioref(1);
        let m = MVarId::new(0, None);
        let barrier = ThreadAction::PutMVar(m, vec![]);
        let commit = ThreadAction::CommitIORef(tid(2), r2);
        let write = ThreadAction::WriteIORef(r1);
        assert!(dependent(MemType::TotalStoreOrder, tid(1), &barrier, tid(2), &commit));
        assert!(dependent(MemType::TotalStoreOrder, tid(1), &barrier, tid(2), &write));
        assert!(!dependent(
            MemType::SequentialConsistency,
            tid(1),
            &barrier,
            tid(2),
            &write,
        ));
    }
}
