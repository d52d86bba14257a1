//! The transaction interpreter.
//!
//! Runs a [`Stm`] tree to completion inside a single `atom` step.
//! Writes are applied to the store in place and recorded in an undo
//! log; any abort (retry, exception) applies the log in reverse down
//! to the enclosing frame, so intermediate state is never visible
//! outside the transaction. `orElse` and `catch` are interpreted with
//! an explicit frame stack rather than recursion, and each frame's
//! slice of the trace is wrapped into the nested `TOrElse`/`TCatch`
//! entry when the frame resolves.

use std::collections::BTreeSet;

use crate::program::stm::{Stm, StmHandlerFn, StmKont};
use crate::runtime::ids::IdSource;
use crate::runtime::memory::Memory;
use crate::trace::TAction;
use crate::types::{Exception, TVarId, Value};

/// How a transaction ended.
pub(crate) enum StmOutcome {
    /// Committed: writes are installed and waiters on the written
    /// TVars should be woken.
    Success {
        reads: BTreeSet<TVarId>,
        writes: BTreeSet<TVarId>,
        value: Value,
    },
    /// Rolled back; re-run when any TVar in `reads` changes.
    Retry { reads: BTreeSet<TVarId> },
    /// Rolled back with an exception to propagate on the thread.
    Exception(Exception),
}

enum Undo {
    /// A write to roll back to the prior value.
    Write(TVarId, Value),
    /// An allocation to forget.
    New(TVarId),
}

enum Frame {
    OrElse {
        second: Option<Box<Stm>>,
        /// Trace of the first branch once it has retried.
        first_trace: Option<Vec<TAction>>,
        k: StmKont,
        undo_mark: usize,
        trace_mark: usize,
    },
    Catch {
        handler: Option<StmHandlerFn>,
        /// Trace of the guarded body once the handler has taken over.
        body_trace: Option<Vec<TAction>>,
        k: StmKont,
        undo_mark: usize,
        trace_mark: usize,
    },
}

/// Runs one transaction against the store.
pub(crate) fn run_transaction(
    stm: Stm,
    memory: &mut Memory,
    ids: &mut IdSource,
) -> (StmOutcome, Vec<TAction>) {
    let mut frames: Vec<Frame> = Vec::new();
    let mut undo: Vec<Undo> = Vec::new();
    let mut reads: BTreeSet<TVarId> = BTreeSet::new();
    let mut trace: Vec<TAction> = Vec::new();
    let mut current = stm;

    loop {
        current = match current {
            Stm::Return(value) => match frames.pop() {
                None => {
                    trace.push(TAction::TStop);
                    let writes = written_set(&undo);
                    return (
                        StmOutcome::Success {
                            reads,
                            writes,
                            value,
                        },
                        trace,
                    );
                }
                Some(Frame::OrElse {
                    first_trace,
                    k,
                    trace_mark,
                    ..
                }) => {
                    let tail = trace.split_off(trace_mark);
                    trace.push(match first_trace {
                        None => TAction::TOrElse(tail, None),
                        Some(first) => TAction::TOrElse(first, Some(tail)),
                    });
                    k(value)
                }
                Some(Frame::Catch {
                    body_trace,
                    k,
                    trace_mark,
                    ..
                }) => {
                    let tail = trace.split_off(trace_mark);
                    trace.push(match body_trace {
                        None => TAction::TCatch(tail, None),
                        Some(body) => TAction::TCatch(body, Some(tail)),
                    });
                    k(value)
                }
            },

            Stm::New { label, value, k } => {
                let id = ids.next_tvar(label);
                memory.insert_tvar(id, value);
                undo.push(Undo::New(id));
                trace.push(TAction::TNew(id));
                k(id)
            }

            Stm::Read { tvar, k } => {
                reads.insert(tvar);
                trace.push(TAction::TRead(tvar));
                k(memory.tvar_value(tvar))
            }

            Stm::Write { tvar, value, next } => {
                undo.push(Undo::Write(tvar, memory.tvar_value(tvar)));
                memory.set_tvar(tvar, value);
                trace.push(TAction::TWrite(tvar));
                *next
            }

            Stm::OrElse { first, second, k } => {
                frames.push(Frame::OrElse {
                    second: Some(second),
                    first_trace: None,
                    k,
                    undo_mark: undo.len(),
                    trace_mark: trace.len(),
                });
                *first
            }

            Stm::Catch { body, handler, k } => {
                frames.push(Frame::Catch {
                    handler: Some(handler),
                    body_trace: None,
                    k,
                    undo_mark: undo.len(),
                    trace_mark: trace.len(),
                });
                *body
            }

            Stm::Retry => {
                trace.push(TAction::TRetry);
                match unwind_retry(&mut frames, &mut undo, &mut trace, memory) {
                    Some(next) => next,
                    None => {
                        rollback_to(0, &mut undo, memory);
                        return (StmOutcome::Retry { reads }, trace);
                    }
                }
            }

            Stm::Throw(exception) => {
                trace.push(TAction::TThrow);
                match unwind_throw(exception, &mut frames, &mut undo, &mut trace, memory) {
                    Ok(next) => next,
                    Err(exception) => {
                        rollback_to(0, &mut undo, memory);
                        return (StmOutcome::Exception(exception), trace);
                    }
                }
            }
        };
    }
}

/// Unwinds a retry: resumes at the second branch of the nearest
/// `orElse` that still has one, wrapping the trace of every frame
/// passed on the way. `None` when the whole transaction retries.
fn unwind_retry(
    frames: &mut Vec<Frame>,
    undo: &mut Vec<Undo>,
    trace: &mut Vec<TAction>,
    memory: &mut Memory,
) -> Option<Stm> {
    while let Some(frame) = frames.pop() {
        match frame {
            Frame::OrElse {
                second: Some(second),
                first_trace: None,
                k,
                undo_mark,
                trace_mark,
            } => {
                rollback_to(undo_mark, undo, memory);
                let first = trace.split_off(trace_mark);
                frames.push(Frame::OrElse {
                    second: None,
                    first_trace: Some(first),
                    k,
                    undo_mark,
                    trace_mark,
                });
                return Some(*second);
            }
            Frame::OrElse {
                first_trace,
                trace_mark,
                ..
            } => {
                let tail = trace.split_off(trace_mark);
                trace.push(match first_trace {
                    None => TAction::TOrElse(tail, None),
                    Some(first) => TAction::TOrElse(first, Some(tail)),
                });
            }
            Frame::Catch {
                body_trace,
                trace_mark,
                ..
            } => {
                let tail = trace.split_off(trace_mark);
                trace.push(match body_trace {
                    None => TAction::TCatch(tail, None),
                    Some(body) => TAction::TCatch(body, Some(tail)),
                });
            }
        }
    }
    None
}

/// Unwinds an exception: resumes at the nearest matching handler,
/// wrapping frame traces on the way. `Err` when nothing catches it.
fn unwind_throw(
    mut exception: Exception,
    frames: &mut Vec<Frame>,
    undo: &mut Vec<Undo>,
    trace: &mut Vec<TAction>,
    memory: &mut Memory,
) -> Result<Stm, Exception> {
    while let Some(frame) = frames.pop() {
        match frame {
            Frame::Catch {
                handler: Some(handler),
                body_trace: None,
                k,
                undo_mark,
                trace_mark,
            } => match handler(exception) {
                Ok(handler_stm) => {
                    rollback_to(undo_mark, undo, memory);
                    let body = trace.split_off(trace_mark);
                    frames.push(Frame::Catch {
                        handler: None,
                        body_trace: Some(body),
                        k,
                        undo_mark,
                        trace_mark,
                    });
                    return Ok(handler_stm);
                }
                Err(e) => {
                    exception = e;
                    let body = trace.split_off(trace_mark);
                    trace.push(TAction::TCatch(body, None));
                }
            },
            Frame::Catch {
                body_trace,
                trace_mark,
                ..
            } => {
                let tail = trace.split_off(trace_mark);
                trace.push(match body_trace {
                    None => TAction::TCatch(tail, None),
                    Some(body) => TAction::TCatch(body, Some(tail)),
                });
            }
            Frame::OrElse {
                first_trace,
                trace_mark,
                ..
            } => {
                let tail = trace.split_off(trace_mark);
                trace.push(match first_trace {
                    None => TAction::TOrElse(tail, None),
                    Some(first) => TAction::TOrElse(first, Some(tail)),
                });
            }
        }
    }
    Err(exception)
}

/// Applies the undo log in reverse down to `mark`.
fn rollback_to(mark: usize, undo: &mut Vec<Undo>, memory: &mut Memory) {
    while undo.len() > mark {
        match undo.pop().expect("len checked") {
            Undo::Write(tvar, prior) => memory.set_tvar(tvar, prior),
            Undo::New(tvar) => memory.remove_tvar(tvar),
        }
    }
}

/// The set of TVars the surviving undo log wrote or created.
fn written_set(undo: &[Undo]) -> BTreeSet<TVarId> {
    undo.iter()
        .map(|entry| match entry {
            Undo::Write(tvar, _) | Undo::New(tvar) => *tvar,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemType;

    fn setup() -> (Memory, IdSource) {
        (Memory::new(MemType::SequentialConsistency), IdSource::new())
    }

    fn tvar(memory: &mut Memory, ids: &mut IdSource, v: i32) -> TVarId {
        let id = ids.next_tvar(None);
        memory.insert_tvar(id, Value::new(v));
        id
    }

    fn int(v: &Value) -> i32 {
        v.extract::<i32>().expect("i32 payload")
    }

    #[test]
    fn write_then_read_commits() {
        let (mut memory, mut ids) = setup();
        let t = tvar(&mut memory, &mut ids, 0);
        let stm = Stm::write(t, Value::new(1_i32), Stm::read(t, Stm::ret));
        let (outcome, trace) = run_transaction(stm, &mut memory, &mut ids);
        let StmOutcome::Success { reads, writes, value } = outcome else {
            panic!("expected success");
        };
        assert_eq!(int(&value), 1);
        assert!(reads.contains(&t));
        assert!(writes.contains(&t));
        assert_eq!(int(&memory.tvar_value(t)), 1);
        assert_eq!(
            trace,
            vec![
                TAction::TWrite(t),
                TAction::TRead(t),
                TAction::TStop
            ]
        );
    }

    #[test]
    fn retry_rolls_back_writes() {
        let (mut memory, mut ids) = setup();
        let t = tvar(&mut memory, &mut ids, 0);
        let stm = Stm::write(t, Value::new(9_i32), Stm::read(t, |_| Stm::retry()));
        let (outcome, trace) = run_transaction(stm, &mut memory, &mut ids);
        let StmOutcome::Retry { reads } = outcome else {
            panic!("expected retry");
        };
        assert!(reads.contains(&t));
        assert_eq!(int(&memory.tvar_value(t)), 0, "write rolled back");
        assert_eq!(trace.last(), Some(&TAction::TRetry));
    }

    #[test]
    fn or_else_falls_through_to_second_branch() {
        let (mut memory, mut ids) = setup();
        let t = tvar(&mut memory, &mut ids, 0);
        let guard = tvar(&mut memory, &mut ids, 7);
        let first = Stm::write(t, Value::new(1_i32), Stm::retry());
        let second = Stm::read(guard, Stm::ret);
        let stm = Stm::or_else(first, second, Stm::ret);
        let (outcome, trace) = run_transaction(stm, &mut memory, &mut ids);
        let StmOutcome::Success { reads, writes, value } = outcome else {
            panic!("expected success");
        };
        assert_eq!(int(&value), 7);
        assert_eq!(int(&memory.tvar_value(t)), 0, "first branch undone");
        assert!(!writes.contains(&t), "undone write leaves the write set");
        // Reads union across the aborted branch and the taken one.
        assert!(reads.contains(&guard));
        assert_eq!(
            trace,
            vec![
                TAction::TOrElse(
                    vec![TAction::TWrite(t), TAction::TRetry],
                    Some(vec![TAction::TRead(guard)]),
                ),
                TAction::TStop,
            ]
        );
    }

    #[test]
    fn or_else_keeps_first_branch_effects_on_success() {
        let (mut memory, mut ids) = setup();
        let t = tvar(&mut memory, &mut ids, 0);
        let stm = Stm::or_else(
            Stm::write(t, Value::new(1_i32), Stm::ret(Value::new(1_i32))),
            Stm::ret(Value::new(2_i32)),
            Stm::ret,
        );
        let (outcome, _) = run_transaction(stm, &mut memory, &mut ids);
        let StmOutcome::Success { value, .. } = outcome else {
            panic!("expected success");
        };
        assert_eq!(int(&value), 1);
        assert_eq!(int(&memory.tvar_value(t)), 1);
    }

    #[test]
    fn nested_or_else_retry_propagates_once() {
        let (mut memory, mut ids) = setup();
        let t = tvar(&mut memory, &mut ids, 3);
        // Both branches of the inner orElse retry; the outer provides
        // the fallback.
        let inner = Stm::or_else(Stm::retry(), Stm::retry(), Stm::ret);
        let stm = Stm::or_else(inner, Stm::read(t, Stm::ret), Stm::ret);
        let (outcome, _) = run_transaction(stm, &mut memory, &mut ids);
        let StmOutcome::Success { value, .. } = outcome else {
            panic!("expected success");
        };
        assert_eq!(int(&value), 3);
    }

    #[test]
    fn catch_restores_state_before_handler() {
        struct Boom;
        let (mut memory, mut ids) = setup();
        let t = tvar(&mut memory, &mut ids, 0);
        let body = Stm::write(t, Value::new(5_i32), Stm::throw(Boom));
        let stm = Stm::catch::<Boom>(body, move |_| Stm::read(t, Stm::ret), Stm::ret);
        let (outcome, trace) = run_transaction(stm, &mut memory, &mut ids);
        let StmOutcome::Success { value, .. } = outcome else {
            panic!("expected success");
        };
        assert_eq!(int(&value), 0, "handler sees the rolled-back value");
        assert_eq!(
            trace,
            vec![
                TAction::TCatch(
                    vec![TAction::TWrite(t), TAction::TThrow],
                    Some(vec![TAction::TRead(t)]),
                ),
                TAction::TStop,
            ]
        );
    }

    #[test]
    fn unmatched_exception_aborts_the_transaction() {
        struct Boom;
        struct Other;
        let (mut memory, mut ids) = setup();
        let t = tvar(&mut memory, &mut ids, 0);
        let body = Stm::write(t, Value::new(5_i32), Stm::throw(Other));
        let stm = Stm::catch::<Boom>(body, |_| Stm::ret(Value::unit()), Stm::ret);
        let (outcome, _) = run_transaction(stm, &mut memory, &mut ids);
        let StmOutcome::Exception(e) = outcome else {
            panic!("expected exception");
        };
        assert!(e.is::<Other>());
        assert_eq!(int(&memory.tvar_value(t)), 0, "all effects undone");
    }

    #[test]
    fn aborted_allocation_is_forgotten() {
        let (mut memory, mut ids) = setup();
        let created: std::rc::Rc<std::cell::Cell<Option<TVarId>>> =
            std::rc::Rc::new(std::cell::Cell::new(None));
        let seen = std::rc::Rc::clone(&created);
        let stm = Stm::new_tvar(Value::new(1_i32), move |t| {
            seen.set(Some(t));
            Stm::retry()
        });
        let (outcome, _) = run_transaction(stm, &mut memory, &mut ids);
        assert!(matches!(outcome, StmOutcome::Retry { .. }));
        let id = created.get().expect("allocation ran");
        // The cell is gone; a later transaction allocates a fresh id.
        let fresh = ids.next_tvar(None);
        assert!(fresh > id);
    }
}

