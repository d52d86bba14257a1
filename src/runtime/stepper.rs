//! Single-step semantics for every primitive action.
//!
//! The driver takes the chosen thread's pending action and hands it
//! here; the stepper applies the action's whole effect to the context
//! (or blocks the thread, restoring the action for a later retry) and
//! reports the trace entry. Steps are transactional: either the whole
//! effect commits, or the thread fails the execution.

use crate::error::Failure;
use crate::program::{Action, Kont, Unmask};
use crate::runtime::threads::{BlockedOn, HandlerFrame};
use crate::runtime::Context;
use crate::runtime::stm::{run_transaction, StmOutcome};
use crate::trace::ThreadAction;
use crate::types::{Exception, MVarId, ThreadId, Value};

/// What one step did, from the driver's point of view.
pub(crate) enum StepOutcome {
    /// The step committed; record the action.
    Ok(ThreadAction),
    /// The execution is over. `action` is recorded first when present.
    Fail {
        action: Option<ThreadAction>,
        failure: Failure,
    },
    /// The driver must run `program` as a nested execution and hand
    /// the outcome to `k`.
    Subconc {
        program: Action,
        k: Box<dyn FnOnce(Result<Value, Failure>) -> Action>,
    },
    /// The driver must run the setup phase starting at `next`.
    Setup { bound: Option<u64>, next: Action },
}

/// Applies `action` on behalf of thread `tid`.
///
/// `first_step` is true only for the initial thread's very first
/// action of the main phase, the single point where `dont_check` is
/// legal.
pub(crate) fn step(
    ctx: &mut Context,
    tid: ThreadId,
    action: Action,
    first_step: bool,
) -> StepOutcome {
    match action {
        // --- threads --------------------------------------------------
        Action::Fork { label, child, k } => {
            let masking = ctx.threads.get(tid).expect("stepped thread is live").masking;
            let child_id = ctx.ids.next_thread(label);
            ctx.threads.launch(child_id, *child, masking, false);
            ctx.threads.goto(tid, k(child_id));
            StepOutcome::Ok(ThreadAction::Fork(child_id))
        }
        Action::ForkOs { label, child, k } => {
            let masking = ctx.threads.get(tid).expect("stepped thread is live").masking;
            let child_id = ctx.ids.next_thread(label);
            ctx.threads.launch(child_id, *child, masking, true);
            ctx.threads.goto(tid, k(child_id));
            StepOutcome::Ok(ThreadAction::ForkOs(child_id))
        }
        Action::MyThreadId { k } => {
            ctx.threads.goto(tid, k(tid));
            StepOutcome::Ok(ThreadAction::MyThreadId)
        }
        Action::GetNumCapabilities { k } => {
            let caps = ctx.caps;
            ctx.threads.goto(tid, k(caps));
            StepOutcome::Ok(ThreadAction::GetNumCapabilities(caps))
        }
        Action::SetNumCapabilities { caps, next } => {
            ctx.caps = caps;
            ctx.threads.goto(tid, *next);
            StepOutcome::Ok(ThreadAction::SetNumCapabilities(caps))
        }
        Action::IsCurrentThreadBound { k } => {
            let bound = ctx.threads.get(tid).expect("stepped thread is live").bound;
            ctx.threads.goto(tid, k(bound));
            StepOutcome::Ok(ThreadAction::IsCurrentThreadBound(bound))
        }
        Action::Yield { next } => {
            ctx.threads.goto(tid, *next);
            StepOutcome::Ok(ThreadAction::Yield)
        }
        Action::ThreadDelay { micros, next } => {
            ctx.threads.goto(tid, *next);
            StepOutcome::Ok(ThreadAction::ThreadDelay(micros))
        }

        // --- MVars ----------------------------------------------------
        Action::NewMVar { label, k } => {
            let id = ctx.ids.next_mvar(label);
            ctx.memory.insert_mvar(id);
            ctx.threads.goto(tid, k(id));
            StepOutcome::Ok(ThreadAction::NewMVar(id))
        }
        Action::PutMVar { mvar, value, next } => {
            ctx.memory.synchronise();
            if ctx.memory.mvar(mvar).value.is_none() {
                ctx.memory.mvar_mut(mvar).value = Some(value);
                let woken = wake_after_fill(ctx, mvar);
                ctx.threads.goto(tid, *next);
                StepOutcome::Ok(ThreadAction::PutMVar(mvar, woken))
            } else {
                ctx.memory.mvar_mut(mvar).waiting_put.push_back(tid);
                ctx.threads.block(tid, BlockedOn::MVarEmpty(mvar));
                ctx.threads.goto(tid, Action::PutMVar { mvar, value, next });
                StepOutcome::Ok(ThreadAction::BlockedPutMVar(mvar))
            }
        }
        Action::TryPutMVar { mvar, value, k } => {
            if ctx.memory.mvar(mvar).value.is_none() {
                ctx.memory.mvar_mut(mvar).value = Some(value);
                let woken = wake_after_fill(ctx, mvar);
                ctx.threads.goto(tid, k(true));
                StepOutcome::Ok(ThreadAction::TryPutMVar(mvar, true, woken))
            } else {
                ctx.threads.goto(tid, k(false));
                StepOutcome::Ok(ThreadAction::TryPutMVar(mvar, false, Vec::new()))
            }
        }
        Action::ReadMVar { mvar, k } => {
            ctx.memory.synchronise();
            if let Some(value) = ctx.memory.mvar(mvar).value.clone() {
                ctx.threads.goto(tid, k(value));
                StepOutcome::Ok(ThreadAction::ReadMVar(mvar))
            } else {
                ctx.memory.mvar_mut(mvar).waiting_read.push_back(tid);
                ctx.threads.block(tid, BlockedOn::MVarFull(mvar));
                ctx.threads.goto(tid, Action::ReadMVar { mvar, k });
                StepOutcome::Ok(ThreadAction::BlockedReadMVar(mvar))
            }
        }
        Action::TryReadMVar { mvar, k } => {
            let value = ctx.memory.mvar(mvar).value.clone();
            let found = value.is_some();
            ctx.threads.goto(tid, k(value));
            StepOutcome::Ok(ThreadAction::TryReadMVar(mvar, found))
        }
        Action::TakeMVar { mvar, k } => {
            ctx.memory.synchronise();
            if let Some(value) = ctx.memory.mvar_mut(mvar).value.take() {
                let woken = wake_one_putter(ctx, mvar);
                ctx.threads.goto(tid, k(value));
                StepOutcome::Ok(ThreadAction::TakeMVar(mvar, woken))
            } else {
                ctx.memory.mvar_mut(mvar).waiting_take.push_back(tid);
                ctx.threads.block(tid, BlockedOn::MVarFull(mvar));
                ctx.threads.goto(tid, Action::TakeMVar { mvar, k });
                StepOutcome::Ok(ThreadAction::BlockedTakeMVar(mvar))
            }
        }
        Action::TryTakeMVar { mvar, k } => {
            if let Some(value) = ctx.memory.mvar_mut(mvar).value.take() {
                let woken = wake_one_putter(ctx, mvar);
                ctx.threads.goto(tid, k(Some(value)));
                StepOutcome::Ok(ThreadAction::TryTakeMVar(mvar, true, woken))
            } else {
                ctx.threads.goto(tid, k(None));
                StepOutcome::Ok(ThreadAction::TryTakeMVar(mvar, false, Vec::new()))
            }
        }

        // --- IORefs ---------------------------------------------------
        Action::NewIORef { label, value, k } => {
            let id = ctx.ids.next_ioref(label);
            ctx.memory.insert_ioref(id, value);
            ctx.threads.goto(tid, k(id));
            StepOutcome::Ok(ThreadAction::NewIORef(id))
        }
        Action::ReadIORef { ioref, k } => {
            let value = ctx.memory.read_ioref(tid, ioref);
            ctx.threads.goto(tid, k(value));
            StepOutcome::Ok(ThreadAction::ReadIORef(ioref))
        }
        Action::ReadForCas { ioref, k } => {
            ctx.memory.synchronise();
            let ticket = ctx.memory.ticket(ioref);
            ctx.threads.goto(tid, k(ticket));
            StepOutcome::Ok(ThreadAction::ReadForCas(ioref))
        }
        Action::WriteIORef { ioref, value, next } => {
            ctx.memory.write_ioref(tid, ioref, value);
            ctx.threads.goto(tid, *next);
            StepOutcome::Ok(ThreadAction::WriteIORef(ioref))
        }
        Action::ModIORef { ioref, f, k } => {
            ctx.memory.synchronise();
            let old = ctx.memory.read_ioref(tid, ioref);
            let (new, out) = f(old);
            ctx.memory.commit_now(ioref, new);
            ctx.threads.goto(tid, k(out));
            StepOutcome::Ok(ThreadAction::ModIORef(ioref))
        }
        Action::CasIORef {
            ioref,
            ticket,
            value,
            k,
        } => {
            ctx.memory.synchronise();
            let (swapped, fresh) = ctx.memory.cas_ioref(&ticket, value);
            ctx.threads.goto(tid, k(swapped, fresh));
            StepOutcome::Ok(ThreadAction::CasIORef(ioref, swapped))
        }

        // --- STM ------------------------------------------------------
        Action::Atom { stm, k } => {
            ctx.memory.synchronise();
            let transaction = (stm)();
            let (outcome, ttrace) = run_transaction(transaction, &mut ctx.memory, &mut ctx.ids);
            match outcome {
                StmOutcome::Success { writes, value, .. } => {
                    let woken = ctx.threads.wake_on_tvars(&writes).to_vec();
                    ctx.threads.goto(tid, k(value));
                    StepOutcome::Ok(ThreadAction::Stm(ttrace, woken))
                }
                StmOutcome::Retry { reads } => {
                    ctx.threads.block(tid, BlockedOn::TVar(reads));
                    ctx.threads.goto(tid, Action::Atom { stm, k });
                    StepOutcome::Ok(ThreadAction::BlockedStm(ttrace))
                }
                StmOutcome::Exception(e) => {
                    let action = ThreadAction::Stm(ttrace, Vec::new());
                    match propagate(ctx, tid, e) {
                        Ok(()) => StepOutcome::Ok(action),
                        Err(failure) => StepOutcome::Fail {
                            action: Some(action),
                            failure,
                        },
                    }
                }
            }
        }

        // --- exceptions -----------------------------------------------
        Action::Throw { exception } => match propagate(ctx, tid, exception) {
            Ok(()) => StepOutcome::Ok(ThreadAction::Throw),
            Err(failure) => StepOutcome::Fail {
                action: Some(ThreadAction::Throw),
                failure,
            },
        },
        Action::Catching { handler, next } => {
            let masking = ctx.threads.get(tid).expect("stepped thread is live").masking;
            ctx.threads
                .get_mut(tid)
                .expect("stepped thread is live")
                .handlers
                .push(HandlerFrame { handler, masking });
            ctx.threads.goto(tid, *next);
            StepOutcome::Ok(ThreadAction::Catching)
        }
        Action::PopCatching { next } => {
            ctx.threads
                .get_mut(tid)
                .expect("stepped thread is live")
                .handlers
                .pop();
            ctx.threads.goto(tid, *next);
            StepOutcome::Ok(ThreadAction::PopCatching)
        }
        Action::Mask { masking, body, k } => {
            let thread = ctx.threads.get_mut(tid).expect("stepped thread is live");
            let prior = thread.masking;
            thread.masking = masking;
            let unmask = Unmask {
                outer: prior,
                masked: masking,
            };
            let restore: Kont = Box::new(move |v| Action::ResetMask {
                set: false,
                masking: prior,
                next: Box::new(k(v)),
            });
            ctx.threads.goto(tid, body(unmask, restore));
            StepOutcome::Ok(ThreadAction::SetMasking(prior, masking))
        }
        Action::ResetMask { set, masking, next } => {
            let thread = ctx.threads.get_mut(tid).expect("stepped thread is live");
            let prior = thread.masking;
            thread.masking = masking;
            ctx.threads.goto(tid, *next);
            StepOutcome::Ok(if set {
                ThreadAction::SetMasking(prior, masking)
            } else {
                ThreadAction::ResetMasking(prior, masking)
            })
        }
        Action::ThrowTo {
            target,
            exception,
            next,
        } => {
            ctx.memory.synchronise();
            if target == tid {
                // Delivering to yourself is a synchronous throw.
                return match propagate(ctx, tid, exception) {
                    Ok(()) => StepOutcome::Ok(ThreadAction::ThrowTo(target, true)),
                    Err(failure) => StepOutcome::Fail {
                        action: Some(ThreadAction::ThrowTo(target, true)),
                        failure,
                    },
                };
            }
            let Some(thread) = ctx.threads.get(target) else {
                // The target already terminated.
                ctx.threads.goto(tid, *next);
                return StepOutcome::Ok(ThreadAction::ThrowTo(target, false));
            };
            if thread.interruptible() {
                if ctx.threads.get(target).expect("checked above").blocking.is_some() {
                    ctx.memory.purge_thread(target);
                    ctx.threads.unblock(target);
                }
                let outcome = match propagate(ctx, target, exception) {
                    Ok(()) => StepOutcome::Ok(ThreadAction::ThrowTo(target, true)),
                    Err(failure) => StepOutcome::Fail {
                        action: Some(ThreadAction::ThrowTo(target, true)),
                        failure,
                    },
                };
                ctx.threads.goto(tid, *next);
                outcome
            } else {
                ctx.threads.block(tid, BlockedOn::Mask(target));
                ctx.threads.goto(
                    tid,
                    Action::ThrowTo {
                        target,
                        exception,
                        next,
                    },
                );
                StepOutcome::Ok(ThreadAction::BlockedThrowTo(target))
            }
        }

        // --- effects and control --------------------------------------
        Action::Lift { effect, k } => {
            let value = effect();
            ctx.threads.goto(tid, k(value));
            StepOutcome::Ok(ThreadAction::Lift)
        }
        Action::Pure { value, k } => {
            ctx.threads.goto(tid, k(value));
            StepOutcome::Ok(ThreadAction::Return)
        }
        Action::Stop { result } => {
            if tid == ctx.initial {
                ctx.result = result;
            }
            ctx.threads.kill(tid);
            ctx.memory.purge_thread(tid);
            StepOutcome::Ok(ThreadAction::Stop)
        }

        Action::Subconcurrency { program, k } => {
            if ctx.in_setup || ctx.threads.len() > 1 {
                StepOutcome::Fail {
                    action: None,
                    failure: Failure::IllegalSubconcurrency,
                }
            } else {
                StepOutcome::Subconc {
                    program: *program,
                    k,
                }
            }
        }
        Action::DontCheck { bound, body, k } => {
            if first_step {
                let next = body(Box::new(move |v| Action::DontCheckEnd { value: v, k }));
                StepOutcome::Setup { bound, next }
            } else {
                StepOutcome::Fail {
                    action: None,
                    failure: Failure::IllegalDontCheck,
                }
            }
        }
        Action::DontCheckEnd { .. } => StepOutcome::Fail {
            action: None,
            failure: Failure::InternalError,
        },
    }
}

/// Filling an MVar wakes every blocked reader (en masse, FIFO) and the
/// first blocked taker.
fn wake_after_fill(ctx: &mut Context, mvar: MVarId) -> Vec<ThreadId> {
    let (readers, taker) = {
        let cell = ctx.memory.mvar_mut(mvar);
        let readers: Vec<ThreadId> = cell.waiting_read.drain(..).collect();
        (readers, cell.waiting_take.pop_front())
    };
    let mut woken = readers;
    woken.extend(taker);
    for &t in &woken {
        ctx.threads.unblock(t);
    }
    woken
}

/// Emptying an MVar wakes the first blocked putter.
fn wake_one_putter(ctx: &mut Context, mvar: MVarId) -> Vec<ThreadId> {
    let putter = ctx.memory.mvar_mut(mvar).waiting_put.pop_front();
    let woken: Vec<ThreadId> = putter.into_iter().collect();
    for &t in &woken {
        ctx.threads.unblock(t);
    }
    woken
}

/// Walks `tid`'s handler stack with an exception.
///
/// A matching frame installs its handler as the thread's continuation
/// and restores the masking recorded at install time. With no match,
/// a non-initial thread is killed silently; the initial thread fails
/// the execution.
pub(crate) fn propagate(
    ctx: &mut Context,
    tid: ThreadId,
    mut exception: Exception,
) -> Result<(), Failure> {
    loop {
        let frame = match ctx.threads.get_mut(tid) {
            Some(thread) => thread.handlers.pop(),
            None => return Ok(()),
        };
        match frame {
            Some(frame) => match (frame.handler)(exception) {
                Ok(action) => {
                    let thread = ctx.threads.get_mut(tid).expect("thread is live");
                    thread.masking = frame.masking;
                    thread.cont = Some(action);
                    return Ok(());
                }
                Err(e) => exception = e,
            },
            None => {
                if tid == ctx.initial {
                    return Err(Failure::UncaughtException);
                }
                ctx.threads.kill(tid);
                ctx.memory.purge_thread(tid);
                return Ok(());
            }
        }
    }
}
