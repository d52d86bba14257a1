//! The execution driver.
//!
//! The outer loop of one execution: build the runnable set (real
//! threads plus synthetic commit threads), detect deadlock and
//! termination, ask the scheduler for a thread, step it, and record
//! the trace triple. Nested phases — `subconcurrency` and the
//! `dont_check` setup — re-enter the same loop with a different root
//! thread or a forced scheduler.

use tracing::{debug, trace as trace_event};

use crate::error::{ExecResult, Failure};
use crate::program::Action;
use crate::runtime::stepper::{step, StepOutcome};
use crate::runtime::threads::BlockedOn;
use crate::runtime::Context;
use crate::sched::{RoundRobin, Scheduler};
use crate::trace::{Decision, Lookahead, ThreadAction, Trace, TraceItem};
use crate::types::{MaskingState, MemType, ThreadId, Value};

/// Runs one complete execution of `program`.
///
/// `step_limit` bounds the total number of steps as a divergence
/// safety valve; exceeding it reports [`Failure::Abort`].
pub(crate) fn run_execution(
    program: Action,
    sched: &mut dyn Scheduler,
    memtype: MemType,
    caps: usize,
    step_limit: Option<u64>,
) -> (ExecResult, Trace) {
    let mut ctx = Context::new(memtype, caps);
    ctx.threads
        .launch(ctx.initial, program, MaskingState::Unmasked, false);

    let mut trace = Trace::new();
    let mut prior: Option<(ThreadId, ThreadAction)> = None;
    let initial = ctx.initial;
    let limit = step_limit.map(|n| ctx.steps + n);

    let failure = run_threads(&mut ctx, sched, &mut trace, &mut prior, initial, limit, false, true);

    match failure {
        Some(failure) => {
            debug!(?failure, steps = ctx.steps, "execution failed");
            (Err(failure), trace)
        }
        None => {
            // Termination must leave no buffered writes of the initial
            // thread behind; report the flush as trailing commits.
            for ioref in ctx.memory.flush_thread(initial) {
                trace.push(TraceItem {
                    decision: Decision::Continue,
                    alternatives: Vec::new(),
                    action: ThreadAction::CommitIORef(initial, ioref),
                });
            }
            debug!(steps = ctx.steps, trace_len = trace.len(), "execution finished");
            let value = ctx.result.take().unwrap_or_else(Value::unit);
            (Ok(value), trace)
        }
    }
}

/// The runnable set at a scheduling point: runnable real threads plus
/// one synthetic commit thread per non-empty buffer key, sorted by id.
fn runnable_set(ctx: &Context) -> Vec<(ThreadId, Lookahead)> {
    let mut out: Vec<(ThreadId, Lookahead)> = ctx
        .threads
        .iter()
        .filter(|(_, thread)| thread.runnable())
        .map(|(id, thread)| {
            let lookahead = thread
                .cont
                .as_ref()
                .expect("runnable thread has a continuation")
                .lookahead();
            (id, lookahead)
        })
        .collect();
    for (commit_id, _writer, ioref) in ctx.memory.buffer.commit_threads() {
        out.push((commit_id, Lookahead::WillCommitIORef(ioref)));
    }
    out.sort_by_key(|(id, _)| *id);
    out
}

/// Classifies the stuck state when nothing is runnable.
fn deadlock_failure(ctx: &Context, root: ThreadId) -> Failure {
    match ctx.threads.get(root).and_then(|t| t.blocking.as_ref()) {
        Some(BlockedOn::TVar(_)) => Failure::StmDeadlock,
        _ => Failure::Deadlock,
    }
}

/// Wakes `throw_to` senders whose target became interruptible or died.
fn wake_interrupters(ctx: &mut Context) {
    let targets: std::collections::BTreeSet<ThreadId> = ctx
        .threads
        .iter()
        .filter_map(|(_, thread)| match thread.blocking {
            Some(BlockedOn::Mask(target)) => Some(target),
            _ => None,
        })
        .collect();
    for target in targets {
        let release = match ctx.threads.get(target) {
            None => true,
            Some(thread) => thread.interruptible(),
        };
        if release {
            ctx.threads.wake_on_mask(target);
        }
    }
}

/// Drives one phase until its root thread is gone (normal end), the
/// setup marker is reached, or a failure ends the execution.
#[allow(clippy::too_many_arguments)]
fn run_threads(
    ctx: &mut Context,
    sched: &mut dyn Scheduler,
    trace: &mut Trace,
    prior: &mut Option<(ThreadId, ThreadAction)>,
    root: ThreadId,
    step_limit: Option<u64>,
    setup: bool,
    main_phase: bool,
) -> Option<Failure> {
    loop {
        if !ctx.threads.contains(root) {
            return None;
        }
        if setup {
            let at_marker = ctx
                .threads
                .get(root)
                .map_or(false, |t| matches!(t.cont, Some(Action::DontCheckEnd { .. })));
            if at_marker {
                return None;
            }
        }

        #[cfg(debug_assertions)]
        ctx.check_invariants();

        let runnable = runnable_set(ctx);
        if runnable.is_empty() {
            return Some(deadlock_failure(ctx, root));
        }
        if let Some(limit) = step_limit {
            if ctx.steps >= limit {
                return Some(Failure::Abort);
            }
        }

        let prior_ref = prior.as_ref().map(|(t, a)| (*t, a));
        let Some(chosen) = sched.schedule(prior_ref, &runnable) else {
            return Some(Failure::Abort);
        };
        if !runnable.iter().any(|(t, _)| *t == chosen) {
            return Some(Failure::InternalError);
        }

        let prior_id = prior.as_ref().map(|(t, _)| *t);
        let prior_runnable =
            prior_id.is_some_and(|p| runnable.iter().any(|(t, _)| *t == p));
        let decision = Decision::new(chosen, prior_id, prior_runnable);
        let alternatives: Vec<(ThreadId, Lookahead)> = runnable
            .iter()
            .copied()
            .filter(|(t, _)| *t != chosen)
            .collect();
        ctx.steps += 1;
        trace_event!(?chosen, ?decision, step = ctx.steps, "scheduled");

        // Synthetic commit threads flush one buffered write and vanish.
        if chosen.is_commit() {
            let Some((writer, ioref)) = ctx.memory.commit_one(chosen) else {
                return Some(Failure::InternalError);
            };
            let action = ThreadAction::CommitIORef(writer, ioref);
            trace.push(TraceItem {
                decision,
                alternatives,
                action: action.clone(),
            });
            *prior = Some((chosen, action));
            continue;
        }

        let Some(action) = ctx.threads.get_mut(chosen).and_then(|t| t.cont.take()) else {
            return Some(Failure::InternalError);
        };
        let first_step = main_phase && trace.is_empty() && chosen == root;

        match step(ctx, chosen, action, first_step) {
            StepOutcome::Ok(action) => {
                trace.push(TraceItem {
                    decision,
                    alternatives,
                    action: action.clone(),
                });
                *prior = Some((chosen, action));
                wake_interrupters(ctx);
            }

            StepOutcome::Fail { action, failure } => {
                if let Some(action) = action {
                    trace.push(TraceItem {
                        decision,
                        alternatives,
                        action,
                    });
                }
                return Some(failure);
            }

            StepOutcome::Subconc { program, k } => {
                trace.push(TraceItem {
                    decision,
                    alternatives,
                    action: ThreadAction::Subconcurrency,
                });
                *prior = Some((chosen, ThreadAction::Subconcurrency));

                // The parent parks (no continuation) while the nested
                // execution runs against the same store, id source and
                // scheduler.
                let sub_root = ctx.ids.next_thread(None);
                ctx.threads
                    .launch(sub_root, program, MaskingState::Unmasked, false);
                let saved_initial = ctx.initial;
                let saved_result = ctx.result.take();
                ctx.initial = sub_root;

                let failure =
                    run_threads(ctx, sched, trace, prior, sub_root, step_limit, false, false);
                let sub_result = match failure {
                    Some(f) => Err(f),
                    None => Ok(ctx.result.take().unwrap_or_else(Value::unit)),
                };
                ctx.initial = saved_initial;
                ctx.result = saved_result;

                // The nested execution is over: orphans die silently.
                let leftovers: Vec<ThreadId> = ctx
                    .threads
                    .iter()
                    .map(|(id, _)| id)
                    .filter(|id| *id != chosen)
                    .collect();
                for id in leftovers {
                    ctx.threads.kill(id);
                    ctx.memory.purge_thread(id);
                }

                ctx.threads.goto(chosen, k(sub_result));
                let runnable_now = runnable_set(ctx);
                let prior_id = prior.as_ref().map(|(t, _)| *t);
                let prior_runnable =
                    prior_id.is_some_and(|p| runnable_now.iter().any(|(t, _)| *t == p));
                let stop_decision = Decision::new(chosen, prior_id, prior_runnable);
                trace.push(TraceItem {
                    decision: stop_decision,
                    alternatives: Vec::new(),
                    action: ThreadAction::StopSubconcurrency,
                });
                *prior = Some((chosen, ThreadAction::StopSubconcurrency));
            }

            StepOutcome::Setup { bound, next } => {
                // Legal only as the program's first action, so `chosen`
                // is the phase root here.
                ctx.threads.goto(chosen, next);
                ctx.in_setup = true;
                let saved_memtype = ctx.memory.memtype;
                ctx.memory.memtype = MemType::SequentialConsistency;

                let mut setup_sched = RoundRobin::new();
                let mut setup_trace = Trace::new();
                let mut setup_prior = None;
                let setup_limit = match (bound.map(|n| ctx.steps + n), step_limit) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };

                let failure = run_threads(
                    ctx,
                    &mut setup_sched,
                    &mut setup_trace,
                    &mut setup_prior,
                    root,
                    setup_limit,
                    true,
                    false,
                );
                ctx.in_setup = false;
                ctx.memory.memtype = saved_memtype;

                let setup_items = setup_trace.drain_items();
                if let Some(failure) = failure {
                    trace.push(TraceItem {
                        decision,
                        alternatives,
                        action: ThreadAction::DontCheck(setup_items),
                    });
                    return Some(failure);
                }

                let Some(Action::DontCheckEnd { value, k }) =
                    ctx.threads.get_mut(root).and_then(|t| t.cont.take())
                else {
                    return Some(Failure::InternalError);
                };
                ctx.threads.goto(root, k(value));
                let action = ThreadAction::DontCheck(setup_items);
                trace.push(TraceItem {
                    decision,
                    alternatives,
                    action: action.clone(),
                });
                *prior = Some((chosen, action));
            }
        }
    }
}
