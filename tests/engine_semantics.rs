//! End-to-end semantics of the deterministic engine: forks, MVar
//! blocking, deadlock detection, and the systematic search over the
//! small canonical programs.

mod common;
use common::init_test_logging;

use weft::explore::SearchConfig;
use weft::program::Action;
use weft::trace::ThreadAction;
use weft::types::{MemType, Value};
use weft::{run, search, Failure};

/// fork (put m 1); take m
fn fork_put_take() -> Action {
    Action::new_mvar_labeled("m", |m| {
        Action::fork(
            Action::put_mvar(m, Value::new(1_i32), Action::stop()),
            move |_child| Action::take_mvar(m, Action::stop_with),
        )
    })
}

#[test]
fn single_put_take_has_exactly_one_result() {
    init_test_logging();
    let results = search(
        MemType::SequentialConsistency,
        &SearchConfig::new(1),
        fork_put_take,
    );
    assert!(!results.is_empty());
    for (result, trace) in &results {
        let value = result.as_ref().expect("no failure expected");
        assert_eq!(value.extract::<i32>(), Some(1));
        assert!(!trace.is_empty());
    }
}

/// fork (put m 1); fork (put m 2); take m
fn racing_puts() -> Action {
    Action::new_mvar_labeled("m", |m| {
        Action::fork(
            Action::put_mvar(m, Value::new(1_i32), Action::stop()),
            move |_| {
                Action::fork(
                    Action::put_mvar(m, Value::new(2_i32), Action::stop()),
                    move |_| Action::take_mvar(m, Action::stop_with),
                )
            },
        )
    })
}

#[test]
fn racing_puts_yield_both_results() {
    init_test_logging();
    let results = search(
        MemType::SequentialConsistency,
        &SearchConfig::new(1),
        racing_puts,
    );
    let mut seen = std::collections::BTreeSet::new();
    for (result, _) in &results {
        let value = result.as_ref().expect("no failure expected");
        seen.insert(value.extract::<i32>().expect("an i32 result"));
    }
    assert_eq!(seen, [1, 2].into_iter().collect());
}

#[test]
fn take_on_fresh_mvar_deadlocks() {
    init_test_logging();
    let (result, trace) = run(MemType::SequentialConsistency, 2, || {
        Action::new_mvar(|m| Action::take_mvar(m, Action::stop_with))
    });
    assert_eq!(result.unwrap_err(), Failure::Deadlock);
    assert!(trace
        .items()
        .iter()
        .any(|item| matches!(item.action, ThreadAction::BlockedTakeMVar(_))));
}

#[test]
fn put_wakes_readers_en_masse_and_one_taker() {
    init_test_logging();
    // Under round-robin the initial thread blocks taking, then two
    // forked readers block, then the forked putter fills the cell:
    // both readers and the taker wake in one step.
    let (result, trace) = run(MemType::SequentialConsistency, 2, || {
        Action::new_mvar(|m| {
            Action::fork(
                Action::read_mvar(m, |_| Action::stop()),
                move |_| {
                    Action::fork(
                        Action::read_mvar(m, |_| Action::stop()),
                        move |_| {
                            Action::fork(
                                Action::put_mvar(m, Value::new(7_i32), Action::stop()),
                                move |_| Action::take_mvar(m, Action::stop_with),
                            )
                        },
                    )
                },
            )
        })
    });
    assert_eq!(result.unwrap().extract::<i32>(), Some(7));
    let woken = trace
        .items()
        .iter()
        .find_map(|item| match &item.action {
            ThreadAction::PutMVar(_, woken) => Some(woken.clone()),
            _ => None,
        })
        .expect("a put must appear");
    assert_eq!(woken.len(), 3, "two readers and one taker woken: {woken:?}");
}

#[test]
fn capabilities_are_queryable_and_settable() {
    init_test_logging();
    let (result, trace) = run(MemType::SequentialConsistency, 2, || {
        Action::get_num_capabilities(|n| {
            Action::set_num_capabilities(n + 2, Action::get_num_capabilities(|m| {
                Action::stop_with(Value::new(m))
            }))
        })
    });
    assert_eq!(result.unwrap().extract::<usize>(), Some(4));
    assert!(trace
        .items()
        .iter()
        .any(|item| matches!(item.action, ThreadAction::SetNumCapabilities(4))));
}

#[test]
fn fork_os_children_report_bound() {
    init_test_logging();
    let (result, _) = run(MemType::SequentialConsistency, 2, || {
        Action::new_mvar(|m| {
            Action::fork_os(
                Action::is_current_thread_bound(move |b| {
                    Action::put_mvar(m, Value::new(b), Action::stop())
                }),
                move |_| Action::take_mvar(m, Action::stop_with),
            )
        })
    });
    assert_eq!(result.unwrap().extract::<bool>(), Some(true));
}

#[test]
fn thread_delay_behaves_as_a_recorded_yield() {
    init_test_logging();
    let (result, trace) = run(MemType::SequentialConsistency, 2, || {
        Action::thread_delay(1000, Action::stop_with(Value::new(1_i32)))
    });
    assert_eq!(result.unwrap().extract::<i32>(), Some(1));
    assert!(trace
        .items()
        .iter()
        .any(|item| matches!(item.action, ThreadAction::ThreadDelay(1000))));
}

#[test]
fn orphaned_blocked_threads_do_not_fail_termination() {
    init_test_logging();
    // The child blocks forever, but the initial thread finishes.
    let (result, _) = run(MemType::SequentialConsistency, 2, || {
        Action::new_mvar(|m| {
            Action::fork(
                Action::take_mvar(m, |_| Action::stop()),
                |_| Action::stop_with(Value::new(0_i32)),
            )
        })
    });
    assert_eq!(result.unwrap().extract::<i32>(), Some(0));
}

#[test]
fn try_variants_never_block() {
    init_test_logging();
    let (result, _) = run(MemType::SequentialConsistency, 2, || {
        Action::new_mvar(|m| {
            Action::try_take_mvar(m, move |empty| {
                assert!(empty.is_none());
                Action::try_put_mvar(m, Value::new(3_i32), move |ok| {
                    assert!(ok);
                    Action::try_put_mvar(m, Value::new(4_i32), move |ok2| {
                        assert!(!ok2, "second put into a full MVar must fail");
                        Action::try_read_mvar(m, move |v| {
                            Action::stop_with(v.expect("full"))
                        })
                    })
                })
            })
        })
    });
    assert_eq!(result.unwrap().extract::<i32>(), Some(3));
}

#[test]
fn search_respects_the_execution_cap() {
    init_test_logging();
    let config = SearchConfig::new(2).max_executions(1);
    let results = search(MemType::SequentialConsistency, &config, racing_puts);
    assert_eq!(results.len(), 1);
}

#[test]
fn scheduler_abort_is_reported() {
    init_test_logging();
    // An empty replay schedule aborts at the first decision.
    let (result, trace) = weft::replay(MemType::SequentialConsistency, 2, [], fork_put_take);
    assert_eq!(result.unwrap_err(), Failure::Abort);
    assert!(trace.is_empty());
}
