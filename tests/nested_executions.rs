//! Nested engine invocations: `subconcurrency` and the `dont_check`
//! setup phase, including their legality rules.

mod common;
use common::init_test_logging;

use weft::program::Action;
use weft::trace::ThreadAction;
use weft::types::{MemType, Value};
use weft::{run, Failure};

#[test]
fn subconcurrency_returns_the_nested_result() {
    init_test_logging();
    let (result, trace) = run(MemType::SequentialConsistency, 2, || {
        Action::subconcurrency(
            Action::new_mvar(|m| {
                Action::fork(
                    Action::put_mvar(m, Value::new(5_i32), Action::stop()),
                    move |_| Action::take_mvar(m, Action::stop_with),
                )
            }),
            |outcome| {
                let v = outcome.expect("nested execution succeeds");
                Action::stop_with(v)
            },
        )
    });
    assert_eq!(result.unwrap().extract::<i32>(), Some(5));
    let actions: Vec<_> = trace.items().iter().map(|i| &i.action).collect();
    let open = actions
        .iter()
        .position(|a| matches!(a, ThreadAction::Subconcurrency))
        .expect("marker present");
    let close = actions
        .iter()
        .position(|a| matches!(a, ThreadAction::StopSubconcurrency))
        .expect("marker present");
    assert!(open < close, "nested trace is spliced between the markers");
    assert!(
        actions[open + 1..close]
            .iter()
            .any(|a| matches!(a, ThreadAction::PutMVar(..))),
        "nested steps appear between the markers"
    );
}

#[test]
fn subconcurrency_reports_nested_failures_as_values() {
    init_test_logging();
    let (result, _) = run(MemType::SequentialConsistency, 2, || {
        Action::subconcurrency(
            Action::new_mvar(|m| Action::take_mvar(m, |_| Action::stop())),
            |outcome| {
                assert_eq!(outcome.unwrap_err(), Failure::Deadlock);
                Action::stop_with(Value::new(1_i32))
            },
        )
    });
    assert_eq!(result.unwrap().extract::<i32>(), Some(1));
}

#[test]
fn subconcurrency_with_other_threads_live_is_illegal() {
    init_test_logging();
    let (result, _) = run(MemType::SequentialConsistency, 2, || {
        Action::new_mvar(|m| {
            Action::fork(Action::take_mvar(m, |_| Action::stop()), |_| {
                Action::subconcurrency(Action::stop(), |_| Action::stop())
            })
        })
    });
    assert_eq!(result.unwrap_err(), Failure::IllegalSubconcurrency);
}

#[test]
fn dont_check_runs_the_setup_unsystematically() {
    init_test_logging();
    let (result, trace) = run(MemType::SequentialConsistency, 2, || {
        Action::dont_check(
            Some(1000),
            |k| {
                Action::new_mvar(|m| {
                    Action::fork(
                        Action::put_mvar(m, Value::new(3_i32), Action::stop()),
                        move |_| Action::take_mvar(m, move |v| k(v)),
                    )
                })
            },
            Action::stop_with,
        )
    });
    assert_eq!(result.unwrap().extract::<i32>(), Some(3));
    let nested = trace
        .items()
        .iter()
        .find_map(|item| match &item.action {
            ThreadAction::DontCheck(items) => Some(items.len()),
            _ => None,
        })
        .expect("one DontCheck entry holds the setup trace");
    assert!(nested > 0);
}

#[test]
fn dont_check_after_the_first_action_is_illegal() {
    init_test_logging();
    let (result, _) = run(MemType::SequentialConsistency, 2, || {
        Action::yield_now(Action::dont_check(
            None,
            |k| k(Value::unit()),
            |_| Action::stop(),
        ))
    });
    assert_eq!(result.unwrap_err(), Failure::IllegalDontCheck);
}

#[test]
fn dont_check_step_bound_aborts_runaway_setup() {
    init_test_logging();
    fn spin(n: u32) -> Action {
        if n == 0 {
            Action::stop()
        } else {
            Action::yield_now(spin(n - 1))
        }
    }
    let (result, _) = run(MemType::SequentialConsistency, 2, || {
        Action::dont_check(
            Some(3),
            |k| {
                Action::fork(spin(100), move |_| {
                    Action::yield_now(Action::yield_now(Action::yield_now(Action::yield_now(
                        k(Value::unit()),
                    ))))
                })
            },
            |_| Action::stop_with(Value::new(1_i32)),
        )
    });
    assert_eq!(result.unwrap_err(), Failure::Abort);
}

#[test]
fn subconcurrency_inside_dont_check_is_illegal() {
    init_test_logging();
    let (result, _) = run(MemType::SequentialConsistency, 2, || {
        Action::dont_check(
            None,
            |k| Action::subconcurrency(Action::stop(), move |_| k(Value::unit())),
            |_| Action::stop(),
        )
    });
    assert_eq!(result.unwrap_err(), Failure::IllegalSubconcurrency);
}
