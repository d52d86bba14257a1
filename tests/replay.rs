//! Replay round-trips: re-running any execution with its recorded
//! schedule reproduces the trace exactly, for single runs and for
//! every trace a search produces.

mod common;
use common::init_test_logging;

use weft::explore::SearchConfig;
use weft::program::stm::Stm;
use weft::program::Action;
use weft::types::{MemType, TVarId, Value};
use weft::{replay, run, search};

fn mixed_program() -> Action {
    Action::new_mvar_labeled("box", |m| {
        Action::new_ioref_labeled("cell", Value::new(0_i32), move |r| {
            Action::fork(
                Action::write_ioref(
                    r,
                    Value::new(1_i32),
                    Action::put_mvar(m, Value::new(2_i32), Action::stop()),
                ),
                move |_| {
                    Action::take_mvar(m, move |v| {
                        Action::read_ioref(r, move |w| {
                            let sum = v.extract::<i32>().unwrap_or(0)
                                + w.extract::<i32>().unwrap_or(0);
                            Action::stop_with(Value::new(sum))
                        })
                    })
                },
            )
        })
    })
}

fn stm_program() -> Action {
    Action::atomically(
        || Stm::new_tvar(Value::new(false), |t| Stm::ret(Value::new(t))),
        |v| {
            let t = v.extract::<TVarId>().expect("tvar id");
            Action::fork(
                Action::atomically(
                    move || Stm::write(t, Value::new(true), Stm::ret(Value::unit())),
                    |_| Action::stop(),
                ),
                move |_| {
                    Action::atomically(
                        move || {
                            Stm::read(t, |v| {
                                if v.extract::<bool>() == Some(true) {
                                    Stm::ret(v)
                                } else {
                                    Stm::retry()
                                }
                            })
                        },
                        Action::stop_with,
                    )
                },
            )
        },
    )
}

fn assert_replays_exactly(memtype: MemType, program: fn() -> Action) {
    let (_, original) = run(memtype, 2, program);
    let schedule = original.schedule_order();
    let (_, replayed) = replay(memtype, 2, schedule, program);
    assert_eq!(original, replayed, "replay must reproduce the trace");
}

#[test]
fn round_robin_runs_replay_exactly() {
    init_test_logging();
    for memtype in [
        MemType::SequentialConsistency,
        MemType::TotalStoreOrder,
        MemType::PartialStoreOrder,
    ] {
        assert_replays_exactly(memtype, mixed_program);
        assert_replays_exactly(memtype, stm_program);
    }
}

#[test]
fn every_searched_trace_replays_exactly() {
    init_test_logging();
    for memtype in [MemType::SequentialConsistency, MemType::TotalStoreOrder] {
        let results = search(memtype, &SearchConfig::new(2), mixed_program);
        assert!(!results.is_empty());
        for (result, trace) in &results {
            let (replayed_result, replayed_trace) =
                replay(memtype, 2, trace.schedule_order(), mixed_program);
            assert_eq!(trace, &replayed_trace, "under {memtype:?}");
            assert_eq!(result.is_ok(), replayed_result.is_ok());
        }
    }
}

#[test]
fn identifiers_are_stable_across_replays() {
    init_test_logging();
    let (_, first) = run(MemType::SequentialConsistency, 2, mixed_program);
    let (_, second) = run(MemType::SequentialConsistency, 2, mixed_program);
    // The same deterministic scheduler yields the identical trace,
    // identifiers included.
    assert_eq!(first, second);
}
