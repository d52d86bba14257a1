//! Systematic concurrency testing for modeled programs.
//!
//! weft interprets a concurrent program — a tree of [`Action`]
//! primitives covering threads, MVars, IORefs, STM, exceptions and
//! masking — entirely deterministically, one primitive step at a
//! time, under a pluggable [`Scheduler`](sched::Scheduler) and a
//! configurable relaxed-memory model
//! ([`MemType`]: sequential consistency, TSO or PSO). On top of the
//! deterministic engine, the [`explore`] module drives a systematic
//! search with bounded partial-order reduction: it replays scheduling
//! prefixes, inserts backtracking points where dependent steps could
//! have been reordered, and reports every distinguishable outcome
//! within the preemption bound.
//!
//! # One execution
//!
//! ```ignore
//! use weft::{run, program::Action, types::{MemType, Value}};
//!
//! let (result, trace) = run(MemType::SequentialConsistency, 2, || {
//!     Action::new_mvar(|m| {
//!         Action::fork(
//!             Action::put_mvar(m, Value::new(1_i32), Action::stop()),
//!             move |_child| Action::take_mvar(m, Action::stop_with),
//!         )
//!     })
//! });
//! assert_eq!(result.unwrap().extract::<i32>(), Some(1));
//! assert!(!trace.is_empty());
//! ```
//!
//! # Exhaustive search
//!
//! ```ignore
//! use weft::{search, explore::SearchConfig, types::MemType};
//!
//! let results = search(MemType::SequentialConsistency, &SearchConfig::new(2), || {
//!     /* program */
//! # weft::program::Action::stop()
//! });
//! for (result, trace) in &results {
//!     /* classify each distinguishable outcome */
//! }
//! ```
//!
//! The engine is single-threaded and cooperative: modeled blocking is
//! table state, never host blocking, and re-running any execution
//! with its recorded schedule reproduces the trace byte-for-byte.

pub mod error;
pub mod explore;
pub mod program;
pub mod sched;
pub mod trace;
pub mod types;
pub mod util;

mod runtime;

pub use error::{ExecResult, Failure};
pub use explore::{search_random, SearchConfig, SearchReport};
pub use program::{stm::Stm, Action};
pub use trace::Trace;
pub use types::{MemType, Value};

use program::Action as Program;
use sched::{PrefixScheduler, RoundRobin, Scheduler};
use types::ThreadId;

/// Runs one execution under the deterministic non-preemptive
/// round-robin scheduler.
pub fn run(
    memtype: MemType,
    caps: usize,
    program: impl FnOnce() -> Program,
) -> (ExecResult, Trace) {
    let mut sched = RoundRobin::new();
    run_with_scheduler(memtype, caps, &mut sched, program)
}

/// Runs one execution under a caller-supplied scheduler.
pub fn run_with_scheduler(
    memtype: MemType,
    caps: usize,
    sched: &mut dyn Scheduler,
    program: impl FnOnce() -> Program,
) -> (ExecResult, Trace) {
    runtime::driver::run_execution(program(), sched, memtype, caps, None)
}

/// Replays a recorded schedule (see [`Trace::schedule_order`]).
///
/// Replay is exact: the engine is deterministic in everything but
/// scheduling, so the same choices reproduce the same trace.
pub fn replay(
    memtype: MemType,
    caps: usize,
    schedule: impl IntoIterator<Item = ThreadId>,
    program: impl FnOnce() -> Program,
) -> (ExecResult, Trace) {
    let mut sched = PrefixScheduler::new(schedule);
    run_with_scheduler(memtype, caps, &mut sched, program)
}

/// Systematic bounded search over every schedule within the
/// preemption bound. See [`explore::search`] for the knobs.
pub fn search(
    memtype: MemType,
    config: &SearchConfig,
    program: impl Fn() -> Program,
) -> Vec<(ExecResult, Trace)> {
    explore::search(memtype, config, program)
}
