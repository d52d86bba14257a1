//! The deterministic model runtime.
//!
//! Everything an execution mutates lives in one [`Context`]: the
//! identifier source, the thread table, the shared-cell store with
//! its write buffer, and the capability count. The context is owned
//! exclusively by the driver and only ever mutated inside a stepper
//! transition, so capturing determinism is a matter of replaying
//! scheduler decisions.

pub(crate) mod driver;
pub(crate) mod ids;
pub(crate) mod memory;
pub(crate) mod stepper;
pub(crate) mod stm;
pub(crate) mod threads;

use crate::types::{MemType, ThreadId, Value};

use ids::IdSource;
use memory::Memory;
use threads::{BlockedOn, ThreadTable};

/// The whole mutable state of one execution.
pub(crate) struct Context {
    pub ids: IdSource,
    pub threads: ThreadTable,
    pub memory: Memory,
    pub caps: usize,
    /// The root thread of the phase currently being driven; uncaught
    /// exceptions here fail the phase, and its `Stop` result is the
    /// phase's result.
    pub initial: ThreadId,
    /// True while a `dont_check` setup phase runs.
    pub in_setup: bool,
    /// The initial thread's `Stop` payload, once it has stopped.
    pub result: Option<Value>,
    /// Steps taken so far, across all phases.
    pub steps: u64,
}

impl Context {
    pub fn new(memtype: MemType, caps: usize) -> Self {
        let mut ids = IdSource::new();
        let initial = ids.next_thread(Some("main"));
        Self {
            ids,
            threads: ThreadTable::new(),
            memory: Memory::new(memtype),
            caps,
            initial,
            in_setup: false,
            result: None,
            steps: 0,
        }
    }

    /// Asserts the cross-structure invariants that must hold at every
    /// scheduling point. Debug builds call this each step.
    ///
    /// # Panics
    ///
    /// Panics on any violation; these are engine bugs, never program
    /// bugs.
    #[allow(dead_code)]
    pub fn check_invariants(&self) {
        for (id, thread) in self.threads.iter() {
            match &thread.blocking {
                Some(BlockedOn::MVarFull(m) | BlockedOn::MVarEmpty(m)) => {
                    assert!(
                        self.memory.mvar_has_waiter(*m, id),
                        "blocked thread {id:?} missing from waiter queues of {m:?}"
                    );
                }
                Some(BlockedOn::Mask(target)) => {
                    // The target may have died this step; the waiter is
                    // woken before the next scheduling point.
                    let _ = target;
                }
                Some(BlockedOn::TVar(_)) | None => {}
            }
        }
        for (mvar, cell) in self.memory.mvars() {
            for waiter in cell
                .waiting_put
                .iter()
                .chain(cell.waiting_take.iter())
                .chain(cell.waiting_read.iter())
            {
                let thread = self
                    .threads
                    .get(*waiter)
                    .unwrap_or_else(|| panic!("dead thread {waiter:?} waits on {mvar:?}"));
                assert!(
                    thread.blocking.is_some(),
                    "queued thread {waiter:?} is not blocked"
                );
            }
        }
        if matches!(self.memory.memtype, MemType::SequentialConsistency) {
            assert!(
                self.memory.buffer.is_empty(),
                "write buffer must stay empty under sequential consistency"
            );
        }
    }
}
