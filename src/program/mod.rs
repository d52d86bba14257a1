//! The modeled-program interface.
//!
//! A program is a tree of [`Action`] values: each variant is one
//! primitive effect plus a *next* field — either a further boxed
//! action, or a function from the primitive's result to the next
//! action. The engine owns the tree and applies the continuation
//! closures one step at a time; nothing here executes by itself.
//!
//! Programs are consumed by execution. Anything that runs a program
//! more than once (the search drivers) takes a `Fn() -> Action`
//! factory and builds a fresh tree per execution, which is what keeps
//! identifier allocation and scheduling replayable.
//!
//! The builder methods on [`Action`] are deliberately thin; the
//! user-facing test DSL that makes composing these pleasant lives
//! outside this crate.

pub mod stm;

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::Failure;
use crate::trace::Lookahead;
use crate::types::{Exception, IORefId, MVarId, MaskingState, Ticket, ThreadId, Value};

use stm::Stm;

/// A continuation: consumes a primitive's result, yields the rest of
/// the thread's program.
pub type Kont = Box<dyn FnOnce(Value) -> Action>;

/// An installed exception handler: accepts a matching exception and
/// yields the handler program, or gives the exception back so
/// propagation can continue.
pub type HandlerFn = Box<dyn FnOnce(Exception) -> Result<Action, Exception>>;

/// One primitive effect plus its continuation.
pub enum Action {
    /// Create a runnable thread from `child`, masked as the parent.
    Fork {
        label: Option<&'static str>,
        child: Box<Action>,
        k: Box<dyn FnOnce(ThreadId) -> Action>,
    },
    /// As [`Action::Fork`], additionally marking the child OS-bound.
    ForkOs {
        label: Option<&'static str>,
        child: Box<Action>,
        k: Box<dyn FnOnce(ThreadId) -> Action>,
    },
    MyThreadId {
        k: Box<dyn FnOnce(ThreadId) -> Action>,
    },
    GetNumCapabilities {
        k: Box<dyn FnOnce(usize) -> Action>,
    },
    SetNumCapabilities {
        caps: usize,
        next: Box<Action>,
    },
    IsCurrentThreadBound {
        k: Box<dyn FnOnce(bool) -> Action>,
    },
    Yield {
        next: Box<Action>,
    },
    /// Modeled as a yield; the duration is recorded in the trace only.
    ThreadDelay {
        micros: u64,
        next: Box<Action>,
    },

    NewMVar {
        label: Option<&'static str>,
        k: Box<dyn FnOnce(MVarId) -> Action>,
    },
    /// Blocks while the cell is full.
    PutMVar {
        mvar: MVarId,
        value: Value,
        next: Box<Action>,
    },
    TryPutMVar {
        mvar: MVarId,
        value: Value,
        k: Box<dyn FnOnce(bool) -> Action>,
    },
    /// Blocks while the cell is empty; leaves the value in place.
    ReadMVar {
        mvar: MVarId,
        k: Kont,
    },
    TryReadMVar {
        mvar: MVarId,
        k: Box<dyn FnOnce(Option<Value>) -> Action>,
    },
    /// Blocks while the cell is empty.
    TakeMVar {
        mvar: MVarId,
        k: Kont,
    },
    TryTakeMVar {
        mvar: MVarId,
        k: Box<dyn FnOnce(Option<Value>) -> Action>,
    },

    NewIORef {
        label: Option<&'static str>,
        value: Value,
        k: Box<dyn FnOnce(IORefId) -> Action>,
    },
    ReadIORef {
        ioref: IORefId,
        k: Kont,
    },
    ReadForCas {
        ioref: IORefId,
        k: Box<dyn FnOnce(Ticket) -> Action>,
    },
    /// Buffered under TSO/PSO, immediate under SC.
    WriteIORef {
        ioref: IORefId,
        value: Value,
        next: Box<Action>,
    },
    /// Synchronised read-modify-write; `f` returns the new cell value
    /// and the value passed to the continuation.
    ModIORef {
        ioref: IORefId,
        f: Box<dyn FnOnce(Value) -> (Value, Value)>,
        k: Kont,
    },
    /// Synchronised compare-and-swap against a ticket.
    CasIORef {
        ioref: IORefId,
        ticket: Ticket,
        value: Value,
        k: Box<dyn FnOnce(bool, Ticket) -> Action>,
    },

    /// Run a transaction atomically. The factory is re-invoked when a
    /// retried transaction is woken, so it must be pure.
    Atom {
        stm: Box<dyn Fn() -> Stm>,
        k: Kont,
    },

    /// Synchronous raise on the current thread.
    Throw {
        exception: Exception,
    },
    /// Push a handler frame for the dynamic extent of `next`.
    Catching {
        handler: HandlerFn,
        next: Box<Action>,
    },
    /// Pop the innermost handler frame (inserted by the builder at the
    /// end of a guarded block).
    PopCatching {
        next: Box<Action>,
    },
    /// Set the masking state for the dynamic extent of `body`.
    Mask {
        masking: MaskingState,
        body: Box<dyn FnOnce(Unmask, Kont) -> Action>,
        k: Kont,
    },
    /// Revert (or set) the masking state; inserted by the engine and
    /// by [`Unmask::around`].
    ResetMask {
        set: bool,
        masking: MaskingState,
        next: Box<Action>,
    },
    /// Asynchronous raise on another thread; blocks the sender while
    /// the target is uninterruptible.
    ThrowTo {
        target: ThreadId,
        exception: Exception,
        next: Box<Action>,
    },

    /// A lifted native effect. Runs once per execution; the search
    /// drivers re-run programs, so the effect must be idempotent.
    Lift {
        effect: Box<dyn FnOnce() -> Value>,
        k: Kont,
    },

    /// A pure value (a schedulable no-op step).
    Pure {
        value: Value,
        k: Kont,
    },
    /// Thread teardown; a `Some` result from the initial thread is the
    /// program's result.
    Stop {
        result: Option<Value>,
    },

    /// Run `program` as a full nested execution and hand its outcome
    /// to `k`. Legal only while no other thread is live.
    Subconcurrency {
        program: Box<Action>,
        k: Box<dyn FnOnce(Result<Value, Failure>) -> Action>,
    },
    /// Run `body` as an unsystematic setup phase (round-robin,
    /// sequential consistency, step-bounded). Legal only as the
    /// program's first action.
    DontCheck {
        bound: Option<u64>,
        body: Box<dyn FnOnce(Kont) -> Action>,
        k: Kont,
    },
    /// Internal marker closing a setup phase. Built by the driver.
    #[doc(hidden)]
    DontCheckEnd {
        value: Value,
        k: Kont,
    },
}

impl Action {
    /// Summarises this action for scheduling and dependence decisions.
    #[must_use]
    pub fn lookahead(&self) -> Lookahead {
        match self {
            Self::Fork { .. } => Lookahead::WillFork,
            Self::ForkOs { .. } => Lookahead::WillForkOs,
            Self::MyThreadId { .. } => Lookahead::WillMyThreadId,
            Self::GetNumCapabilities { .. } => Lookahead::WillGetNumCapabilities,
            Self::SetNumCapabilities { caps, .. } => Lookahead::WillSetNumCapabilities(*caps),
            Self::IsCurrentThreadBound { .. } => Lookahead::WillIsCurrentThreadBound,
            Self::Yield { .. } => Lookahead::WillYield,
            Self::ThreadDelay { micros, .. } => Lookahead::WillThreadDelay(*micros),
            Self::NewMVar { .. } => Lookahead::WillNewMVar,
            Self::PutMVar { mvar, .. } => Lookahead::WillPutMVar(*mvar),
            Self::TryPutMVar { mvar, .. } => Lookahead::WillTryPutMVar(*mvar),
            Self::ReadMVar { mvar, .. } => Lookahead::WillReadMVar(*mvar),
            Self::TryReadMVar { mvar, .. } => Lookahead::WillTryReadMVar(*mvar),
            Self::TakeMVar { mvar, .. } => Lookahead::WillTakeMVar(*mvar),
            Self::TryTakeMVar { mvar, .. } => Lookahead::WillTryTakeMVar(*mvar),
            Self::NewIORef { .. } => Lookahead::WillNewIORef,
            Self::ReadIORef { ioref, .. } => Lookahead::WillReadIORef(*ioref),
            Self::ReadForCas { ioref, .. } => Lookahead::WillReadForCas(*ioref),
            Self::WriteIORef { ioref, .. } => Lookahead::WillWriteIORef(*ioref),
            Self::ModIORef { ioref, .. } => Lookahead::WillModIORef(*ioref),
            Self::CasIORef { ioref, .. } => Lookahead::WillCasIORef(*ioref),
            Self::Atom { .. } => Lookahead::WillStm,
            Self::Throw { .. } => Lookahead::WillThrow,
            Self::Catching { .. } => Lookahead::WillCatching,
            Self::PopCatching { .. } => Lookahead::WillPopCatching,
            Self::Mask { .. } => Lookahead::WillMask,
            Self::ResetMask { .. } => Lookahead::WillResetMask,
            Self::ThrowTo { target, .. } => Lookahead::WillThrowTo(*target),
            Self::Lift { .. } => Lookahead::WillLift,
            Self::Pure { .. } => Lookahead::WillReturn,
            Self::Stop { .. } => Lookahead::WillStop,
            Self::Subconcurrency { .. } => Lookahead::WillSubconcurrency,
            Self::DontCheck { .. } => Lookahead::WillDontCheck,
            Self::DontCheckEnd { .. } => Lookahead::WillReturn,
        }
    }
}

// --- builders ------------------------------------------------------------

impl Action {
    pub fn fork(
        child: Action,
        k: impl FnOnce(ThreadId) -> Action + 'static,
    ) -> Self {
        Self::Fork {
            label: None,
            child: Box::new(child),
            k: Box::new(k),
        }
    }

    pub fn fork_labeled(
        label: &'static str,
        child: Action,
        k: impl FnOnce(ThreadId) -> Action + 'static,
    ) -> Self {
        Self::Fork {
            label: Some(label),
            child: Box::new(child),
            k: Box::new(k),
        }
    }

    pub fn fork_os(
        child: Action,
        k: impl FnOnce(ThreadId) -> Action + 'static,
    ) -> Self {
        Self::ForkOs {
            label: None,
            child: Box::new(child),
            k: Box::new(k),
        }
    }

    pub fn my_thread_id(k: impl FnOnce(ThreadId) -> Action + 'static) -> Self {
        Self::MyThreadId { k: Box::new(k) }
    }

    pub fn get_num_capabilities(k: impl FnOnce(usize) -> Action + 'static) -> Self {
        Self::GetNumCapabilities { k: Box::new(k) }
    }

    pub fn set_num_capabilities(caps: usize, next: Action) -> Self {
        Self::SetNumCapabilities {
            caps,
            next: Box::new(next),
        }
    }

    pub fn is_current_thread_bound(k: impl FnOnce(bool) -> Action + 'static) -> Self {
        Self::IsCurrentThreadBound { k: Box::new(k) }
    }

    pub fn yield_now(next: Action) -> Self {
        Self::Yield {
            next: Box::new(next),
        }
    }

    pub fn thread_delay(micros: u64, next: Action) -> Self {
        Self::ThreadDelay {
            micros,
            next: Box::new(next),
        }
    }

    pub fn new_mvar(k: impl FnOnce(MVarId) -> Action + 'static) -> Self {
        Self::NewMVar {
            label: None,
            k: Box::new(k),
        }
    }

    pub fn new_mvar_labeled(
        label: &'static str,
        k: impl FnOnce(MVarId) -> Action + 'static,
    ) -> Self {
        Self::NewMVar {
            label: Some(label),
            k: Box::new(k),
        }
    }

    pub fn put_mvar(mvar: MVarId, value: Value, next: Action) -> Self {
        Self::PutMVar {
            mvar,
            value,
            next: Box::new(next),
        }
    }

    pub fn try_put_mvar(
        mvar: MVarId,
        value: Value,
        k: impl FnOnce(bool) -> Action + 'static,
    ) -> Self {
        Self::TryPutMVar {
            mvar,
            value,
            k: Box::new(k),
        }
    }

    pub fn read_mvar(mvar: MVarId, k: impl FnOnce(Value) -> Action + 'static) -> Self {
        Self::ReadMVar {
            mvar,
            k: Box::new(k),
        }
    }

    pub fn try_read_mvar(
        mvar: MVarId,
        k: impl FnOnce(Option<Value>) -> Action + 'static,
    ) -> Self {
        Self::TryReadMVar {
            mvar,
            k: Box::new(k),
        }
    }

    pub fn take_mvar(mvar: MVarId, k: impl FnOnce(Value) -> Action + 'static) -> Self {
        Self::TakeMVar {
            mvar,
            k: Box::new(k),
        }
    }

    pub fn try_take_mvar(
        mvar: MVarId,
        k: impl FnOnce(Option<Value>) -> Action + 'static,
    ) -> Self {
        Self::TryTakeMVar {
            mvar,
            k: Box::new(k),
        }
    }

    pub fn new_ioref(
        value: Value,
        k: impl FnOnce(IORefId) -> Action + 'static,
    ) -> Self {
        Self::NewIORef {
            label: None,
            value,
            k: Box::new(k),
        }
    }

    pub fn new_ioref_labeled(
        label: &'static str,
        value: Value,
        k: impl FnOnce(IORefId) -> Action + 'static,
    ) -> Self {
        Self::NewIORef {
            label: Some(label),
            value,
            k: Box::new(k),
        }
    }

    pub fn read_ioref(ioref: IORefId, k: impl FnOnce(Value) -> Action + 'static) -> Self {
        Self::ReadIORef {
            ioref,
            k: Box::new(k),
        }
    }

    pub fn read_for_cas(ioref: IORefId, k: impl FnOnce(Ticket) -> Action + 'static) -> Self {
        Self::ReadForCas {
            ioref,
            k: Box::new(k),
        }
    }

    pub fn write_ioref(ioref: IORefId, value: Value, next: Action) -> Self {
        Self::WriteIORef {
            ioref,
            value,
            next: Box::new(next),
        }
    }

    pub fn mod_ioref(
        ioref: IORefId,
        f: impl FnOnce(Value) -> (Value, Value) + 'static,
        k: impl FnOnce(Value) -> Action + 'static,
    ) -> Self {
        Self::ModIORef {
            ioref,
            f: Box::new(f),
            k: Box::new(k),
        }
    }

    pub fn cas_ioref(
        ioref: IORefId,
        ticket: Ticket,
        value: Value,
        k: impl FnOnce(bool, Ticket) -> Action + 'static,
    ) -> Self {
        Self::CasIORef {
            ioref,
            ticket,
            value,
            k: Box::new(k),
        }
    }

    pub fn atomically(
        stm: impl Fn() -> Stm + 'static,
        k: impl FnOnce(Value) -> Action + 'static,
    ) -> Self {
        Self::Atom {
            stm: Box::new(stm),
            k: Box::new(k),
        }
    }

    pub fn throw<E: Any + Send + Sync>(exception: E) -> Self {
        Self::Throw {
            exception: Exception::new(exception),
        }
    }

    /// Guard `body` with a handler for exceptions of kind `E`.
    ///
    /// Both `body` and `handler` receive the continuation for the code
    /// after the guarded block; exactly one of them will invoke it.
    pub fn catching<E: Any + Send + Sync>(
        body: impl FnOnce(Kont) -> Action + 'static,
        handler: impl FnOnce(Arc<E>, Kont) -> Action + 'static,
        k: impl FnOnce(Value) -> Action + 'static,
    ) -> Self {
        let (k_body, k_handler) = split_kont(Box::new(k));
        let next = body(Box::new(move |v| Action::PopCatching {
            next: Box::new(k_body(v)),
        }));
        Self::Catching {
            handler: Box::new(move |exc| match exc.downcast::<E>() {
                Ok(e) => Ok(handler(e, k_handler)),
                Err(exc) => Err(exc),
            }),
            next: Box::new(next),
        }
    }

    /// Run `body` with the given masking state; `body` receives an
    /// [`Unmask`] capability restoring the caller's masking.
    pub fn masking(
        masking: MaskingState,
        body: impl FnOnce(Unmask, Kont) -> Action + 'static,
        k: impl FnOnce(Value) -> Action + 'static,
    ) -> Self {
        Self::Mask {
            masking,
            body: Box::new(body),
            k: Box::new(k),
        }
    }

    pub fn throw_to<E: Any + Send + Sync>(
        target: ThreadId,
        exception: E,
        next: Action,
    ) -> Self {
        Self::ThrowTo {
            target,
            exception: Exception::new(exception),
            next: Box::new(next),
        }
    }

    pub fn lift(
        effect: impl FnOnce() -> Value + 'static,
        k: impl FnOnce(Value) -> Action + 'static,
    ) -> Self {
        Self::Lift {
            effect: Box::new(effect),
            k: Box::new(k),
        }
    }

    pub fn pure(value: Value, k: impl FnOnce(Value) -> Action + 'static) -> Self {
        Self::Pure {
            value,
            k: Box::new(k),
        }
    }

    #[must_use]
    pub fn stop() -> Self {
        Self::Stop { result: None }
    }

    #[must_use]
    pub fn stop_with(result: Value) -> Self {
        Self::Stop {
            result: Some(result),
        }
    }

    pub fn subconcurrency(
        program: Action,
        k: impl FnOnce(Result<Value, Failure>) -> Action + 'static,
    ) -> Self {
        Self::Subconcurrency {
            program: Box::new(program),
            k: Box::new(k),
        }
    }

    pub fn dont_check(
        bound: Option<u64>,
        body: impl FnOnce(Kont) -> Action + 'static,
        k: impl FnOnce(Value) -> Action + 'static,
    ) -> Self {
        Self::DontCheck {
            bound,
            body: Box::new(body),
            k: Box::new(k),
        }
    }
}

/// Capability handed to a [`Action::masking`] body: runs a sub-block
/// with the caller's prior masking restored.
#[derive(Clone, Copy)]
pub struct Unmask {
    pub(crate) outer: MaskingState,
    pub(crate) masked: MaskingState,
}

impl Unmask {
    /// Run `body` with masking reverted to the caller's state, then
    /// restore the masked state and continue with `k`.
    pub fn around(
        self,
        body: impl FnOnce(Kont) -> Action + 'static,
        k: impl FnOnce(Value) -> Action + 'static,
    ) -> Action {
        let Self { outer, masked } = self;
        Action::ResetMask {
            set: true,
            masking: outer,
            next: Box::new(body(Box::new(move |v| Action::ResetMask {
                set: false,
                masking: masked,
                next: Box::new(k(v)),
            }))),
        }
    }
}

/// Splits a continuation between two mutually exclusive paths (the
/// guarded block and its handler). Only one path may run it.
fn split_kont(k: Kont) -> (Kont, Kont) {
    let cell = Rc::new(RefCell::new(Some(k)));
    let left: Kont = {
        let cell = Rc::clone(&cell);
        Box::new(move |v: Value| {
            let k = cell
                .borrow_mut()
                .take()
                .expect("both arms of a guarded block ran");
            k(v)
        })
    };
    let right: Kont = Box::new(move |v: Value| {
        let k = cell
            .borrow_mut()
            .take()
            .expect("both arms of a guarded block ran");
        k(v)
    });
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookahead_carries_cell_identity() {
        let program = Action::new_mvar(|m| {
            Action::put_mvar(m, Value::new(1_i32), Action::stop())
        });
        assert_eq!(program.lookahead(), Lookahead::WillNewMVar);
    }

    #[test]
    fn split_kont_allows_exactly_one_use() {
        let (a, b) = split_kont(Box::new(|_| Action::stop()));
        drop(b);
        let action = a(Value::unit());
        assert!(matches!(action, Action::Stop { result: None }));
    }

    #[test]
    #[should_panic(expected = "both arms")]
    fn split_kont_rejects_double_use() {
        let (a, b) = split_kont(Box::new(|_| Action::stop()));
        let _ = a(Value::unit());
        let _ = b(Value::unit());
    }

    #[test]
    fn catching_builds_a_guarded_chain() {
        struct Boom;
        let action = Action::catching::<Boom>(
            |k| Action::pure(Value::new(7_i32), move |v| k(v)),
            |_e, k| k(Value::unit()),
            |_| Action::stop(),
        );
        assert_eq!(action.lookahead(), Lookahead::WillCatching);
        match action {
            Action::Catching { next, .. } => {
                assert_eq!(next.lookahead(), Lookahead::WillReturn);
            }
            _ => panic!("expected a Catching chain"),
        }
    }

    #[test]
    fn unmask_around_wraps_with_mask_resets() {
        let unmask = Unmask {
            outer: MaskingState::Unmasked,
            masked: MaskingState::MaskedInterruptible,
        };
        let action = unmask.around(|k| k(Value::unit()), |_| Action::stop());
        match action {
            Action::ResetMask { set: true, masking, next } => {
                assert_eq!(masking, MaskingState::Unmasked);
                match *next {
                    Action::ResetMask { set: false, masking, .. } => {
                        assert_eq!(masking, MaskingState::MaskedInterruptible);
                    }
                    _ => panic!("expected restore step"),
                }
            }
            _ => panic!("expected unmask entry step"),
        }
    }
}
