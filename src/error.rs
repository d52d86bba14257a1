//! Engine-level failures.
//!
//! A [`Failure`] terminates a single execution and is reported as its
//! result; the engine never recovers from one within an execution.
//! Modeled exceptions (thrown and caught *inside* a program) are a
//! separate taxonomy and live in [`crate::types::exception`] — the only
//! point of contact is [`Failure::UncaughtException`], raised when an
//! exception escapes the initial thread.

use serde::Serialize;
use thiserror::Error;

use crate::types::Value;

/// Why an execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize)]
pub enum Failure {
    /// The scheduler violated its contract (picked a blocked or
    /// nonexistent thread). Always a scheduler bug, never the program's.
    #[error("internal error: scheduler picked an unrunnable thread")]
    InternalError,
    /// Every thread is blocked and the initial thread is waiting on an
    /// MVar or on delivering an asynchronous exception.
    #[error("deadlock")]
    Deadlock,
    /// Every thread is blocked and the initial thread is inside a
    /// retried transaction no commit can wake.
    #[error("STM deadlock")]
    StmDeadlock,
    /// The scheduler declined to pick a thread while some were runnable.
    #[error("execution aborted by the scheduler")]
    Abort,
    /// An exception propagated off the top of the initial thread's
    /// handler stack.
    #[error("uncaught exception in the initial thread")]
    UncaughtException,
    /// `subconcurrency` was used while other threads were live or
    /// during a `dont_check` setup phase.
    #[error("subconcurrency used with other threads live")]
    IllegalSubconcurrency,
    /// `dont_check` was used anywhere but as the program's first action.
    #[error("dont_check used after the first action")]
    IllegalDontCheck,
}

/// The outcome of one execution: the initial thread's result, or the
/// failure that ended the run.
pub type ExecResult = Result<Value, Failure>;
