//! The transactional sub-language.
//!
//! A transaction is a tree of [`Stm`] values in the same
//! next-continuation shape as [`Action`](crate::program::Action).
//! Transactions are interpreted to completion inside a single `atom`
//! step; their intermediate state is never visible to other threads.

use std::any::Any;
use std::sync::Arc;

use crate::types::{Exception, TVarId, Value};

/// A continuation inside a transaction.
pub type StmKont = Box<dyn FnOnce(Value) -> Stm>;

/// An installed transactional handler: accepts a matching exception
/// or gives it back to keep propagating.
pub type StmHandlerFn = Box<dyn FnOnce(Exception) -> Result<Stm, Exception>>;

/// One transactional primitive plus its continuation.
pub enum Stm {
    /// The transaction completes with this value.
    Return(Value),
    /// Allocate a fresh TVar.
    New {
        label: Option<&'static str>,
        value: Value,
        k: Box<dyn FnOnce(TVarId) -> Stm>,
    },
    Read {
        tvar: TVarId,
        k: StmKont,
    },
    Write {
        tvar: TVarId,
        value: Value,
        next: Box<Stm>,
    },
    /// Abort and re-run when any TVar read so far changes.
    Retry,
    /// Run `first`; if it retries, undo its effects and run `second`.
    OrElse {
        first: Box<Stm>,
        second: Box<Stm>,
        k: StmKont,
    },
    /// Run `body`; a matching exception undoes its effects and runs
    /// the handler.
    Catch {
        body: Box<Stm>,
        handler: StmHandlerFn,
        k: StmKont,
    },
    /// Abort the transaction with an exception.
    Throw(Exception),
}

impl Stm {
    #[must_use]
    pub fn ret(value: Value) -> Self {
        Self::Return(value)
    }

    pub fn new_tvar(value: Value, k: impl FnOnce(TVarId) -> Stm + 'static) -> Self {
        Self::New {
            label: None,
            value,
            k: Box::new(k),
        }
    }

    pub fn new_tvar_labeled(
        label: &'static str,
        value: Value,
        k: impl FnOnce(TVarId) -> Stm + 'static,
    ) -> Self {
        Self::New {
            label: Some(label),
            value,
            k: Box::new(k),
        }
    }

    pub fn read(tvar: TVarId, k: impl FnOnce(Value) -> Stm + 'static) -> Self {
        Self::Read {
            tvar,
            k: Box::new(k),
        }
    }

    pub fn write(tvar: TVarId, value: Value, next: Stm) -> Self {
        Self::Write {
            tvar,
            value,
            next: Box::new(next),
        }
    }

    #[must_use]
    pub fn retry() -> Self {
        Self::Retry
    }

    pub fn or_else(first: Stm, second: Stm, k: impl FnOnce(Value) -> Stm + 'static) -> Self {
        Self::OrElse {
            first: Box::new(first),
            second: Box::new(second),
            k: Box::new(k),
        }
    }

    /// Guard `body` with a handler for exceptions of kind `E`.
    pub fn catch<E: Any + Send + Sync>(
        body: Stm,
        handler: impl FnOnce(Arc<E>) -> Stm + 'static,
        k: impl FnOnce(Value) -> Stm + 'static,
    ) -> Self {
        Self::Catch {
            body: Box::new(body),
            handler: Box::new(move |exc| match exc.downcast::<E>() {
                Ok(e) => Ok(handler(e)),
                Err(exc) => Err(exc),
            }),
            k: Box::new(k),
        }
    }

    pub fn throw<E: Any + Send + Sync>(exception: E) -> Self {
        Self::Throw(Exception::new(exception))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_produce_the_expected_shapes() {
        let stm = Stm::new_tvar(Value::new(0_i32), |t| {
            Stm::write(t, Value::new(1_i32), Stm::read(t, Stm::ret))
        });
        assert!(matches!(stm, Stm::New { label: None, .. }));

        let stm = Stm::or_else(Stm::retry(), Stm::ret(Value::new(2_i32)), Stm::ret);
        assert!(matches!(stm, Stm::OrElse { .. }));
    }

    #[test]
    fn catch_matches_by_kind() {
        struct Boom;
        let stm = Stm::catch::<Boom>(
            Stm::throw(Boom),
            |_| Stm::ret(Value::new(1_i32)),
            Stm::ret,
        );
        let Stm::Catch { handler, .. } = stm else {
            panic!("expected Catch");
        };
        assert!(handler(Exception::new(Boom)).is_ok());

        let stm = Stm::catch::<Boom>(
            Stm::ret(Value::new(0_i32)),
            |_| Stm::ret(Value::new(1_i32)),
            Stm::ret,
        );
        let Stm::Catch { handler, .. } = stm else {
            panic!("expected Catch");
        };
        struct Other;
        assert!(handler(Exception::new(Other)).is_err());
    }
}
