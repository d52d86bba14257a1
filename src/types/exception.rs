//! Modeled exceptions with dynamic-kind matching.
//!
//! Exceptions inside a modeled program are opaque payloads matched by
//! dynamic type: a handler registered for kind `E` accepts an
//! [`Exception`] exactly when the payload downcasts to `E`. A failed
//! match re-raises to the next handler on the stack.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Masking state of a modeled thread.
///
/// Masking controls only the delivery of asynchronously thrown
/// exceptions (`throwTo`); synchronous `throw` is unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum MaskingState {
    /// Asynchronous exceptions may be delivered at any time.
    Unmasked,
    /// Delivery is deferred unless the thread is blocked on a
    /// blocking primitive.
    MaskedInterruptible,
    /// Delivery is always deferred.
    MaskedUninterruptible,
}

/// An exception value thrown inside a modeled program.
#[derive(Clone)]
pub struct Exception(Arc<dyn Any + Send + Sync>);

impl Exception {
    /// Wraps a payload as an exception of its dynamic kind.
    #[must_use]
    pub fn new<E: Any + Send + Sync>(payload: E) -> Self {
        Self(Arc::new(payload))
    }

    /// True if the exception has dynamic kind `E`.
    #[must_use]
    pub fn is<E: Any>(&self) -> bool {
        self.0.is::<E>()
    }

    /// Downcasts the exception to kind `E`, consuming it on success.
    ///
    /// # Errors
    ///
    /// Returns the exception unchanged when the kind does not match,
    /// so propagation can continue.
    pub fn downcast<E: Any + Send + Sync>(self) -> Result<Arc<E>, Self> {
        Arc::downcast::<E>(self.0).map_err(Self)
    }

    /// Borrows the payload as `E`, if that is its dynamic kind.
    #[must_use]
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Exception(..)")
    }
}
