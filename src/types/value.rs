//! Type-erased cell payloads.
//!
//! Shared cells are polymorphic at the user-API boundary but
//! monomorphic inside the engine: every MVar, IORef and TVar holds a
//! [`Value`], an opaque reference-counted payload. Cloning is cheap
//! (an `Arc` bump), which is what lets the engine move values through
//! buffers, undo logs and continuations without caring what they are.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An opaque, type-erased payload carried through the engine.
#[derive(Clone)]
pub struct Value(Arc<dyn Any + Send + Sync>);

impl Value {
    /// Wraps an arbitrary payload.
    #[must_use]
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// The unit payload, used where an operation has nothing to return.
    #[must_use]
    pub fn unit() -> Self {
        Self::new(())
    }

    /// Borrows the payload as `T`, if that is its dynamic type.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Extracts a clone of the payload as `T`.
    ///
    /// Convenience for test assertions and small `Copy`-ish payloads.
    #[must_use]
    pub fn extract<T: Any + Clone>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    /// True if the payload has dynamic type `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Value(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_payload() {
        let v = Value::new(42_i32);
        assert!(v.is::<i32>());
        assert_eq!(v.extract::<i32>(), Some(42));
        assert_eq!(v.downcast_ref::<i32>(), Some(&42));
    }

    #[test]
    fn wrong_type_is_none() {
        let v = Value::new("hello");
        assert_eq!(v.extract::<i32>(), None);
    }

    #[test]
    fn clones_share_the_payload() {
        let v = Value::new(vec![1, 2, 3]);
        let w = v.clone();
        assert_eq!(w.extract::<Vec<i32>>(), Some(vec![1, 2, 3]));
    }
}
