//! Identifier types for modeled threads and shared cells.
//!
//! Every identifier is a numeric index tagged with an optional
//! creation label. Identity (equality, ordering, hashing) uses the
//! index only; the label exists for trace readability. Allocation is
//! strictly increasing per kind and identifiers are never reused
//! within a single execution, so two executions that make the same
//! scheduling decisions allocate identical identifiers.

use core::fmt;
use core::hash::{Hash, Hasher};

use serde::Serialize;

/// First raw value of the synthetic commit-thread range.
///
/// Commit threads are virtual runnables that flush one write-buffer
/// entry when scheduled. Their ids sort after every real thread so a
/// free-mode scheduler prefers real threads.
pub(crate) const COMMIT_ID_BASE: u32 = 1 << 30;

macro_rules! identifier {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Serialize)]
        pub struct $name {
            raw: u32,
            label: Option<&'static str>,
        }

        impl $name {
            pub(crate) const fn new(raw: u32, label: Option<&'static str>) -> Self {
                Self { raw, label }
            }

            /// Returns the numeric index of this identifier.
            #[must_use]
            pub const fn raw(self) -> u32 {
                self.raw
            }

            /// Returns the creation label, if one was supplied.
            #[must_use]
            pub const fn label(self) -> Option<&'static str> {
                self.label
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.raw == other.raw
            }
        }

        impl Eq for $name {}

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> core::cmp::Ordering {
                self.raw.cmp(&other.raw)
            }
        }

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                state.write_u32(self.raw);
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.label {
                    Some(label) => write!(f, "{}({}:{label})", stringify!($name), self.raw),
                    None => write!(f, "{}({})", stringify!($name), self.raw),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.label {
                    Some(label) => write!(f, "{label}"),
                    None => write!(f, "{}", self.raw),
                }
            }
        }
    };
}

identifier! {
    /// Identifier of a modeled thread.
    ThreadId
}

identifier! {
    /// Identifier of an MVar (blocking one-value cell).
    MVarId
}

identifier! {
    /// Identifier of an IORef (non-blocking cell with buffered writes).
    IORefId
}

identifier! {
    /// Identifier of a TVar (transactional cell).
    TVarId
}

impl ThreadId {
    /// The distinguished initial thread of an execution.
    pub const INITIAL: Self = Self {
        raw: 0,
        label: Some("main"),
    };

    /// True for the synthetic commit-thread range.
    #[must_use]
    pub const fn is_commit(self) -> bool {
        self.raw >= COMMIT_ID_BASE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_ignores_label() {
        let a = ThreadId::new(3, Some("worker"));
        let b = ThreadId::new(3, None);
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), core::cmp::Ordering::Equal);
    }

    #[test]
    fn ordering_follows_allocation() {
        let a = MVarId::new(1, None);
        let b = MVarId::new(2, Some("later"));
        assert!(a < b);
    }

    #[test]
    fn initial_thread_is_not_a_commit_thread() {
        assert!(!ThreadId::INITIAL.is_commit());
        assert!(ThreadId::new(COMMIT_ID_BASE, None).is_commit());
        assert!(ThreadId::new(COMMIT_ID_BASE + 7, None).is_commit());
    }

    #[test]
    fn display_prefers_label() {
        let t = ThreadId::new(4, Some("reader"));
        assert_eq!(t.to_string(), "reader");
        let u = TVarId::new(9, None);
        assert_eq!(u.to_string(), "9");
    }
}
