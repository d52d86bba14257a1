//! Core types for the weft engine.
//!
//! - [`id`]: identifier types (`ThreadId`, `MVarId`, `IORefId`, `TVarId`)
//! - [`value`]: type-erased cell payloads
//! - [`exception`]: modeled exceptions and masking states

pub mod exception;
pub mod id;
pub mod value;

pub use exception::{Exception, MaskingState};
pub use id::{IORefId, MVarId, TVarId, ThreadId};
pub use value::Value;

use serde::Serialize;

/// Memory model under which IORef operations are simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MemType {
    /// Writes are immediate; the write buffer is always empty.
    SequentialConsistency,
    /// One FIFO write buffer per thread.
    TotalStoreOrder,
    /// One FIFO write buffer per (thread, cell) pair.
    PartialStoreOrder,
}

/// A compare-and-swap token: the witnessed version and value of an
/// IORef at the time of a [`read_for_cas`](crate::program::Action::read_for_cas).
#[derive(Clone, Debug)]
pub struct Ticket {
    pub(crate) ioref: IORefId,
    pub(crate) version: u64,
    pub(crate) peeked: Value,
}

impl Ticket {
    /// The cell this ticket was taken from.
    #[must_use]
    pub const fn ioref(&self) -> IORefId {
        self.ioref
    }

    /// The value observed when the ticket was taken.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.peeked
    }
}
