//! The shared-cell store and relaxed-memory write buffer.
//!
//! Three cell kinds live here: MVars (blocking, with FIFO waiter
//! queues), IORefs (non-blocking, with buffered writes under TSO/PSO)
//! and TVars (transactional). The write buffer holds pending IORef
//! writes keyed per thread (TSO) or per thread-and-cell (PSO); each
//! non-empty key owns a synthetic commit thread that the driver
//! offers to the scheduler alongside real threads.
//!
//! Blocking and waking are split: the store owns the waiter queues,
//! the thread table owns runnability. The stepper moves ids between
//! the two.

use std::collections::{BTreeMap, VecDeque};

use crate::types::id::COMMIT_ID_BASE;
use crate::types::{IORefId, MVarId, MemType, TVarId, Ticket, ThreadId, Value};

/// A blocking one-value cell.
#[derive(Debug, Default)]
pub(crate) struct MVar {
    pub value: Option<Value>,
    pub waiting_put: VecDeque<ThreadId>,
    pub waiting_take: VecDeque<ThreadId>,
    pub waiting_read: VecDeque<ThreadId>,
}

/// A non-blocking cell; buffered writes live in the write buffer.
#[derive(Debug)]
pub(crate) struct IORef {
    pub committed: Value,
    pub version: u64,
}

/// A transactional cell.
#[derive(Debug)]
pub(crate) struct TVar {
    pub value: Value,
}

/// Write-buffer key: per thread under TSO, per (thread, cell) under PSO.
pub(crate) type BufferKey = (ThreadId, Option<IORefId>);

/// Pending IORef writes, FIFO per key.
#[derive(Debug, Default)]
pub(crate) struct WriteBuffer {
    queues: BTreeMap<BufferKey, VecDeque<(IORefId, Value)>>,
    /// Synthetic commit-thread ids, assigned in first-use order so
    /// identical prefixes yield identical ids.
    commit_ids: BTreeMap<BufferKey, ThreadId>,
    next_commit: u32,
}

impl WriteBuffer {
    fn push(&mut self, key: BufferKey, ioref: IORefId, value: Value) {
        self.queues.entry(key).or_default().push_back((ioref, value));
        if !self.commit_ids.contains_key(&key) {
            let id = ThreadId::new(COMMIT_ID_BASE + self.next_commit, Some("commit"));
            self.next_commit += 1;
            self.commit_ids.insert(key, id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// The newest buffered value this thread wrote to `ioref`, if any
    /// (store-to-load forwarding).
    fn forwarded(&self, thread: ThreadId, ioref: IORefId) -> Option<&Value> {
        self.queues
            .iter()
            .filter(|((t, _), _)| *t == thread)
            .flat_map(|(_, queue)| queue.iter().rev())
            .find(|(r, _)| *r == ioref)
            .map(|(_, v)| v)
    }

    /// One `(commit_thread, writer, cell)` triple per non-empty key,
    /// in key order.
    pub fn commit_threads(&self) -> Vec<(ThreadId, ThreadId, IORefId)> {
        self.queues
            .iter()
            .map(|(key, queue)| {
                let head = queue.front().expect("non-empty by construction");
                (self.commit_ids[key], key.0, head.0)
            })
            .collect()
    }

    /// Pops the oldest entry for the key owned by `commit_id`.
    fn pop_for_commit(&mut self, commit_id: ThreadId) -> Option<(ThreadId, IORefId, Value)> {
        let key = *self
            .commit_ids
            .iter()
            .find(|(_, id)| **id == commit_id)?
            .0;
        let queue = self.queues.get_mut(&key)?;
        let (ioref, value) = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(&key);
        }
        Some((key.0, ioref, value))
    }

    /// Drains every entry, FIFO per key, keys in sorted order.
    fn drain_all(&mut self) -> Vec<(IORefId, Value)> {
        let mut out = Vec::new();
        for (_, queue) in std::mem::take(&mut self.queues) {
            out.extend(queue);
        }
        out
    }

    /// Drains the entries written by one thread, preserving FIFO order.
    fn drain_thread(&mut self, thread: ThreadId) -> Vec<(IORefId, Value)> {
        let keys: Vec<BufferKey> = self
            .queues
            .keys()
            .filter(|(t, _)| *t == thread)
            .copied()
            .collect();
        let mut out = Vec::new();
        for key in keys {
            if let Some(queue) = self.queues.remove(&key) {
                out.extend(queue);
            }
        }
        out
    }
}

/// The whole shared store of one execution.
pub(crate) struct Memory {
    pub memtype: MemType,
    mvars: BTreeMap<MVarId, MVar>,
    iorefs: BTreeMap<IORefId, IORef>,
    tvars: BTreeMap<TVarId, TVar>,
    pub buffer: WriteBuffer,
}

impl Memory {
    pub fn new(memtype: MemType) -> Self {
        Self {
            memtype,
            mvars: BTreeMap::new(),
            iorefs: BTreeMap::new(),
            tvars: BTreeMap::new(),
            buffer: WriteBuffer::default(),
        }
    }

    // --- MVars ----------------------------------------------------------

    pub fn insert_mvar(&mut self, id: MVarId) {
        self.mvars.insert(id, MVar::default());
    }

    pub fn mvar(&self, id: MVarId) -> &MVar {
        &self.mvars[&id]
    }

    pub fn mvar_mut(&mut self, id: MVarId) -> &mut MVar {
        self.mvars.get_mut(&id).expect("MVar id refers to a live cell")
    }

    /// All MVar cells, for invariant checks.
    pub fn mvars(&self) -> impl Iterator<Item = (MVarId, &MVar)> {
        self.mvars.iter().map(|(id, cell)| (*id, cell))
    }

    /// Removes a dead thread from every waiter queue.
    pub fn purge_thread(&mut self, thread: ThreadId) {
        for mvar in self.mvars.values_mut() {
            mvar.waiting_put.retain(|t| *t != thread);
            mvar.waiting_take.retain(|t| *t != thread);
            mvar.waiting_read.retain(|t| *t != thread);
        }
    }

    /// True if `thread` waits in some queue of the given MVar.
    pub fn mvar_has_waiter(&self, id: MVarId, thread: ThreadId) -> bool {
        let mvar = &self.mvars[&id];
        mvar.waiting_put.contains(&thread)
            || mvar.waiting_take.contains(&thread)
            || mvar.waiting_read.contains(&thread)
    }

    // --- IORefs ---------------------------------------------------------

    pub fn insert_ioref(&mut self, id: IORefId, value: Value) {
        self.iorefs.insert(
            id,
            IORef {
                committed: value,
                version: 0,
            },
        );
    }

    /// The value `thread` observes: its own newest buffered write to
    /// the cell, else the committed value.
    pub fn read_ioref(&self, thread: ThreadId, id: IORefId) -> Value {
        if let Some(v) = self.buffer.forwarded(thread, id) {
            return v.clone();
        }
        self.iorefs[&id].committed.clone()
    }

    /// A non-synchronised write: immediate under SC, buffered otherwise.
    pub fn write_ioref(&mut self, thread: ThreadId, id: IORefId, value: Value) {
        match self.memtype {
            MemType::SequentialConsistency => self.commit_now(id, value),
            MemType::TotalStoreOrder => self.buffer.push((thread, None), id, value),
            MemType::PartialStoreOrder => self.buffer.push((thread, Some(id)), id, value),
        }
    }

    /// Applies a write to the committed value, bumping the version.
    pub fn commit_now(&mut self, id: IORefId, value: Value) {
        let cell = self.iorefs.get_mut(&id).expect("IORef id refers to a live cell");
        cell.committed = value;
        cell.version += 1;
    }

    /// Takes a CAS ticket for the committed value.
    pub fn ticket(&self, id: IORefId) -> Ticket {
        let cell = &self.iorefs[&id];
        Ticket {
            ioref: id,
            version: cell.version,
            peeked: cell.committed.clone(),
        }
    }

    /// Compare-and-swap: succeeds iff the cell is unchanged since the
    /// ticket was taken. Returns the outcome and a fresh ticket.
    pub fn cas_ioref(&mut self, ticket: &Ticket, value: Value) -> (bool, Ticket) {
        let id = ticket.ioref;
        let current = self.iorefs[&id].version;
        if current == ticket.version {
            self.commit_now(id, value);
            (true, self.ticket(id))
        } else {
            (false, self.ticket(id))
        }
    }

    /// Scheduling a commit thread: applies and removes the oldest
    /// buffered entry of that key. Returns the writer and the cell.
    pub fn commit_one(&mut self, commit_id: ThreadId) -> Option<(ThreadId, IORefId)> {
        let (writer, ioref, value) = self.buffer.pop_for_commit(commit_id)?;
        self.commit_now(ioref, value);
        Some((writer, ioref))
    }

    /// A full barrier: flushes every buffered entry in one step.
    pub fn synchronise(&mut self) {
        for (ioref, value) in self.buffer.drain_all() {
            self.commit_now(ioref, value);
        }
    }

    /// Flushes the remaining writes of one thread, reporting the cells
    /// committed (used at termination for the initial thread).
    pub fn flush_thread(&mut self, thread: ThreadId) -> Vec<IORefId> {
        let entries = self.buffer.drain_thread(thread);
        let mut cells = Vec::with_capacity(entries.len());
        for (ioref, value) in entries {
            self.commit_now(ioref, value);
            cells.push(ioref);
        }
        cells
    }

    // --- TVars ----------------------------------------------------------

    pub fn insert_tvar(&mut self, id: TVarId, value: Value) {
        self.tvars.insert(id, TVar { value });
    }

    /// Undo of a transactional allocation.
    pub fn remove_tvar(&mut self, id: TVarId) {
        self.tvars.remove(&id);
    }

    pub fn tvar_value(&self, id: TVarId) -> Value {
        self.tvars[&id].value.clone()
    }

    pub fn set_tvar(&mut self, id: TVarId, value: Value) {
        self.tvars.get_mut(&id).expect("TVar id refers to a live cell").value = value;
    }
}
