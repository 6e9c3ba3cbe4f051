//! Snapshot arena for enumerations.
//!
//! Enumerators size the snapshot under the lock they enumerate, grow it with
//! the lock dropped, and fill it only once the capacity covers the bound they
//! re-checked under the lock. Memory is handed out in fixed-size chunks so that
//! no single allocation grows with the number of processes.

use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use crate::Pid;
use crate::fatal::{InvariantViolation, fatal};

/// Number of pids held by each chunk of a [`PidList`].
pub const PIDS_PER_CHUNK: usize = 1021;

/// A bounded list of pids copied out from under a lock.
pub struct PidList {
    chunks: Vec<Vec<Pid>>,
    chunk_capacity: usize,
    nalloc: usize,
}

impl PidList {
    pub fn new() -> Self {
        Self::with_chunk_capacity(PIDS_PER_CHUNK)
    }

    /// A list handing out chunks of `chunk_capacity` pids.
    pub fn with_chunk_capacity(chunk_capacity: usize) -> Self {
        assert!(chunk_capacity > 0);
        Self {
            chunks: Vec::new(),
            chunk_capacity,
            nalloc: 0,
        }
    }

    /// Grows the list until it can hold at least `needed` pids and returns
    /// the resulting capacity.
    ///
    /// Must not be called with the lock being enumerated held.
    pub fn alloc(&mut self, needed: usize) -> usize {
        while self.nalloc < needed {
            let mut chunk = Vec::new();
            if chunk.try_reserve_exact(self.chunk_capacity).is_err() {
                fatal(InvariantViolation::SnapshotAlloc);
            }
            if self.chunks.try_reserve(1).is_err() {
                fatal(InvariantViolation::SnapshotAlloc);
            }
            self.chunks.push(chunk);
            self.nalloc += self.chunk_capacity;
        }
        self.nalloc
    }

    /// Total capacity in pids.
    pub fn nalloc(&self) -> usize {
        self.nalloc
    }

    /// Number of chunks allocated so far.
    pub fn chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Appends `pid`; running out of preallocated room is fatal.
    pub fn add(&mut self, pid: Pid) {
        let capacity = self.chunk_capacity;
        match self.chunks.iter_mut().find(|chunk| chunk.len() < capacity) {
            Some(chunk) => chunk.push(pid),
            None => fatal(InvariantViolation::SnapshotExhausted),
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(Vec::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.chunks.iter().flat_map(|chunk| chunk.iter().copied())
    }
}

impl Default for PidList {
    fn default() -> Self {
        Self::new()
    }
}

/// Fills a snapshot of the state protected by `lock`.
///
/// `bound` computes the largest number of pids `fill` may add; `None` means
/// there is nothing to enumerate. The lock is never held while the arena
/// grows, and `fill` runs only after the bound was re-validated under the same
/// lock hold that `fill` then uses.
pub(crate) fn snapshot<T, B, F>(lock: &Mutex<T>, mut bound: B, fill: F) -> PidList
where
    B: FnMut(&T) -> Option<usize>,
    F: FnOnce(&T, &mut Snapshot<'_>),
{
    let mut list = PidList::new();
    loop {
        let guard: MutexGuard<'_, T> = lock.lock();
        let Some(needed) = bound(&guard) else {
            return list;
        };
        if list.nalloc() >= needed {
            let mut snap = Snapshot {
                list: &mut list,
                remaining: needed,
            };
            fill(&guard, &mut snap);
            drop(guard);
            return list;
        }
        drop(guard);
        list.alloc(needed);
    }
}

/// Write access to a [`PidList`] that stops accepting pids at the bound.
pub(crate) struct Snapshot<'a> {
    list: &'a mut PidList,
    remaining: usize,
}

impl Snapshot<'_> {
    /// Records `pid`; returns `false` once the bound is reached.
    pub(crate) fn push(&mut self, pid: Pid) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.list.add(pid);
        self.remaining -= 1;
        self.remaining > 0
    }
}
