use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::{Flags, bitflags};

bitflags! {
    /// Registry-visible state of a process handle.
    ///
    /// Every transition happens with the registry list lock held. The flags
    /// are stored atomically so that wait predicates can observe them
    /// without taking the lock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ListFlags: u32 {
        /// Linked into the pid hash.
        const IN_HASH = 1 << 0;
        /// Still being forked; references are refused.
        const IN_CREATE = 1 << 1;
        /// Exit has started.
        const EXITED = 1 << 2;
        /// All references drained; no new ones are handed out.
        const DEAD = 1 << 3;
        /// A reference drain is in progress.
        const DRAIN = 1 << 4;
        /// The drainer sleeps until the reference count reaches zero.
        const DRAIN_WAIT = 1 << 5;
        /// Lookups holding no process reference wait for the drain to end.
        const REF_WAIT = 1 << 6;
        /// A reaper controls the zombie.
        const WAITING = 1 << 7;
        /// Linked into a process group.
        const IN_PGRP = 1 << 8;
        /// Moving between process groups.
        const PGRP_TRANS = 1 << 9;
        /// Someone waits for the group move to finish.
        const PGRP_TRANS_WAIT = 1 << 10;
        /// Children are being handed to the reaper.
        const CHILD_DRAIN_START = 1 << 11;
        /// Children have been handed to the reaper.
        const CHILD_DRAINED = 1 << 12;
        /// A parent-ref taker waits for the child drain.
        const CHILD_DRAIN_WAIT = 1 << 13;
        /// A parent lookup waits for the child drain.
        const CHILD_LOOKUP_WAIT = 1 << 14;
        /// The child drain waits for parent refs to be dropped.
        const PARENT_REF_WAIT = 1 << 15;
    }

    /// State of a process group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GroupFlags: u32 {
        /// The group is empty and will be torn down by its last reference.
        const TERMINATE = 1 << 0;
        /// Unlinked from the group hash.
        const DEAD = 1 << 1;
    }

    /// State of a session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionFlags: u32 {
        const TERM = 1 << 0;
        const DEAD = 1 << 1;
    }
}

/// A set of flags that can be read without the lock that serializes writes.
pub(crate) struct AtomicFlags<F> {
    bits: AtomicU32,
    _marker: PhantomData<F>,
}

impl<F: Flags<Bits = u32>> AtomicFlags<F> {
    pub(crate) fn new(flags: F) -> Self {
        Self {
            bits: AtomicU32::new(flags.bits()),
            _marker: PhantomData,
        }
    }

    pub(crate) fn get(&self) -> F {
        F::from_bits_retain(self.bits.load(Ordering::Acquire))
    }

    pub(crate) fn contains(&self, flags: F) -> bool {
        self.get().contains(flags)
    }

    pub(crate) fn intersects(&self, flags: F) -> bool {
        self.get().intersects(flags)
    }

    pub(crate) fn insert(&self, flags: F) {
        self.bits.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove(&self, flags: F) {
        self.bits.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Clears `flags` and reports whether any of them was set.
    pub(crate) fn take(&self, flags: F) -> bool {
        self.bits.fetch_and(!flags.bits(), Ordering::AcqRel) & flags.bits() != 0
    }
}
