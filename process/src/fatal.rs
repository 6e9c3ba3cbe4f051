//! Fatal stops for a corrupted object graph.
//!
//! Nothing in here is recoverable: once a counter goes negative or a dead
//! object is about to be re-linked, the registry cannot be trusted any more.
//! The violation is still a typed value so that fault-injection tests can
//! catch the unwinding panic and inspect what was detected.

use core::fmt;

use crate::Pid;

/// A broken registry invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A process reference was released more often than it was taken.
    NegativeRefCount(Pid),
    /// A parent reference was released more often than it was taken.
    NegativeParentRef(Pid),
    /// A thread released more process references than it recorded.
    NegativeThreadRefs(Pid),
    /// A group reference was released more often than it was taken.
    NegativeGroupRef(Pid),
    /// A session reference was released more often than it was taken.
    NegativeSessionRef(Pid),
    /// A process was removed from a group it is not a member of.
    NotAGroupMember { pgid: Pid, pid: Pid },
    /// A reference was requested on a terminating or dead group.
    DeadGroupRef(Pid),
    /// A process was about to be linked into a dead group.
    DeadGroupRelink(Pid),
    /// A reference was requested on a terminating or dead session.
    DeadSessionRef(Pid),
    /// A session was torn down twice.
    DoubleSessionFree(Pid),
    /// A process was freed while still referenced or linked.
    FreeInUse(Pid),
    /// Two live processes share a pid.
    DuplicatePid(Pid),
    /// A process has no process group.
    NoGroup(Pid),
    /// A transition was committed by a thread that does not hold it.
    ForeignTransition { pid: Pid, tid: Pid },
    /// A pre-sized snapshot ran out of room.
    SnapshotExhausted,
    /// The snapshot arena could not grow.
    SnapshotAlloc,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegativeRefCount(pid) => write!(f, "negative proc refcount on pid {pid}"),
            Self::NegativeParentRef(pid) => write!(f, "negative parent ref on pid {pid}"),
            Self::NegativeThreadRefs(tid) => write!(f, "negative proc ref record on thread {tid}"),
            Self::NegativeGroupRef(pgid) => write!(f, "negative refcount on pgrp {pgid}"),
            Self::NegativeSessionRef(sid) => write!(f, "negative refcount on session {sid}"),
            Self::NotAGroupMember { pgid, pid } => {
                write!(f, "pid {pid} removed from pgrp {pgid} without membership")
            }
            Self::DeadGroupRef(pgid) => write!(f, "ref being provided for dead pgrp {pgid}"),
            Self::DeadGroupRelink(pgid) => write!(f, "pgrp {pgid} is dead, adding process"),
            Self::DeadSessionRef(sid) => write!(f, "ref being provided for terminating session {sid}"),
            Self::DoubleSessionFree(sid) => write!(f, "terminating already terminated session {sid}"),
            Self::FreeInUse(pid) => write!(f, "proc {pid} being freed while in use"),
            Self::DuplicatePid(pid) => write!(f, "two procs with same pid {pid}"),
            Self::NoGroup(pid) => write!(f, "proc {pid} has no process group"),
            Self::ForeignTransition { pid, tid } => {
                write!(f, "thread {tid} committing a transition of pid {pid} it does not hold")
            }
            Self::SnapshotExhausted => write!(f, "pidlist allocation exhausted"),
            Self::SnapshotAlloc => write!(f, "no space for pidlist entry"),
        }
    }
}

/// Stops the process abstraction layer.
#[cold]
#[track_caller]
pub(crate) fn fatal(violation: InvariantViolation) -> ! {
    error!("[process] fatal: {}", violation);
    #[cfg(any(test, feature = "std"))]
    std::panic::panic_any(violation);
    #[cfg(not(any(test, feature = "std")))]
    panic!("[process] {}", violation);
}
