//! POSIX-like process, process group and session registry.
//!
//! The registry is the owner of every process handle in the system. It hands
//! out counted references ([`ProcRef`]), drains them before a process is torn
//! down, keeps the strict two-level hierarchy (session contains process groups,
//! process group contains processes) consistent, and maintains the job-control
//! eligibility counter of each group.
//!
//! Enumeration never runs a caller-supplied callback with a registry lock held:
//! identifiers are first copied into a [`PidList`] snapshot under the lock and
//! each one is re-resolved to a live reference afterwards.
//!
//! Lock order: registry list lock, then a group lock, then a process
//! (transition token) lock, then a session lock.
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

mod arena;
mod fatal;
mod flags;
mod iter;
mod jobctl;
mod process;
mod process_group;
mod registry;
mod session;
mod sync;
mod thread;
mod transition;

/// Type alias for session ID, process group ID, process ID, and thread ID.
/// Linux uses `int` for these IDs, which is typically 32 bits.
pub type Pid = u32;

pub use arena::{PIDS_PER_CHUNK, PidList};
pub use fatal::InvariantViolation;
pub use flags::{GroupFlags, ListFlags, SessionFlags};
pub use iter::{Directive, Filter, IterFlags, IterScope, Visited};
pub use jobctl::{SignalSink, Signo};
pub use process::{Pcontrol, PcontrolAction, ProcIdent, ProcRef, ProcStat, Process, ZombieRef};
pub use process_group::{GroupRef, JoinMode, ProcessGroup};
pub use registry::{INIT_PID, KERNEL_PID, PID_MAX, ParentRef, Registry};
pub use session::{Session, SessionRef, Terminal};
pub use sync::WaitQueue;
pub use thread::Thread;
pub use transition::TransitionToken;
