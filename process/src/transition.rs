//! Per-process transition token.
//!
//! Serializes exec/exit-class state changes of a process against observers
//! such as signal delivery. `start` takes the token, `commit` marks the
//! change as irreversible, `end` releases it. Observers call `wait` to stay
//! out of the window.

use axerrno::{LinuxError, LinuxResult};
use bitflags::bitflags;
use spin::Mutex;

use crate::Pid;
use crate::fatal::{InvariantViolation, fatal};
use crate::process::Process;
use crate::sync::WaitQueue;
use crate::thread::Thread;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct TransFlags: u8 {
        const IN_TRANSIT = 1 << 0;
        const COMMIT = 1 << 1;
        const WAIT = 1 << 2;
    }
}

struct TransState {
    flags: TransFlags,
    holder: Option<Pid>,
}

/// Exclusion flag plus owning thread, guarded by the process lock.
pub struct TransitionToken {
    state: Mutex<TransState>,
    wq: WaitQueue,
}

impl TransitionToken {
    pub(crate) const fn new() -> Self {
        Self {
            state: Mutex::new(TransState {
                flags: TransFlags::empty(),
                holder: None,
            }),
            wq: WaitQueue::new(),
        }
    }

    fn in_transit(&self) -> bool {
        self.state.lock().flags.contains(TransFlags::IN_TRANSIT)
    }

    /// Takes the token for `cx`.
    ///
    /// Refuses with `EDEADLK` when a transition is in progress and either it
    /// has already committed or `non_blocking` is set; otherwise waits for it
    /// to end.
    pub fn start(&self, cx: &Thread, non_blocking: bool) -> LinuxResult<()> {
        loop {
            let mut state = self.state.lock();
            if !state.flags.contains(TransFlags::IN_TRANSIT) {
                state.flags.insert(TransFlags::IN_TRANSIT);
                state.holder = Some(cx.get_tid());
                return Ok(());
            }
            if state.flags.contains(TransFlags::COMMIT) || non_blocking {
                warn!(
                    "[transition] thread {} refused, holder {:?}",
                    cx.get_tid(),
                    state.holder
                );
                return Err(LinuxError::EDEADLK);
            }
            state.flags.insert(TransFlags::WAIT);
            drop(state);
            self.wq.wait_until(|| {
                let state = self.state.lock();
                !state.flags.contains(TransFlags::IN_TRANSIT)
                    || state.flags.contains(TransFlags::COMMIT)
            });
        }
    }

    /// Marks the transition held by `cx` as irreversible.
    pub fn commit(&self, cx: &Thread, process: &Process) {
        let mut state = self.state.lock();
        if !state.flags.contains(TransFlags::IN_TRANSIT) || state.holder != Some(cx.get_tid()) {
            fatal(InvariantViolation::ForeignTransition {
                pid: process.get_pid(),
                tid: cx.get_tid(),
            });
        }
        state.flags.insert(TransFlags::COMMIT);
        // Waiters that are not refused keep sleeping until `end`.
        let wake = state.flags.contains(TransFlags::WAIT);
        drop(state);
        if wake {
            self.wq.notify_all();
        }
    }

    /// Releases the token.
    pub fn end(&self) {
        let mut state = self.state.lock();
        state.flags.remove(TransFlags::IN_TRANSIT | TransFlags::COMMIT);
        state.holder = None;
        let wake = take_wait(&mut state.flags);
        drop(state);
        if wake {
            self.wq.notify_all();
        }
    }

    /// Waits until no transition of `process` is in progress.
    ///
    /// A thread of `process` itself gets `EDEADLK` instead of blocking once the
    /// transition has committed: it would be waiting for itself.
    pub fn wait(&self, cx: &Thread, process: &Process) -> LinuxResult<()> {
        loop {
            let mut state = self.state.lock();
            if !state.flags.contains(TransFlags::IN_TRANSIT) {
                return Ok(());
            }
            if state.flags.contains(TransFlags::COMMIT) && cx.is_in(process) {
                return Err(LinuxError::EDEADLK);
            }
            state.flags.insert(TransFlags::WAIT);
            drop(state);
            self.wq.wait_until(|| {
                let state = self.state.lock();
                !state.flags.contains(TransFlags::IN_TRANSIT)
                    || (state.flags.contains(TransFlags::COMMIT) && cx.is_in(process))
            });
        }
    }

    pub fn is_pending(&self) -> bool {
        self.in_transit()
    }

    pub fn is_committed(&self) -> bool {
        self.state.lock().flags.contains(TransFlags::COMMIT)
    }

    /// The thread currently holding the token.
    pub fn holder(&self) -> Option<Pid> {
        self.state.lock().holder
    }
}

fn take_wait(flags: &mut TransFlags) -> bool {
    let waiting = flags.contains(TransFlags::WAIT);
    flags.remove(TransFlags::WAIT);
    waiting
}
