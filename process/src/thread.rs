use crate::Pid;
use crate::fatal::{InvariantViolation, fatal};
use crate::process::Process;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicUsize, Ordering};

/// The kernel thread on whose behalf a registry operation runs.
///
/// Besides its identity, a thread records how many process references it
/// currently holds. A lookup that runs into a drain with `REF_WAIT` only
/// blocks when that record is zero: blocking while holding any reference could
/// deadlock against the drainer.
pub struct Thread {
    tid: Pid,
    process: Weak<Process>,
    proc_refcount: AtomicUsize,
}

impl Thread {
    /// A thread running inside `process`.
    pub fn new(tid: Pid, process: &Arc<Process>) -> Arc<Self> {
        Arc::new(Self {
            tid,
            process: Arc::downgrade(process),
            proc_refcount: AtomicUsize::new(0),
        })
    }

    /// A kernel-only thread, e.g. the pageout or reboot daemon.
    pub fn kernel(tid: Pid) -> Arc<Self> {
        Arc::new(Self {
            tid,
            process: Weak::new(),
            proc_refcount: AtomicUsize::new(0),
        })
    }

    pub fn get_tid(&self) -> Pid {
        self.tid
    }

    /// The process this thread executes in, if it is still around.
    pub fn get_process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    /// Whether this thread executes inside `process`.
    pub fn is_in(&self, process: &Process) -> bool {
        core::ptr::eq(self.process.as_ptr(), process)
    }

    /// Number of process references currently held by this thread.
    pub fn proc_refcount(&self) -> usize {
        self.proc_refcount.load(Ordering::Acquire)
    }

    pub(crate) fn record_ref(&self) {
        self.proc_refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record_unref(&self) {
        let dropped = self
            .proc_refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        if dropped.is_err() {
            fatal(InvariantViolation::NegativeThreadRefs(self.tid));
        }
    }

    /// Threads holding no process reference may sleep in a ref-wait.
    pub(crate) fn needs_to_wait_in_refwait(&self) -> bool {
        self.proc_refcount() == 0
    }
}
