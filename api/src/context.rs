use alloc::sync::Arc;
use axerrno::{LinuxError, LinuxResult};
use process_registry::{Pid, ProcRef, Process, Registry, Thread};

/// The calling thread, together with the registry it lives in.
#[derive(Clone)]
pub struct TaskContext {
    registry: Arc<Registry>,
    thread: Arc<Thread>,
}

impl TaskContext {
    pub fn new(registry: Arc<Registry>, thread: Arc<Thread>) -> Self {
        Self { registry, thread }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    /// The process the caller runs in.
    pub fn current_process(&self) -> LinuxResult<Arc<Process>> {
        self.thread.get_process().ok_or(LinuxError::ESRCH)
    }

    /// Resolves a pid argument: 0 names the caller's own process.
    pub(crate) fn target(&self, pid: i32) -> LinuxResult<ProcRef> {
        let pid: Pid = match pid {
            0 => self.current_process()?.get_pid(),
            1.. => pid as Pid,
            _ => return Err(LinuxError::EINVAL),
        };
        self.registry
            .find(&self.thread, pid)
            .ok_or(LinuxError::ESRCH)
    }
}
