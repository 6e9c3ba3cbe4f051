//! What to do when the compressor runs out of paging space.
//!
//! Processes may declare up front what should happen to them in that case
//! (throttle, suspend or kill). When space runs out the policy picks the
//! process holding the most compressed pages: a process without a declared
//! action is only killed when it holds more than half of the compressor on
//! its own; otherwise the memory-pressure killer gets the first shot, and
//! failing that the largest process with a declared action has it applied.

use crate::TaskContext;
use alloc::sync::Arc;
use axerrno::{LinuxError, LinuxResult};
use core::cell::RefCell;
use process_registry::{
    Directive, IterFlags, IterScope, Pcontrol, PcontrolAction, Pid, ProcRef, Process, Registry,
    Signo, Thread,
};
use spin::Mutex;
use syscall_trace::syscall_trace;

/// Minimum delay between two low-swap actions.
pub const LOWSWAP_ACTION_INTERVAL_SECS: u64 = 5;
/// Share of the compressor a single process must hold to be killed even
/// though it declared no action.
pub const LOWSWAP_DANGER_PERCENT: u64 = 50;

const MB_SIZE: u64 = 1024 * 1024;

/// Compressor accounting.
pub trait CompressorStats: Send + Sync {
    /// Pages of `process` held by the compressor.
    fn task_compressed(&self, process: &Process) -> u64;

    /// Pages held by the compressor in total.
    fn pages_compressed(&self) -> u64;
}

/// Scheduler and memory-pressure hooks the policy acts through.
pub trait TaskControl: Send + Sync {
    fn suspend(&self, process: &Process);

    fn resume(&self, process: &Process);

    /// Whether `process` may lift a low-swap action from another process.
    fn is_resource_owner(&self, process: &Process) -> bool;

    /// Number of processes the memory-pressure killer may still pick.
    fn jetsam_candidates(&self) -> usize {
        0
    }

    /// Asks the memory-pressure killer to free memory, without waiting.
    fn jetsam_kill_async(&self) {}
}

/// What [`LowSwapPolicy::no_paging_space_action`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowSwapOutcome {
    /// The previous action is too recent.
    TooSoon,
    /// A process without a declared action was killed for holding too much.
    KilledLargest(Pid),
    /// The memory-pressure killer was asked to act.
    Jetsam,
    /// The declared action of this process was applied.
    Controlled(Pid),
    NoneEligible,
}

#[derive(Debug, Clone, Copy)]
struct Largest {
    pid: Pid,
    unique_id: u64,
    size: u64,
}

#[derive(Debug, Default)]
struct Tally {
    largest: Option<Largest>,
    total_size: u64,
    count: usize,
}

impl Tally {
    fn add(&mut self, process: &Process, size: u64) {
        if size > self.largest.map_or(0, |largest| largest.size) {
            self.largest = Some(Largest {
                pid: process.get_pid(),
                unique_id: process.get_unique_id(),
                size,
            });
        }
        self.total_size += size;
        self.count += 1;
    }
}

/// Compressed sizes over all live processes, split by declared action.
#[derive(Debug, Default)]
struct Census {
    /// Declared an action that has not been applied yet.
    pending: Tally,
    /// Declared no action.
    unmanaged: Tally,
    /// Had their action applied already.
    acted: Tally,
}

pub struct LowSwapPolicy {
    registry: Arc<Registry>,
    stats: Arc<dyn CompressorStats>,
    tasks: Arc<dyn TaskControl>,
    /// Time of the last action, in seconds.
    last_action: Mutex<Option<u64>>,
}

impl LowSwapPolicy {
    pub fn new(
        registry: Arc<Registry>,
        stats: Arc<dyn CompressorStats>,
        tasks: Arc<dyn TaskControl>,
    ) -> Self {
        Self {
            registry,
            stats,
            tasks,
            last_action: Mutex::new(None),
        }
    }

    fn census(&self, cx: &Arc<Thread>) -> Census {
        let census = RefCell::new(Census::default());
        let filter = |process: &Process| {
            let size = self.stats.task_compressed(process);
            let pcontrol = *process.pcontrol().lock();
            let mut census = census.borrow_mut();
            match pcontrol {
                Pcontrol {
                    control: PcontrolAction::None,
                    ..
                } => census.unmanaged.add(process, size),
                Pcontrol { acted: false, .. } => census.pending.add(process, size),
                Pcontrol { acted: true, .. } => census.acted.add(process, size),
            }
            false
        };
        self.registry.iterate(
            cx,
            IterScope::Live,
            IterFlags::empty(),
            Some(&filter),
            |_| Directive::Returned,
        );
        census.into_inner()
    }

    /// Looks `largest` up again, making sure its pid was not reused.
    fn refind(&self, cx: &Arc<Thread>, largest: Largest) -> Option<ProcRef> {
        self.registry
            .find(cx, largest.pid)
            .filter(|process| process.get_unique_id() == largest.unique_id)
    }

    /// Frees paging space by acting on one process, at most once every
    /// [`LOWSWAP_ACTION_INTERVAL_SECS`].
    pub fn no_paging_space_action(&self, cx: &Arc<Thread>, now_secs: u64) -> LowSwapOutcome {
        let last = *self.last_action.lock();
        if last.is_some_and(|last| now_secs <= last + LOWSWAP_ACTION_INTERVAL_SECS) {
            return LowSwapOutcome::TooSoon;
        }

        let census = self.census(cx);
        debug!(
            "low swap: unmanaged {} procs {} pages, pending {} procs {} pages, acted {} procs {} pages",
            census.unmanaged.count,
            census.unmanaged.total_size,
            census.pending.count,
            census.pending.total_size,
            census.acted.count,
            census.acted.total_size
        );

        let danger = self.stats.pages_compressed() * LOWSWAP_DANGER_PERCENT / 100;
        if let Some(largest) = census.unmanaged.largest.filter(|largest| largest.size > danger) {
            if let Some(process) = self.refind(cx, largest) {
                *self.last_action.lock() = Some(now_secs);
                info!(
                    "low swap: killing largest compressed process with pid {} ({}) and size {} MB",
                    largest.pid,
                    process.get_name(),
                    largest.size / MB_SIZE
                );
                self.registry.sink().post(&process, Signo::SIGKILL);
                return LowSwapOutcome::KilledLargest(largest.pid);
            }
        }

        if self.tasks.jetsam_candidates() > 0 {
            *self.last_action.lock() = Some(now_secs);
            self.tasks.jetsam_kill_async();
            return LowSwapOutcome::Jetsam;
        }

        if let Some(largest) = census.pending.largest {
            if let Some(process) = self.refind(cx, largest) {
                *self.last_action.lock() = Some(now_secs);
                self.do_pcontrol(&process);
                return LowSwapOutcome::Controlled(largest.pid);
            }
        }

        *self.last_action.lock() = Some(now_secs);
        info!("low swap: unable to find any eligible processes to take action on");
        LowSwapOutcome::NoneEligible
    }

    /// Applies the declared action of `process`, unless already applied.
    pub fn do_pcontrol(&self, process: &Process) {
        let mut pcontrol = process.pcontrol().lock();
        if pcontrol.acted {
            return;
        }
        let control = pcontrol.control;
        if control != PcontrolAction::None {
            pcontrol.acted = true;
        }
        drop(pcontrol);

        let pid = process.get_pid();
        match control {
            PcontrolAction::Throttle => {
                info!("low swap: throttling pid {} ({})", pid, process.get_name());
            }
            PcontrolAction::Suspend => {
                info!("low swap: suspending pid {} ({})", pid, process.get_name());
                self.tasks.suspend(process);
            }
            PcontrolAction::Kill => {
                info!("low swap: killing pid {} ({})", pid, process.get_name());
                self.registry.sink().post(process, Signo::SIGKILL);
            }
            PcontrolAction::None => {}
        }
    }

    /// Declares what the caller wants done to itself when paging space
    /// runs out.
    #[syscall_trace]
    pub fn set_pcontrol(&self, cx: &TaskContext, control: PcontrolAction) -> LinuxResult<isize> {
        let current = cx.current_process()?;
        current.pcontrol().lock().control = control;
        Ok(0)
    }

    /// Control state of process `pid`.
    pub fn get_pcontrol(&self, cx: &TaskContext, pid: i32) -> LinuxResult<Pcontrol> {
        let target = cx.target(pid)?;
        let pcontrol = *target.pcontrol().lock();
        Ok(pcontrol)
    }

    /// Lifts a throttle or suspension from process `pid`. A kill cannot be
    /// taken back.
    #[syscall_trace]
    pub fn reset_pcontrol(&self, cx: &TaskContext, pid: i32) -> LinuxResult<isize> {
        if let Ok(current) = cx.current_process() {
            if !self.tasks.is_resource_owner(&current) {
                return Err(LinuxError::EACCES);
            }
        }
        let target = cx.target(pid)?;
        let mut pcontrol = target.pcontrol().lock();
        if !pcontrol.acted {
            return Ok(0);
        }
        let control = pcontrol.control;
        if matches!(control, PcontrolAction::Throttle | PcontrolAction::Suspend) {
            pcontrol.acted = false;
        }
        drop(pcontrol);

        let pid = target.get_pid();
        match control {
            PcontrolAction::Throttle => {
                info!("low swap: unthrottling pid {} ({})", pid, target.get_name());
            }
            PcontrolAction::Suspend => {
                info!("low swap: resuming pid {} ({})", pid, target.get_name());
                self.tasks.resume(&target);
            }
            PcontrolAction::Kill => {
                info!(
                    "low swap: attempt to unkill pid {} ({}) ignored",
                    pid,
                    target.get_name()
                );
            }
            PcontrolAction::None => {}
        }
        Ok(0)
    }
}
