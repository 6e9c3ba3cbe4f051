use crate::Pid;
use crate::flags::{AtomicFlags, ListFlags};
use crate::registry::Registry;
use crate::sync::WaitQueue;
use crate::thread::Thread;
use crate::transition::TransitionToken;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicI32, AtomicU8, AtomicU32, Ordering};
use spin::Mutex;

/// Execution state of a process, as far as the registry cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcStat {
    /// Being forked.
    Idle = 0,
    Run = 1,
    /// Stopped by job control.
    Stopped = 2,
    /// Exited, waiting to be reaped.
    Zombie = 3,
}

impl ProcStat {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Run,
            2 => Self::Stopped,
            _ => Self::Zombie,
        }
    }
}

/// What the low-swap policy may do to a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PcontrolAction {
    #[default]
    None,
    Throttle,
    Suspend,
    Kill,
}

/// Low-swap control state, protected by the process lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pcontrol {
    /// The action the process asked for.
    pub control: PcontrolAction,
    /// Whether the action has been applied.
    pub acted: bool,
}

/// The identity triple that survives pid reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcIdent {
    pub pid: Pid,
    pub unique_id: u64,
    pub id_version: u32,
}

/// One process handle.
///
/// Identity is immutable except for `id_version`, which moves forward on
/// every identity-changing event (exec). The counters and list flags are
/// only written with the registry list lock held; relationships (parent,
/// children, process group) live in the registry itself.
pub struct Process {
    pid: Pid,
    unique_id: u64,
    id_version: AtomicU32,
    pub(crate) slot: usize,

    pub(crate) refcount: AtomicU32,
    pub(crate) parentref: AtomicU32,
    pub(crate) children_count: AtomicU32,
    pub(crate) list_flags: AtomicFlags<ListFlags>,

    stat: AtomicU8,
    exit_code: AtomicI32,
    name: Mutex<String>,
    pcontrol: Mutex<Pcontrol>,
    transition: TransitionToken,

    /// Drainers waiting for `refcount` to reach zero.
    pub(crate) refcount_wq: WaitQueue,
    /// Lookups waiting for `REF_WAIT` to be cleared.
    pub(crate) refwait_wq: WaitQueue,
    /// Child drainers waiting for `parentref` to reach zero.
    pub(crate) parentref_wq: WaitQueue,
    /// Parent lookups waiting for the child drain to finish.
    pub(crate) children_wq: WaitQueue,
    /// Group and session lookups waiting for a group move.
    pub(crate) pgrp_wq: WaitQueue,
    /// Reapers waiting for another reaper to let go.
    pub(crate) zombie_wq: WaitQueue,
    /// Parent side: a child exited.
    pub(crate) child_exit_wq: WaitQueue,
}

impl Process {
    pub(crate) fn new(pid: Pid, unique_id: u64, slot: usize, name: String) -> Self {
        Self {
            pid,
            unique_id,
            id_version: AtomicU32::new(0),
            slot,
            refcount: AtomicU32::new(0),
            parentref: AtomicU32::new(0),
            children_count: AtomicU32::new(0),
            list_flags: AtomicFlags::new(ListFlags::IN_CREATE),
            stat: AtomicU8::new(ProcStat::Idle as u8),
            exit_code: AtomicI32::new(0),
            name: Mutex::new(name),
            pcontrol: Mutex::new(Pcontrol::default()),
            transition: TransitionToken::new(),
            refcount_wq: WaitQueue::new(),
            refwait_wq: WaitQueue::new(),
            parentref_wq: WaitQueue::new(),
            children_wq: WaitQueue::new(),
            pgrp_wq: WaitQueue::new(),
            zombie_wq: WaitQueue::new(),
            child_exit_wq: WaitQueue::new(),
        }
    }

    pub fn get_pid(&self) -> Pid {
        self.pid
    }

    /// Never reused across the lifetime of the registry.
    pub fn get_unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn get_id_version(&self) -> u32 {
        self.id_version.load(Ordering::Acquire)
    }

    pub(crate) fn bump_id_version(&self) -> u32 {
        self.id_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Captures the identity of the process.
    ///
    /// Not racy for the current process or while a reference is held.
    pub fn ident(&self) -> ProcIdent {
        ProcIdent {
            pid: self.pid,
            unique_id: self.unique_id,
            id_version: self.get_id_version(),
        }
    }

    pub fn get_name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        let mut guard = self.name.lock();
        guard.clear();
        guard.push_str(name);
    }

    pub fn get_stat(&self) -> ProcStat {
        ProcStat::from_raw(self.stat.load(Ordering::Acquire))
    }

    /// Used by signal delivery to stop and resume the process.
    pub fn set_stat(&self, stat: ProcStat) {
        self.stat.store(stat as u8, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.get_stat() == ProcStat::Stopped
    }

    pub fn is_zombie(&self) -> bool {
        self.get_stat() == ProcStat::Zombie
    }

    pub fn get_exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    pub(crate) fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
    }

    /// Current number of counted references.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Current number of children following this process as their parent.
    pub fn parent_refcount(&self) -> u32 {
        self.parentref.load(Ordering::Acquire)
    }

    pub fn children_count(&self) -> u32 {
        self.children_count.load(Ordering::Acquire)
    }

    pub fn list_flags(&self) -> ListFlags {
        self.list_flags.get()
    }

    /// Whether exit has started.
    pub fn is_exiting(&self) -> bool {
        self.list_flags.contains(ListFlags::EXITED)
    }

    pub fn transition(&self) -> &TransitionToken {
        &self.transition
    }

    /// The low-swap control state, behind the process lock.
    pub fn pcontrol(&self) -> &Mutex<Pcontrol> {
        &self.pcontrol
    }

    /// Parks until one of this process's children exits.
    pub fn wait_child_exit(&self, condition: impl FnMut() -> bool) {
        self.child_exit_wq.wait_until(condition);
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("unique_id", &self.unique_id)
            .field("id_version", &self.get_id_version())
            .field("stat", &self.get_stat())
            .field("refcount", &self.refcount())
            .field("list_flags", &self.list_flags())
            .finish()
    }
}

/// A counted reference on a live process.
///
/// Dropping it releases the reference, which may wake a drainer.
pub struct ProcRef {
    registry: Arc<Registry>,
    process: Arc<Process>,
    holder: Arc<Thread>,
}

impl ProcRef {
    /// Wraps a reference already counted on `process` and recorded on
    /// `holder`.
    pub(crate) fn from_counted(
        registry: &Arc<Registry>,
        process: Arc<Process>,
        holder: &Arc<Thread>,
    ) -> Self {
        Self {
            registry: registry.clone(),
            process,
            holder: holder.clone(),
        }
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// The thread the reference is recorded on.
    pub fn holder(&self) -> &Arc<Thread> {
        &self.holder
    }
}

impl Deref for ProcRef {
    type Target = Process;

    fn deref(&self) -> &Process {
        &self.process
    }
}

impl fmt::Debug for ProcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProcRef").field(&self.process.pid).finish()
    }
}

impl Drop for ProcRef {
    fn drop(&mut self) {
        self.registry.release_ref(&self.process, &self.holder);
    }
}

/// Exclusive control of an unreaped zombie.
///
/// While it exists no other reaper can claim the same zombie; dropping it
/// lets the next one in.
pub struct ZombieRef {
    registry: Arc<Registry>,
    process: Arc<Process>,
}

impl ZombieRef {
    pub(crate) fn new(registry: &Arc<Registry>, process: Arc<Process>) -> Self {
        Self {
            registry: registry.clone(),
            process,
        }
    }

    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }
}

impl Deref for ZombieRef {
    type Target = Process;

    fn deref(&self) -> &Process {
        &self.process
    }
}

impl fmt::Debug for ZombieRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ZombieRef").field(&self.process.pid).finish()
    }
}

impl Drop for ZombieRef {
    fn drop(&mut self) {
        self.registry.drop_zombref(&self.process);
    }
}
