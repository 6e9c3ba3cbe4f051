use crate::Pid;
use crate::fatal::{InvariantViolation, fatal};
use crate::flags::ListFlags;
use crate::jobctl::SignalSink;
use crate::process::{ProcIdent, ProcRef, ProcStat, Process, ZombieRef};
use crate::process_group::{JoinMode, ProcessGroup};
use crate::session::Session;
use crate::thread::Thread;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use axerrno::{LinuxError, LinuxResult};
use core::ops::Deref;
use core::sync::atomic::Ordering;
use hashbrown::HashMap;
use slab::Slab;
use spin::{Mutex, MutexGuard};

/// Pid of the kernel process, also the placeholder skipped by group walks.
pub const KERNEL_PID: Pid = 0;
/// Pid of the first user process and default reaper.
pub const INIT_PID: Pid = 1;
/// Largest pid handed out before allocation wraps.
pub const PID_MAX: Pid = 99999;
/// Where pid allocation resumes after wrapping.
const PID_RECYCLE_START: Pid = 100;
/// How often a parent-ref taker waits out a child drain before giving up.
const PARENT_REF_RETRIES: usize = 5;

/// Slot of a handle in the arena, qualified by the unique id of its occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcId {
    key: usize,
    unique_id: u64,
}

impl ProcId {
    pub(crate) fn of(process: &Process) -> Self {
        Self {
            key: process.slot,
            unique_id: process.get_unique_id(),
        }
    }
}

/// Registry-side state of one process, protected by the list lock.
pub(crate) struct ProcNode {
    pub(crate) process: Arc<Process>,
    pub(crate) parent: Option<ProcId>,
    pub(crate) children: Vec<ProcId>,
    pub(crate) pgrp: Option<Arc<ProcessGroup>>,
    pub(crate) pgrpid: Option<Pid>,
    pub(crate) sessionid: Option<Pid>,
    pub(crate) zombie: bool,
}

impl ProcNode {
    fn new(process: Arc<Process>, parent: Option<ProcId>) -> Self {
        Self {
            process,
            parent,
            children: Vec::new(),
            pgrp: None,
            pgrpid: None,
            sessionid: None,
            zombie: false,
        }
    }
}

/// Everything guarded by the registry list lock.
pub(crate) struct ProcList {
    pub(crate) procs: Slab<ProcNode>,
    pub(crate) pid_hash: HashMap<Pid, ProcId>,
    pub(crate) pgrp_hash: HashMap<Pid, Arc<ProcessGroup>>,
    pub(crate) session_hash: HashMap<Pid, Arc<Session>>,
    pub(crate) init: Option<ProcId>,
    kernproc: ProcId,
    last_pid: Pid,
    next_unique_id: u64,
}

impl ProcList {
    pub(crate) fn node(&self, id: ProcId) -> Option<&ProcNode> {
        self.procs
            .get(id.key)
            .filter(|node| node.process.get_unique_id() == id.unique_id)
    }

    pub(crate) fn node_mut(&mut self, id: ProcId) -> Option<&mut ProcNode> {
        self.procs
            .get_mut(id.key)
            .filter(|node| node.process.get_unique_id() == id.unique_id)
    }

    pub(crate) fn node_of(&self, process: &Process) -> Option<&ProcNode> {
        self.node(ProcId::of(process))
    }

    pub(crate) fn node_of_mut(&mut self, process: &Process) -> Option<&mut ProcNode> {
        self.node_mut(ProcId::of(process))
    }

    /// Locates a process by number, zombies included.
    pub(crate) fn pfind(&self, pid: Pid) -> Option<&Arc<Process>> {
        let id = *self.pid_hash.get(&pid)?;
        self.node(id).map(|node| &node.process)
    }

    pub(crate) fn parent_of(&self, process: &Process) -> Option<&Arc<Process>> {
        let parent = self.node_of(process)?.parent?;
        self.node(parent).map(|node| &node.process)
    }

    pub(crate) fn kernproc(&self) -> &Arc<Process> {
        match self.node(self.kernproc) {
            Some(node) => &node.process,
            None => fatal(InvariantViolation::FreeInUse(crate::KERNEL_PID)),
        }
    }

    fn alloc_pid(&mut self) -> Option<Pid> {
        for _ in 0..PID_MAX {
            self.last_pid += 1;
            if self.last_pid > PID_MAX {
                self.last_pid = PID_RECYCLE_START;
            }
            let pid = self.last_pid;
            if !self.pid_hash.contains_key(&pid)
                && !self.pgrp_hash.contains_key(&pid)
                && !self.session_hash.contains_key(&pid)
            {
                return Some(pid);
            }
        }
        None
    }

    /// Processes that have not exited yet, kernel process included.
    pub(crate) fn live(&self) -> impl Iterator<Item = &ProcNode> {
        self.procs.iter().map(|(_, node)| node).filter(|node| !node.zombie)
    }

    pub(crate) fn zombies(&self) -> impl Iterator<Item = &ProcNode> {
        self.procs.iter().map(|(_, node)| node).filter(|node| node.zombie)
    }
}

/// Outcome of trying to take a reference with the list lock held.
pub(crate) enum RefAttempt {
    Granted,
    Refused,
    /// A drain with `REF_WAIT` is in progress and the caller holds no
    /// reference: sleep until it ends and look the process up again.
    MustWait,
}

/// A hold on a process that pins it as somebody's parent.
///
/// The child drain of an exiting process waits for every parent ref to be
/// dropped before the children are handed over.
pub struct ParentRef {
    registry: Arc<Registry>,
    process: Arc<Process>,
}

impl ParentRef {
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }
}

impl Deref for ParentRef {
    type Target = Process;

    fn deref(&self) -> &Process {
        &self.process
    }
}

impl Drop for ParentRef {
    fn drop(&mut self) {
        self.registry.release_parent_ref(&self.process);
    }
}

/// The process registry.
///
/// Owns every process handle, the pid, group and session hashes, and the
/// collaborator used to deliver job-control notifications.
pub struct Registry {
    list: Mutex<ProcList>,
    sink: Arc<dyn SignalSink>,
}

impl Registry {
    /// Creates a registry holding only the kernel process, alone in group
    /// and session 0.
    pub fn new(sink: Arc<dyn SignalSink>) -> Arc<Self> {
        let mut procs = Slab::new();
        let entry = procs.vacant_entry();
        let kernproc = Arc::new(Process::new(
            KERNEL_PID,
            0,
            entry.key(),
            String::from("kernel_task"),
        ));
        let kernproc_id = ProcId::of(&kernproc);
        entry.insert(ProcNode::new(kernproc.clone(), None));

        let session = Session::new(KERNEL_PID, KERNEL_PID, String::new());
        let pgrp = ProcessGroup::new(KERNEL_PID, session.clone());
        pgrp.inner.lock().members.push(Arc::downgrade(&kernproc));

        let mut list = ProcList {
            procs,
            pid_hash: HashMap::new(),
            pgrp_hash: HashMap::new(),
            session_hash: HashMap::new(),
            init: None,
            kernproc: kernproc_id,
            last_pid: KERNEL_PID,
            next_unique_id: 1,
        };
        list.pid_hash.insert(KERNEL_PID, kernproc_id);
        list.session_hash.insert(KERNEL_PID, session);
        list.pgrp_hash.insert(KERNEL_PID, pgrp.clone());
        if let Some(node) = list.node_mut(kernproc_id) {
            node.pgrp = Some(pgrp);
            node.pgrpid = Some(KERNEL_PID);
            node.sessionid = Some(KERNEL_PID);
        }
        kernproc.list_flags.remove(ListFlags::IN_CREATE);
        kernproc
            .list_flags
            .insert(ListFlags::IN_HASH | ListFlags::IN_PGRP);
        kernproc.set_stat(ProcStat::Run);

        Arc::new(Self {
            list: Mutex::new(list),
            sink,
        })
    }

    pub(crate) fn lock_list(&self) -> MutexGuard<'_, ProcList> {
        self.list.lock()
    }

    pub(crate) fn list_lock(&self) -> &Mutex<ProcList> {
        &self.list
    }

    /// Whether the registry list lock is currently held by anyone.
    pub fn is_list_locked(&self) -> bool {
        self.list.is_locked()
    }

    pub fn sink(&self) -> &dyn SignalSink {
        &*self.sink
    }

    pub fn kernproc(&self) -> Arc<Process> {
        self.list.lock().kernproc().clone()
    }

    pub fn initproc(&self) -> Option<Arc<Process>> {
        let list = self.list.lock();
        list.init.and_then(|id| list.node(id)).map(|node| node.process.clone())
    }

    /// Number of processes that have not been reaped, kernel process included.
    pub fn nprocs(&self) -> usize {
        self.list.lock().procs.len()
    }

    /// Whether `pid` is linked into the pid hash, whatever its state.
    pub fn is_hashed(&self, pid: Pid) -> bool {
        self.list.lock().pfind(pid).is_some()
    }

    /// Takes a reference with the list lock held.
    pub(crate) fn try_ref_locked(process: &Process, cx: &Thread) -> RefAttempt {
        let flags = process.list_flags();
        if flags.contains(ListFlags::IN_CREATE) {
            return RefAttempt::Refused;
        }
        // Never hand out references to exiting processes, nor during a drain
        // that does not allow them.
        if process.is_zombie()
            || flags.intersects(ListFlags::EXITED | ListFlags::DEAD)
            || (flags.intersects(ListFlags::DRAIN | ListFlags::DRAIN_WAIT)
                && !flags.contains(ListFlags::REF_WAIT))
        {
            return RefAttempt::Refused;
        }
        // Threads already holding a reference on any process must not sleep
        // here: the drainer might be waiting for exactly that reference.
        if flags.contains(ListFlags::REF_WAIT) && cx.needs_to_wait_in_refwait() {
            return RefAttempt::MustWait;
        }
        process.refcount.fetch_add(1, Ordering::AcqRel);
        cx.record_ref();
        RefAttempt::Granted
    }

    fn wait_refwait(process: &Process) {
        process
            .refwait_wq
            .wait_until(|| !process.list_flags.contains(ListFlags::REF_WAIT));
    }

    /// Looks a live process up by pid and takes a reference on it.
    pub fn find(self: &Arc<Self>, cx: &Arc<Thread>, pid: Pid) -> Option<ProcRef> {
        let mut list = self.list.lock();
        loop {
            let process = list.pfind(pid)?.clone();
            match Self::try_ref_locked(&process, cx) {
                RefAttempt::Granted => {
                    drop(list);
                    trace!("[process] ref pid {} by thread {}", pid, cx.get_tid());
                    return Some(ProcRef::from_counted(self, process, cx));
                }
                RefAttempt::Refused => return None,
                RefAttempt::MustWait => {
                    drop(list);
                    Self::wait_refwait(&process);
                    // The process may have been recycled meanwhile.
                    list = self.list.lock();
                }
            }
        }
    }

    /// Like [`find`](Self::find), but rejects a different process that
    /// happens to occupy the pid now.
    pub fn find_by_identity(self: &Arc<Self>, cx: &Arc<Thread>, ident: ProcIdent) -> Option<ProcRef> {
        let found = self.find(cx, ident.pid)?;
        if found.get_unique_id() != ident.unique_id || found.get_id_version() != ident.id_version {
            return None;
        }
        Some(found)
    }

    /// Takes another reference on a handle the caller can already see.
    pub fn acquire_ref(self: &Arc<Self>, cx: &Arc<Thread>, process: &Arc<Process>) -> Option<ProcRef> {
        let mut list = self.list.lock();
        loop {
            list.node_of(process)?;
            match Self::try_ref_locked(process, cx) {
                RefAttempt::Granted => {
                    drop(list);
                    return Some(ProcRef::from_counted(self, process.clone(), cx));
                }
                RefAttempt::Refused => return None,
                RefAttempt::MustWait => {
                    drop(list);
                    Self::wait_refwait(process);
                    list = self.list.lock();
                }
            }
        }
    }

    /// Drops a reference recorded on `holder`.
    ///
    /// Normally reached by dropping a [`ProcRef`]. Releasing a reference that
    /// was never taken is fatal.
    pub fn release_ref(&self, process: &Process, holder: &Thread) {
        let list = self.list.lock();
        let count = process.refcount.load(Ordering::Acquire);
        if count == 0 {
            drop(list);
            fatal(InvariantViolation::NegativeRefCount(process.get_pid()));
        }
        process.refcount.store(count - 1, Ordering::Release);
        holder.record_unref();
        let wake = count == 1 && process.list_flags.take(ListFlags::DRAIN_WAIT);
        drop(list);
        trace!(
            "[process] unref pid {} by thread {}",
            process.get_pid(),
            holder.get_tid()
        );
        if wake {
            process.refcount_wq.notify_all();
        }
    }

    /// Waits out every outstanding reference on `process`.
    ///
    /// Without `wait_for_ref` the process is marked dead and can never be
    /// referenced again. With it, lookups by threads holding no reference
    /// block until [`refwake`](Self::refwake), and a fresh reference is
    /// returned to the caller. The init process draining itself never waits.
    /// The caller must not hold a reference on `process` itself.
    pub fn request_drain(
        self: &Arc<Self>,
        cx: &Arc<Thread>,
        process: &Arc<Process>,
        wait_for_ref: bool,
    ) -> Option<ProcRef> {
        let mut list = self.list.lock();
        if process.list_flags.contains(ListFlags::DEAD) {
            return None;
        }
        process.list_flags.insert(ListFlags::DRAIN);
        let mut initexec = false;
        if wait_for_ref {
            process.list_flags.insert(ListFlags::REF_WAIT);
            initexec = list.init == Some(ProcId::of(process));
        }
        debug!(
            "[process] draining pid {} with {} refs",
            process.get_pid(),
            process.refcount()
        );
        while process.refcount() > 0 && !initexec {
            process.list_flags.insert(ListFlags::DRAIN_WAIT);
            drop(list);
            process.refcount_wq.wait_until(|| {
                process.refcount() == 0 || !process.list_flags.contains(ListFlags::DRAIN_WAIT)
            });
            list = self.list.lock();
        }
        process.list_flags.remove(ListFlags::DRAIN);
        if !wait_for_ref {
            process.list_flags.insert(ListFlags::DEAD);
            return None;
        }
        process.refcount.fetch_add(1, Ordering::AcqRel);
        cx.record_ref();
        drop(list);
        Some(ProcRef::from_counted(self, process.clone(), cx))
    }

    /// Ends the ref-wait window opened by `request_drain(.., true)`.
    pub fn refwake(&self, process: &Process) {
        let list = self.list.lock();
        process.list_flags.remove(ListFlags::REF_WAIT);
        drop(list);
        process.refwait_wq.notify_all();
    }

    /// Pins the parent of `process` so that it can be followed safely.
    ///
    /// Fails if there is no parent, the parent is a zombie or has handed its
    /// children over already. While the parent is handing them over the
    /// caller waits, giving up after a few rounds.
    pub fn acquire_parent_ref(self: &Arc<Self>, process: &Process) -> Option<ParentRef> {
        let drain = ListFlags::CHILD_DRAIN_START | ListFlags::CHILD_DRAINED;
        let mut list = self.list.lock();
        let mut loops = 0;
        loop {
            let parent = list.parent_of(process)?.clone();
            let state = parent.list_flags() & drain;
            if parent.is_zombie() || state == drain {
                return None;
            }
            if state == ListFlags::CHILD_DRAIN_START {
                parent.list_flags.insert(ListFlags::CHILD_DRAIN_WAIT);
                drop(list);
                parent
                    .children_wq
                    .wait_until(|| parent.list_flags.contains(ListFlags::CHILD_DRAINED));
                loops += 1;
                if loops == PARENT_REF_RETRIES {
                    return None;
                }
                list = self.list.lock();
                continue;
            }
            parent.parentref.fetch_add(1, Ordering::AcqRel);
            drop(list);
            return Some(ParentRef {
                registry: self.clone(),
                process: parent,
            });
        }
    }

    pub(crate) fn release_parent_ref(&self, process: &Process) {
        let list = self.list.lock();
        let count = process.parentref.load(Ordering::Acquire);
        if count == 0 {
            drop(list);
            fatal(InvariantViolation::NegativeParentRef(process.get_pid()));
        }
        process.parentref.store(count - 1, Ordering::Release);
        let wake = count == 1 && process.list_flags.take(ListFlags::PARENT_REF_WAIT);
        drop(list);
        if wake {
            process.parentref_wq.notify_all();
        }
    }

    /// Starts handing the children of `process` over; waits until nobody
    /// follows it as a parent any more.
    pub fn child_drain_start(&self, process: &Process) {
        let mut list = self.list.lock();
        process.list_flags.insert(ListFlags::CHILD_DRAIN_START);
        while process.parent_refcount() > 0 {
            process.list_flags.insert(ListFlags::PARENT_REF_WAIT);
            drop(list);
            process
                .parentref_wq
                .wait_until(|| process.parent_refcount() == 0);
            list = self.list.lock();
        }
    }

    /// Marks the children of `process` as handed over.
    pub fn child_drain_end(&self, process: &Process) {
        let list = self.list.lock();
        process.list_flags.insert(ListFlags::CHILD_DRAINED);
        let wake = process
            .list_flags
            .take(ListFlags::CHILD_LOOKUP_WAIT | ListFlags::CHILD_DRAIN_WAIT);
        drop(list);
        if wake {
            process.children_wq.notify_all();
        }
    }

    /// Returns a reference on the parent of `process`.
    ///
    /// If the parent is exiting but still owns its children, waits for the
    /// hand-over and follows the new parent.
    pub fn parent(self: &Arc<Self>, cx: &Arc<Thread>, process: &Process) -> Option<ProcRef> {
        let mut list = self.list.lock();
        loop {
            let parent = list.parent_of(process)?.clone();
            match Self::try_ref_locked(&parent, cx) {
                RefAttempt::Granted => {
                    drop(list);
                    return Some(ProcRef::from_counted(self, parent, cx));
                }
                RefAttempt::MustWait => {
                    drop(list);
                    Self::wait_refwait(&parent);
                    list = self.list.lock();
                }
                RefAttempt::Refused => {
                    let flags = parent.list_flags();
                    if parent.is_zombie()
                        || !flags.contains(ListFlags::EXITED)
                        || flags.contains(ListFlags::CHILD_DRAINED)
                    {
                        return None;
                    }
                    parent.list_flags.insert(ListFlags::CHILD_LOOKUP_WAIT);
                    drop(list);
                    parent
                        .children_wq
                        .wait_until(|| parent.list_flags.contains(ListFlags::CHILD_DRAINED));
                    list = self.list.lock();
                }
            }
        }
    }

    /// Pid of the parent, without taking any reference.
    pub fn get_ppid(&self, process: &Process) -> Option<Pid> {
        self.list
            .lock()
            .parent_of(process)
            .map(|parent| parent.get_pid())
    }

    /// Pids of the current children of `process`.
    pub fn children_pids(&self, process: &Process) -> Vec<Pid> {
        let list = self.list.lock();
        let Some(node) = list.node_of(process) else {
            return Vec::new();
        };
        node.children
            .iter()
            .filter_map(|&child| list.node(child))
            .map(|child| child.process.get_pid())
            .collect()
    }

    /// Whether `process` descends from `ancestor`.
    pub fn is_inferior(&self, process: &Process, ancestor: &Process) -> bool {
        if core::ptr::eq(process, ancestor) {
            return false;
        }
        let list = self.list.lock();
        let start = ProcId::of(process);
        let target = ProcId::of(ancestor);
        let limit = list.procs.len();
        let mut current = start;
        for _ in 0..limit {
            if current == target {
                return true;
            }
            let Some(node) = list.node(current) else {
                return false;
            };
            if node.process.get_pid() == KERNEL_PID {
                return false;
            }
            match node.parent {
                Some(parent) if parent != start => current = parent,
                _ => return false,
            }
        }
        false
    }

    /// Claims an exited process for reaping.
    ///
    /// Waits while another reaper holds it. Returns `None` if there is no such
    /// process or it has not started exiting.
    pub fn find_zombref(self: &Arc<Self>, pid: Pid) -> Option<ZombieRef> {
        let mut list = self.list.lock();
        loop {
            let process = list.pfind(pid)?.clone();
            let flags = process.list_flags();
            if flags.contains(ListFlags::IN_CREATE) || !flags.contains(ListFlags::EXITED) {
                return None;
            }
            if flags.contains(ListFlags::WAITING) {
                drop(list);
                process
                    .zombie_wq
                    .wait_until(|| !process.list_flags.contains(ListFlags::WAITING));
                list = self.list.lock();
                continue;
            }
            process.list_flags.insert(ListFlags::WAITING);
            drop(list);
            return Some(ZombieRef::new(self, process));
        }
    }

    pub(crate) fn drop_zombref(&self, process: &Process) {
        let list = self.list.lock();
        let wake = process.list_flags.take(ListFlags::WAITING);
        drop(list);
        if wake {
            process.zombie_wq.notify_all();
        }
    }

    /// Creates a child of `parent` in the parent's process group.
    ///
    /// The child is hashed right away but cannot be referenced until it is
    /// fully linked.
    pub fn fork(
        self: &Arc<Self>,
        cx: &Arc<Thread>,
        parent: &Arc<Process>,
        name: &str,
    ) -> LinuxResult<ProcRef> {
        let child = {
            let mut list = self.list.lock();
            if list.node_of(parent).is_none() || parent.is_exiting() {
                return Err(LinuxError::ESRCH);
            }
            let pid = list.alloc_pid().ok_or(LinuxError::EAGAIN)?;
            let unique_id = list.next_unique_id;
            list.next_unique_id += 1;
            let entry = list.procs.vacant_entry();
            let child = Arc::new(Process::new(pid, unique_id, entry.key(), String::from(name)));
            entry.insert(ProcNode::new(child.clone(), Some(ProcId::of(parent))));
            if list.pid_hash.insert(pid, ProcId::of(&child)).is_some() {
                fatal(InvariantViolation::DuplicatePid(pid));
            }
            child.list_flags.insert(ListFlags::IN_HASH);
            child
        };

        let pgrp = self
            .proc_pgrp(parent)
            .unwrap_or_else(|| fatal(InvariantViolation::NoGroup(parent.get_pid())));
        self.pgrp_add(pgrp.group(), Some(parent), &child);
        drop(pgrp);

        let mut list = self.list.lock();
        if let Some(node) = list.node_of_mut(parent) {
            node.children.push(ProcId::of(&child));
        }
        parent.children_count.fetch_add(1, Ordering::AcqRel);
        child.set_stat(ProcStat::Run);
        child.list_flags.remove(ListFlags::IN_CREATE);
        child.refcount.fetch_add(1, Ordering::AcqRel);
        cx.record_ref();
        drop(list);
        debug!(
            "[process] pid {} forked pid {}",
            parent.get_pid(),
            child.get_pid()
        );
        Ok(ProcRef::from_counted(self, child, cx))
    }

    /// Forks the init process off the kernel process and makes it the leader
    /// of a new session.
    pub fn spawn_init(self: &Arc<Self>, cx: &Arc<Thread>, name: &str) -> LinuxResult<ProcRef> {
        let kernproc = self.kernproc();
        let init = self.fork(cx, &kernproc, name)?;
        self.list.lock().init = Some(ProcId::of(&init));
        let init_cx = Thread::new(init.get_pid(), init.process());
        self.join_group(&init_cx, init.process(), init.get_pid(), JoinMode::CreateSession)?;
        info!("[process] init is pid {}", init.get_pid());
        Ok(init)
    }

    /// Replaces the program image of `process`.
    ///
    /// Runs under the transition token: references are drained in ref-wait
    /// mode, the identity version moves forward, and lookups resume. Returns
    /// the reference the drain handed back.
    pub fn exec(self: &Arc<Self>, cx: &Arc<Thread>, process: &Arc<Process>) -> LinuxResult<ProcRef> {
        let token = process.transition();
        token.start(cx, false)?;
        token.commit(cx, process);
        let drained = self.request_drain(cx, process, true);
        if drained.is_some() {
            let version = process.bump_id_version();
            debug!(
                "[process] pid {} exec, id version {}",
                process.get_pid(),
                version
            );
        }
        self.refwake(process);
        token.end();
        drained.ok_or(LinuxError::ESRCH)
    }

    /// Turns `process` into a zombie.
    ///
    /// Withdraws it from job control, drains all references, hands its
    /// children to init (or the kernel process if init itself exits) and
    /// wakes its parent. Membership in the process group lasts until reap.
    pub fn exit(self: &Arc<Self>, cx: &Arc<Thread>, process: &Arc<Process>, exit_code: i32) {
        {
            let list = self.list.lock();
            if list.node_of(process).is_none() || process.is_exiting() {
                return;
            }
            process.list_flags.insert(ListFlags::EXITED);
            process.set_exit_code(exit_code);
        }
        info!(
            "[process] pid {} exiting with code {}",
            process.get_pid(),
            exit_code
        );

        if let Some(pgrp) = self.proc_pgrp(process) {
            self.recompute_jobc(cx, process, &pgrp, false);
        }

        self.request_drain(cx, process, false);

        self.child_drain_start(process);
        let (reaper, children) = self.reparent_children(process);
        self.child_drain_end(process);
        for child in &children {
            self.qualify_for_new_parent(cx, child, &reaper);
        }

        let parent = {
            let mut list = self.list.lock();
            if let Some(node) = list.node_of_mut(process) {
                node.zombie = true;
            }
            process.set_stat(ProcStat::Zombie);
            list.parent_of(process).cloned()
        };
        if let Some(parent) = parent {
            parent.child_exit_wq.notify_all();
        }
    }

    fn reparent_children(&self, process: &Process) -> (Arc<Process>, Vec<Arc<Process>>) {
        let mut list = self.list.lock();
        let this = ProcId::of(process);
        let reaper_id = list
            .init
            .filter(|&init| init != this && list.node(init).is_some())
            .unwrap_or(list.kernproc);
        let children = match list.node_of_mut(process) {
            Some(node) => core::mem::take(&mut node.children),
            None => Vec::new(),
        };
        let mut moved = Vec::with_capacity(children.len());
        for &child in &children {
            if let Some(node) = list.node_mut(child) {
                node.parent = Some(reaper_id);
                moved.push(node.process.clone());
            }
        }
        let reaper = match list.node_mut(reaper_id) {
            Some(node) => {
                node.children.extend_from_slice(&children);
                node.process.clone()
            }
            None => fatal(InvariantViolation::FreeInUse(KERNEL_PID)),
        };
        reaper
            .children_count
            .fetch_add(children.len() as u32, Ordering::AcqRel);
        process.children_count.store(0, Ordering::Release);
        if !moved.is_empty() {
            debug!(
                "[process] pid {} handed {} children to pid {}",
                process.get_pid(),
                moved.len(),
                reaper.get_pid()
            );
        }
        (reaper, moved)
    }

    /// Frees a zombie and returns its exit code.
    ///
    /// The zombie leaves its process group, its parent and the pid hash;
    /// any outstanding reference or link at this point is fatal.
    pub fn reap(self: &Arc<Self>, zombie: ZombieRef) -> LinuxResult<i32> {
        let process = zombie.process().clone();
        if !process.is_zombie() {
            return Err(LinuxError::EAGAIN);
        }
        self.unlink_from_group(&process);

        let mut list = self.list.lock();
        let id = ProcId::of(&process);
        let parent = list.node(id).and_then(|node| node.parent);
        if let Some(parent) = parent.and_then(|parent| list.node_mut(parent)) {
            parent.children.retain(|&child| child != id);
            parent.process.children_count.fetch_sub(1, Ordering::AcqRel);
        }
        if list.pid_hash.get(&process.get_pid()) == Some(&id) {
            list.pid_hash.remove(&process.get_pid());
        }
        process.list_flags.remove(ListFlags::IN_HASH);
        if process.refcount() != 0 || process.parent_refcount() != 0 || process.children_count() != 0
        {
            drop(list);
            fatal(InvariantViolation::FreeInUse(process.get_pid()));
        }
        if list.node(id).is_some() {
            list.procs.remove(id.key);
        }
        drop(list);
        drop(zombie);
        debug!("[process] reaped pid {}", process.get_pid());
        Ok(process.get_exit_code())
    }

    #[cfg(test)]
    pub(crate) fn rewind_pid(&self, last_pid: Pid) {
        self.list.lock().last_pid = last_pid;
    }
}
