use crate::Pid;
use crate::fatal::{InvariantViolation, fatal};
use crate::flags::{AtomicFlags, GroupFlags, ListFlags, SessionFlags};
use crate::process::Process;
use crate::registry::Registry;
use crate::session::Session;
use crate::thread::Thread;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use axerrno::{LinuxError, LinuxResult};
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

pub(crate) struct GroupInner {
    /// Members, most recently joined first, except that forked children
    /// follow their parent.
    pub(crate) members: Vec<Weak<Process>>,
    pub(crate) jobc: u32,
}

/// A process group.
///
/// `refcount` counts [`GroupRef`]s, membership is tracked separately. The
/// group is torn down once it has no member, has been marked `TERMINATE`,
/// and the last reference is dropped.
pub struct ProcessGroup {
    pgid: Pid,
    session: Arc<Session>,
    pub(crate) refcount: AtomicU32,
    pub(crate) flags: AtomicFlags<GroupFlags>,
    pub(crate) inner: Mutex<GroupInner>,
}

impl ProcessGroup {
    pub(crate) fn new(pgid: Pid, session: Arc<Session>) -> Arc<Self> {
        Arc::new(Self {
            pgid,
            session,
            refcount: AtomicU32::new(0),
            flags: AtomicFlags::new(GroupFlags::empty()),
            inner: Mutex::new(GroupInner {
                members: Vec::new(),
                jobc: 0,
            }),
        })
    }

    /// Get process group id
    pub fn get_pgid(&self) -> Pid {
        self.pgid
    }

    pub fn get_session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn get_sid(&self) -> Pid {
        self.session.get_sid()
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> GroupFlags {
        self.flags.get()
    }

    pub fn is_dead(&self) -> bool {
        self.flags.contains(GroupFlags::DEAD)
    }

    pub fn member_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    /// Number of members whose parent sits in another group of the same
    /// session. Zero means the group is orphaned.
    pub fn jobc(&self) -> u32 {
        self.inner.lock().jobc
    }

    /// Pids of the current members.
    pub fn member_pids(&self) -> Vec<Pid> {
        self.inner
            .lock()
            .members
            .iter()
            .filter_map(Weak::upgrade)
            .map(|member| member.get_pid())
            .collect()
    }

    /// Whether the group lock is currently held by anyone.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("pgid", &self.pgid)
            .field("sid", &self.get_sid())
            .field("refcount", &self.refcount())
            .field("flags", &self.flags())
            .finish()
    }
}

/// A counted reference on a process group.
pub struct GroupRef {
    registry: Arc<Registry>,
    group: Arc<ProcessGroup>,
}

impl GroupRef {
    pub(crate) fn from_counted(registry: &Arc<Registry>, group: Arc<ProcessGroup>) -> Self {
        Self {
            registry: registry.clone(),
            group,
        }
    }

    pub fn group(&self) -> &Arc<ProcessGroup> {
        &self.group
    }
}

impl Deref for GroupRef {
    type Target = ProcessGroup;

    fn deref(&self) -> &ProcessGroup {
        &self.group
    }
}

impl fmt::Debug for GroupRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GroupRef").field(&self.group.pgid).finish()
    }
}

impl Drop for GroupRef {
    fn drop(&mut self) {
        self.registry.release_group(&self.group);
    }
}

/// How [`Registry::join_group`] treats a missing target group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// The group must already exist.
    Existing,
    /// Create the group in the caller's session if it does not exist.
    CreateGroup,
    /// Create the group in a new session led by the caller.
    CreateSession,
}

impl Registry {
    /// Looks a process group up by id.
    ///
    /// A group that is terminating but not yet dead is still returned: a
    /// late joiner revives it.
    pub fn find_group(self: &Arc<Self>, pgid: Pid) -> Option<GroupRef> {
        let list = self.lock_list();
        let group = list.pgrp_hash.get(&pgid)?.clone();
        if group.is_dead() {
            drop(list);
            fatal(InvariantViolation::DeadGroupRef(pgid));
        }
        group.refcount.fetch_add(1, Ordering::AcqRel);
        drop(list);
        Some(GroupRef::from_counted(self, group))
    }

    /// Returns a reference on the group of `process`, waiting while the
    /// process moves between groups.
    pub fn proc_pgrp(self: &Arc<Self>, process: &Process) -> Option<GroupRef> {
        let mut list = self.lock_list();
        loop {
            if process.list_flags.contains(ListFlags::PGRP_TRANS) {
                process.list_flags.insert(ListFlags::PGRP_TRANS_WAIT);
                drop(list);
                process
                    .pgrp_wq
                    .wait_until(|| !process.list_flags.contains(ListFlags::PGRP_TRANS));
                list = self.lock_list();
                continue;
            }
            let group = list.node_of(process)?.pgrp.clone()?;
            if group
                .flags
                .intersects(GroupFlags::TERMINATE | GroupFlags::DEAD)
            {
                drop(list);
                fatal(InvariantViolation::DeadGroupRef(group.pgid));
            }
            group.refcount.fetch_add(1, Ordering::AcqRel);
            drop(list);
            return Some(GroupRef::from_counted(self, group));
        }
    }

    /// Pgid of `process` without taking a reference.
    pub fn get_pgid(&self, process: &Process) -> Option<Pid> {
        self.lock_list().node_of(process)?.pgrpid
    }

    /// Drops a group reference; the last one on a terminating group tears
    /// it down.
    pub fn release_group(&self, group: &Arc<ProcessGroup>) {
        let list = self.lock_list();
        let count = group.refcount();
        if count == 0 {
            drop(list);
            fatal(InvariantViolation::NegativeGroupRef(group.pgid));
        }
        if count == 1 && group.flags.contains(GroupFlags::TERMINATE) {
            drop(list);
            self.pgdelete_dropref(group);
            return;
        }
        group.refcount.store(count - 1, Ordering::Release);
    }

    /// Drops the caller's reference and deletes the group if it is empty
    /// and nobody else references it.
    fn pgdelete_dropref(&self, group: &Arc<ProcessGroup>) {
        let empty = group.inner.lock().members.is_empty();

        let mut list = self.lock_list();
        let count = group.refcount();
        if count == 0 {
            drop(list);
            fatal(InvariantViolation::NegativeGroupRef(group.pgid));
        }
        group.refcount.store(count - 1, Ordering::Release);
        if !empty || !group.inner.lock().members.is_empty() {
            return;
        }
        group.flags.insert(GroupFlags::TERMINATE);
        if count > 1 {
            return;
        }
        group.flags.insert(GroupFlags::DEAD);
        if list
            .pgrp_hash
            .get(&group.pgid)
            .is_some_and(|hashed| Arc::ptr_eq(hashed, group))
        {
            list.pgrp_hash.remove(&group.pgid);
        }
        drop(list);
        debug!("[process] pgrp {} deleted", group.pgid);

        let session = &group.session;
        if let Some(tty) = session.get_terminal() {
            tty.clear_foreground(group);
            session.clear_tty_pgid(group.pgid);
        }

        let mut list = self.lock_list();
        if session
            .flags
            .intersects(SessionFlags::TERM | SessionFlags::DEAD)
        {
            drop(list);
            fatal(InvariantViolation::DeadSessionRef(session.get_sid()));
        }
        if session.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        session.flags.insert(SessionFlags::TERM);
        self.unhash_session(&mut list, session);
        drop(list);
        session.detach_terminal();
        let list = self.lock_list();
        session.flags.insert(SessionFlags::DEAD);
        drop(list);
        debug!("[process] session {} freed", session.get_sid());
    }

    /// Links `child` into `group`, right after `parent` if it is a member.
    pub(crate) fn pgrp_add(
        &self,
        group: &Arc<ProcessGroup>,
        parent: Option<&Process>,
        child: &Arc<Process>,
    ) {
        let mut list = self.lock_list();
        if group.is_dead() {
            drop(list);
            fatal(InvariantViolation::DeadGroupRelink(group.pgid));
        }
        group.flags.remove(GroupFlags::TERMINATE);
        if let Some(node) = list.node_of_mut(child) {
            node.pgrp = Some(group.clone());
            node.pgrpid = Some(group.pgid);
            node.sessionid = Some(group.get_sid());
        }
        child.list_flags.insert(ListFlags::IN_PGRP);

        let mut inner = group.inner.lock();
        let position = parent.and_then(|parent| {
            inner
                .members
                .iter()
                .position(|member| core::ptr::eq(member.as_ptr(), parent))
        });
        match position {
            Some(index) => inner.members.insert(index + 1, Arc::downgrade(child)),
            None => inner.members.insert(0, Arc::downgrade(child)),
        }
    }

    /// Takes `process` out of its group, tearing the group down if it was
    /// the last member.
    ///
    /// The group and the groups of the children of `process` are counted out
    /// of job control first, unless `process` is exiting and `exit` did so
    /// already.
    pub fn leave_group(self: &Arc<Self>, cx: &Arc<Thread>, process: &Process) {
        if !process.is_exiting() {
            if let Some(old) = self.proc_pgrp(process) {
                self.recompute_jobc(cx, process, &old, false);
            }
        }
        self.unlink_from_group(process);
    }

    /// Unlinks `process` from its group without touching job control.
    pub(crate) fn unlink_from_group(&self, process: &Process) {
        let mut list = self.lock_list();
        while process.list_flags.contains(ListFlags::PGRP_TRANS) {
            process.list_flags.insert(ListFlags::PGRP_TRANS_WAIT);
            drop(list);
            process
                .pgrp_wq
                .wait_until(|| !process.list_flags.contains(ListFlags::PGRP_TRANS));
            list = self.lock_list();
        }
        let old = list.node_of_mut(process).and_then(|node| {
            node.pgrpid = None;
            node.pgrp.take()
        });
        let Some(old) = old else {
            return;
        };
        old.refcount.fetch_add(1, Ordering::AcqRel);
        process.list_flags.remove(ListFlags::IN_PGRP);
        drop(list);
        self.unlink_member(&old, process);
    }

    /// Removes `process` from the member list of `group` and drops the
    /// reference the caller counted, deleting the group if it became empty.
    fn unlink_member(&self, group: &Arc<ProcessGroup>, process: &Process) {
        let mut inner = group.inner.lock();
        let before = inner.members.len();
        inner
            .members
            .retain(|member| !core::ptr::eq(member.as_ptr(), process));
        if inner.members.len() == before {
            drop(inner);
            fatal(InvariantViolation::NotAGroupMember {
                pgid: group.pgid,
                pid: process.get_pid(),
            });
        }
        let emptied = inner.members.is_empty();
        drop(inner);
        if emptied {
            self.pgdelete_dropref(group);
        } else {
            self.release_group(group);
        }
    }

    /// Moves `process` from its current group into `new_group`.
    ///
    /// Lookups of the group or session of `process` wait until the move is
    /// done.
    pub fn replace_group(&self, process: &Process, new_group: &Arc<ProcessGroup>) {
        let mut list = self.lock_list();
        while process.list_flags.contains(ListFlags::PGRP_TRANS) {
            process.list_flags.insert(ListFlags::PGRP_TRANS_WAIT);
            drop(list);
            process
                .pgrp_wq
                .wait_until(|| !process.list_flags.contains(ListFlags::PGRP_TRANS));
            list = self.lock_list();
        }
        process.list_flags.insert(ListFlags::PGRP_TRANS);

        let old = list.node_of_mut(process).and_then(|node| {
            node.pgrpid = None;
            node.pgrp.take()
        });
        let Some(old) = old else {
            drop(list);
            fatal(InvariantViolation::NoGroup(process.get_pid()));
        };
        old.refcount.fetch_add(1, Ordering::AcqRel);
        process.list_flags.remove(ListFlags::IN_PGRP);
        drop(list);
        self.unlink_member(&old, process);

        let mut list = self.lock_list();
        if new_group.is_dead() {
            drop(list);
            fatal(InvariantViolation::DeadGroupRelink(new_group.pgid));
        }
        new_group.flags.remove(GroupFlags::TERMINATE);
        let member = list.node_of_mut(process).map(|node| {
            node.pgrp = Some(new_group.clone());
            node.pgrpid = Some(new_group.pgid);
            node.sessionid = Some(new_group.get_sid());
            Arc::downgrade(&node.process)
        });
        process.list_flags.insert(ListFlags::IN_PGRP);
        if let Some(member) = member {
            new_group.inner.lock().members.insert(0, member);
        }

        process.list_flags.remove(ListFlags::PGRP_TRANS);
        let wake = process.list_flags.take(ListFlags::PGRP_TRANS_WAIT);
        drop(list);
        if wake {
            process.pgrp_wq.notify_all();
        }
    }

    /// Moves `process` into group `pgid`, creating the group (and a session)
    /// as `mode` allows.
    ///
    /// A new group must be named after `process`, which must still be the
    /// process occupying that pid. Joining the current group does nothing.
    pub fn join_group(
        self: &Arc<Self>,
        cx: &Arc<Thread>,
        process: &Arc<Process>,
        pgid: Pid,
        mode: JoinMode,
    ) -> LinuxResult<()> {
        let existing = self.find_group(pgid);
        let mine = self.proc_pgrp(process);
        let my_session = self.proc_session(process);

        let target = match existing {
            Some(group) => {
                if mine
                    .as_ref()
                    .is_some_and(|mine| Arc::ptr_eq(mine.group(), group.group()))
                {
                    return Ok(());
                }
                if mode == JoinMode::CreateSession {
                    return Err(LinuxError::EPERM);
                }
                group
            }
            None => {
                if mode == JoinMode::Existing {
                    return Err(LinuxError::ESRCH);
                }
                if process.get_pid() != pgid {
                    return Err(LinuxError::EPERM);
                }
                match self.find(cx, pgid) {
                    Some(found) if Arc::ptr_eq(found.process(), process) => {}
                    _ => return Err(LinuxError::ESRCH),
                }
                let session = match mode {
                    JoinMode::CreateSession => {
                        let login = my_session
                            .as_ref()
                            .map(|session| session.get_login())
                            .unwrap_or_else(String::new);
                        let session = Session::new(pgid, process.get_pid(), login);
                        self.hash_session(&session);
                        debug!("[process] session {} created", pgid);
                        session
                    }
                    _ => {
                        let Some(my_session) = my_session.as_ref() else {
                            return Err(LinuxError::ESRCH);
                        };
                        let list = self.lock_list();
                        let session = my_session.session().clone();
                        if session
                            .flags
                            .intersects(SessionFlags::TERM | SessionFlags::DEAD)
                        {
                            drop(list);
                            fatal(InvariantViolation::DeadSessionRef(session.get_sid()));
                        }
                        session.refcount.fetch_add(1, Ordering::AcqRel);
                        session
                    }
                };
                let group = ProcessGroup::new(pgid, session);
                group.refcount.store(1, Ordering::Release);
                self.lock_list().pgrp_hash.insert(pgid, group.clone());
                debug!(
                    "[process] pgrp {} created in session {}",
                    pgid,
                    group.get_sid()
                );
                GroupRef::from_counted(self, group)
            }
        };
        drop(my_session);

        // Count the new group in before the old one is counted out, so
        // that the old group does not spuriously look orphaned.
        self.recompute_jobc(cx, process, &target, true);
        if let Some(mine) = mine {
            self.recompute_jobc(cx, process, &mine, false);
        }
        self.replace_group(process, target.group());
        debug!(
            "[process] pid {} joined pgrp {}",
            process.get_pid(),
            target.pgid
        );
        Ok(())
    }
}
