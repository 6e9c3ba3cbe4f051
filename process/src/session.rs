use crate::Pid;
use crate::fatal::{InvariantViolation, fatal};
use crate::flags::{AtomicFlags, ListFlags, SessionFlags};
use crate::process::Process;
use crate::process_group::{GroupRef, ProcessGroup};
use crate::registry::{ProcList, Registry};
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use axerrno::{LinuxError, LinuxResult};
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

struct SessionInner {
    login: String,
    tty: Weak<Terminal>,
    /// Pgid of the foreground group, if a terminal is attached.
    tty_pgid: Option<Pid>,
}

/// A session.
///
/// `refcount` counts the process groups of the session plus every
/// [`SessionRef`]. There is no deferred teardown: the session is unhashed
/// as soon as the count drops to zero.
pub struct Session {
    sid: Pid,
    /// Pid of the process that created the session, for diagnostics only.
    leader: Pid,
    pub(crate) refcount: AtomicU32,
    pub(crate) flags: AtomicFlags<SessionFlags>,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// A session counted once, for the group created along with it.
    pub(crate) fn new(sid: Pid, leader: Pid, login: String) -> Arc<Self> {
        Arc::new(Self {
            sid,
            leader,
            refcount: AtomicU32::new(1),
            flags: AtomicFlags::new(SessionFlags::empty()),
            inner: Mutex::new(SessionInner {
                login,
                tty: Weak::new(),
                tty_pgid: None,
            }),
        })
    }

    /// Get session id
    pub fn get_sid(&self) -> Pid {
        self.sid
    }

    pub fn get_leader_pid(&self) -> Pid {
        self.leader
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags.get()
    }

    pub fn get_login(&self) -> String {
        self.inner.lock().login.clone()
    }

    pub fn set_login(&self, login: &str) {
        let mut inner = self.inner.lock();
        inner.login.clear();
        inner.login.push_str(login);
    }

    /// The controlling terminal, if one is attached and still alive.
    pub fn get_terminal(&self) -> Option<Arc<Terminal>> {
        self.inner.lock().tty.upgrade()
    }

    /// Pgid of the foreground process group on the controlling terminal.
    pub fn tty_pgid(&self) -> Option<Pid> {
        self.inner.lock().tty_pgid
    }

    pub(crate) fn clear_tty_pgid(&self, pgid: Pid) {
        let mut inner = self.inner.lock();
        if inner.tty_pgid == Some(pgid) {
            inner.tty_pgid = None;
        }
    }

    /// Unhooks the controlling terminal from this session being torn down.
    pub(crate) fn detach_terminal(self: &Arc<Self>) {
        let tty = core::mem::take(&mut self.inner.lock().tty);
        if let Some(tty) = tty.upgrade() {
            let mut link = tty.inner.lock();
            if core::ptr::eq(link.session.as_ptr(), Arc::as_ptr(self)) {
                link.session = Weak::new();
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("leader", &self.leader)
            .field("refcount", &self.refcount())
            .field("flags", &self.flags())
            .finish()
    }
}

#[derive(Default)]
struct TerminalLink {
    session: Weak<Session>,
    pgrp: Weak<ProcessGroup>,
}

/// A controlling terminal.
///
/// Only the links into the registry are modelled: the session it controls
/// and its foreground process group. Both are cleared when the objects they
/// point to are torn down.
#[derive(Default)]
pub struct Terminal {
    inner: Mutex<TerminalLink>,
}

impl Terminal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner.lock().session.upgrade()
    }

    /// The foreground process group.
    pub fn foreground(&self) -> Option<Arc<ProcessGroup>> {
        self.inner.lock().pgrp.upgrade()
    }

    pub(crate) fn clear_foreground(&self, group: &Arc<ProcessGroup>) {
        let mut link = self.inner.lock();
        if core::ptr::eq(link.pgrp.as_ptr(), Arc::as_ptr(group)) {
            link.pgrp = Weak::new();
        }
    }
}

/// A counted reference on a session.
pub struct SessionRef {
    registry: Arc<Registry>,
    session: Arc<Session>,
}

impl SessionRef {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Deref for SessionRef {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionRef").field(&self.session.sid).finish()
    }
}

impl Drop for SessionRef {
    fn drop(&mut self) {
        self.registry.release_session(&self.session);
    }
}

impl Registry {
    pub(crate) fn hash_session(&self, session: &Arc<Session>) {
        self.lock_list()
            .session_hash
            .insert(session.sid, session.clone());
    }

    pub(crate) fn unhash_session(&self, list: &mut ProcList, session: &Arc<Session>) {
        if list
            .session_hash
            .get(&session.sid)
            .is_some_and(|hashed| Arc::ptr_eq(hashed, session))
        {
            list.session_hash.remove(&session.sid);
        }
    }

    fn session_ref_locked(self: &Arc<Self>, session: &Arc<Session>) -> SessionRef {
        if session
            .flags
            .intersects(SessionFlags::TERM | SessionFlags::DEAD)
        {
            fatal(InvariantViolation::DeadSessionRef(session.sid));
        }
        session.refcount.fetch_add(1, Ordering::AcqRel);
        SessionRef {
            registry: self.clone(),
            session: session.clone(),
        }
    }

    /// Looks a session up by id.
    pub fn find_session(self: &Arc<Self>, sid: Pid) -> Option<SessionRef> {
        let list = self.lock_list();
        let session = list.session_hash.get(&sid)?.clone();
        let found = self.session_ref_locked(&session);
        drop(list);
        Some(found)
    }

    /// Returns a reference on the session of `process`, waiting while the
    /// process moves between groups.
    pub fn proc_session(self: &Arc<Self>, process: &Process) -> Option<SessionRef> {
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
            let found = self.session_ref_locked(group.get_session());
            drop(list);
            return Some(found);
        }
    }

    /// Sid of `process` without taking a reference.
    pub fn get_sid(&self, process: &Process) -> Option<Pid> {
        self.lock_list().node_of(process)?.sessionid
    }

    /// Drops a session reference; the last one frees the session.
    pub fn release_session(&self, session: &Arc<Session>) {
        let mut list = self.lock_list();
        let count = session.refcount();
        if count == 0 {
            drop(list);
            fatal(InvariantViolation::NegativeSessionRef(session.sid));
        }
        session.refcount.store(count - 1, Ordering::Release);
        if count > 1 {
            return;
        }
        if session
            .flags
            .intersects(SessionFlags::TERM | SessionFlags::DEAD)
        {
            drop(list);
            fatal(InvariantViolation::DoubleSessionFree(session.sid));
        }
        session.flags.insert(SessionFlags::TERM);
        self.unhash_session(&mut list, session);
        session.flags.insert(SessionFlags::DEAD);
        drop(list);
        session.detach_terminal();
        debug!("[process] session {} freed", session.sid);
    }

    /// Makes `tty` the controlling terminal of the session of `process`,
    /// with the group of `process` in the foreground.
    ///
    /// Only a session leader may acquire a terminal, and only one that no
    /// other session controls.
    pub fn set_controlling_terminal(
        self: &Arc<Self>,
        process: &Process,
        tty: &Arc<Terminal>,
    ) -> LinuxResult<()> {
        let session = self
            .proc_session(process)
            .ok_or(LinuxError::ESRCH)?;
        let group = self
            .proc_pgrp(process)
            .ok_or(LinuxError::ESRCH)?;
        if session.leader != process.get_pid() {
            return Err(LinuxError::EPERM);
        }
        {
            let mut link = tty.inner.lock();
            if let Some(owner) = link.session.upgrade() {
                if !Arc::ptr_eq(&owner, session.session()) {
                    return Err(LinuxError::EPERM);
                }
            }
            link.session = Arc::downgrade(session.session());
            link.pgrp = Arc::downgrade(group.group());
        }
        let mut inner = session.inner.lock();
        inner.tty = Arc::downgrade(tty);
        inner.tty_pgid = Some(group.get_pgid());
        Ok(())
    }

    /// Puts group `pgid` in the foreground of the terminal of `process`'s
    /// session. The group must belong to that session.
    pub fn set_foreground(self: &Arc<Self>, process: &Process, pgid: Pid) -> LinuxResult<()> {
        let session = self
            .proc_session(process)
            .ok_or(LinuxError::ESRCH)?;
        let tty = session.get_terminal().ok_or(LinuxError::ENOTTY)?;
        let group = self.find_group(pgid).ok_or(LinuxError::ESRCH)?;
        if !Arc::ptr_eq(group.get_session(), session.session()) {
            return Err(LinuxError::EPERM);
        }
        tty.inner.lock().pgrp = Arc::downgrade(group.group());
        session.inner.lock().tty_pgid = Some(pgid);
        Ok(())
    }

    /// Foreground group of the terminal controlled by the session of
    /// `process`.
    pub fn tty_pgrp(self: &Arc<Self>, process: &Process) -> Option<GroupRef> {
        let session = self.proc_session(process)?;
        let pgid = session.get_terminal()?.foreground()?.get_pgid();
        self.find_group(pgid)
    }
}
