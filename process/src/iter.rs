//! Enumerators over the registry.
//!
//! Every enumerator decides what to visit under a lock, copying pids into a
//! [`PidList`](crate::PidList), and visits them with all locks released.
//! Each pid is looked up again before its callback runs; processes that went
//! away in between are skipped.

use crate::arena::{self, PidList};
use crate::flags::ListFlags;
use crate::process::{ProcRef, ProcStat, Process, ZombieRef};
use crate::process_group::ProcessGroup;
use crate::registry::{KERNEL_PID, RefAttempt, Registry};
use crate::thread::Thread;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::ops::Deref;

/// What an enumerator does after a callback returns.
///
/// The callback owns the reference it was handed. `Returned*` says it let
/// the reference go, `Claimed*` that it kept it for later; the `*Done`
/// variants end the enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Returned,
    ReturnedDone,
    Claimed,
    ClaimedDone,
}

impl Directive {
    pub fn is_done(self) -> bool {
        matches!(self, Self::ReturnedDone | Self::ClaimedDone)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IterFlags: u32 {
        /// Do not wait for a pending transition before the callback.
        const NO_WAIT_TRANS = 1 << 0;
    }
}

/// The set of processes [`Registry::iterate`] visits.
#[derive(Clone, Copy)]
pub enum IterScope<'a> {
    /// Processes that have not exited.
    Live,
    /// Exited processes that have not been reaped.
    Zombies,
    /// Both of the above.
    All,
    ChildrenOf(&'a Process),
    MembersOf(&'a ProcessGroup),
}

impl IterScope<'_> {
    fn live(&self) -> bool {
        matches!(self, Self::Live | Self::All)
    }

    fn zombies(&self) -> bool {
        matches!(self, Self::Zombies | Self::All)
    }
}

/// A process handed to an enumeration callback.
#[derive(Debug)]
pub enum Visited {
    Live(ProcRef),
    Zombie(ZombieRef),
}

impl Deref for Visited {
    type Target = Process;

    fn deref(&self) -> &Process {
        match self {
            Self::Live(live) => live,
            Self::Zombie(zombie) => zombie,
        }
    }
}

/// Filters run with the lock of the enumerated collection held and must not
/// call back into the registry.
pub type Filter<'a> = &'a dyn Fn(&Process) -> bool;

fn accepts(filter: Option<Filter<'_>>, process: &Process) -> bool {
    filter.is_none_or(|filter| filter(process))
}

impl Registry {
    /// Calls `callback` on every process in `scope` that passes `filter`.
    ///
    /// Live processes are handed over as [`ProcRef`]s, after waiting out
    /// a pending transition unless `NO_WAIT_TRANS` is given. Zombies are
    /// handed over as [`ZombieRef`]s.
    pub fn iterate<F>(
        self: &Arc<Self>,
        cx: &Arc<Thread>,
        scope: IterScope<'_>,
        flags: IterFlags,
        filter: Option<Filter<'_>>,
        mut callback: F,
    ) where
        F: FnMut(Visited) -> Directive,
    {
        match scope {
            IterScope::ChildrenOf(parent) => {
                return self.children_walk(cx, parent, |child| {
                    if accepts(filter, &child) {
                        callback(Visited::Live(child))
                    } else {
                        Directive::Returned
                    }
                });
            }
            IterScope::MembersOf(group) => {
                return self.group_iterate(cx, group, filter, |member| {
                    callback(Visited::Live(member))
                });
            }
            _ => {}
        }

        let pids = arena::snapshot(
            self.list_lock(),
            |list| Some(list.procs.len()),
            |list, snap| {
                let candidates = list
                    .live()
                    .filter(|_| scope.live())
                    .chain(list.zombies().filter(|_| scope.zombies()));
                for node in candidates {
                    let process = &node.process;
                    if process.list_flags.contains(ListFlags::IN_CREATE)
                        || process.get_stat() == ProcStat::Idle
                    {
                        continue;
                    }
                    if !accepts(filter, process) {
                        continue;
                    }
                    if !snap.push(process.get_pid()) {
                        break;
                    }
                }
            },
        );
        debug!("[process] iterating over {} pids", pids.len());

        for pid in pids.iter() {
            let visited = if let Some(live) = self.find(cx, pid) {
                if !flags.contains(IterFlags::NO_WAIT_TRANS) {
                    // Refused only when the caller is `live` mid-commit.
                    live.transition().wait(cx, &live).ok();
                }
                Visited::Live(live)
            } else if scope.zombies() {
                match self.find_zombref(pid) {
                    Some(zombie) => Visited::Zombie(zombie),
                    None => continue,
                }
            } else {
                continue;
            };
            if callback(visited).is_done() {
                return;
            }
        }
    }

    /// Calls `callback` on every child of `parent`.
    pub fn children_walk<F>(self: &Arc<Self>, cx: &Arc<Thread>, parent: &Process, mut callback: F)
    where
        F: FnMut(ProcRef) -> Directive,
    {
        let pids = arena::snapshot(
            self.list_lock(),
            |list| {
                let count = list.node_of(parent)?.children.len();
                (count > 0).then_some(count)
            },
            |list, snap| {
                let Some(node) = list.node_of(parent) else {
                    return;
                };
                for child in node.children.iter().filter_map(|&child| list.node(child)) {
                    if child.process.get_stat() == ProcStat::Idle {
                        continue;
                    }
                    if !snap.push(child.process.get_pid()) {
                        break;
                    }
                }
            },
        );

        for pid in pids.iter() {
            let Some(child) = self.find(cx, pid) else {
                continue;
            };
            if callback(child).is_done() {
                return;
            }
        }
    }

    /// Calls `callback` on every member of `group` that passes `filter`.
    ///
    /// Members that moved to another group since the snapshot are skipped,
    /// and so is the kernel process.
    pub fn group_iterate<F>(
        self: &Arc<Self>,
        cx: &Arc<Thread>,
        group: &ProcessGroup,
        filter: Option<Filter<'_>>,
        mut callback: F,
    ) where
        F: FnMut(ProcRef) -> Directive,
    {
        let pgid = group.get_pgid();
        let pids: PidList = arena::snapshot(
            &group.inner,
            |inner| {
                let count = inner.members.len();
                (count > 0).then_some(count)
            },
            |inner, snap| {
                for member in inner.members.iter().filter_map(|member| member.upgrade()) {
                    if !accepts(filter, &member) {
                        continue;
                    }
                    if !snap.push(member.get_pid()) {
                        break;
                    }
                }
            },
        );

        for pid in pids.iter() {
            if pid == KERNEL_PID {
                continue;
            }
            let Some(member) = self.find(cx, pid) else {
                continue;
            };
            if self.get_pgid(&member) != Some(pgid) {
                continue;
            }
            if callback(member).is_done() {
                return;
            }
        }
    }

    /// Calls `callback` on live processes passing `filter` until none is
    /// left.
    ///
    /// The scan starts over from the beginning after every callback, so the
    /// callback must change the state `filter` looks at, or the scan never
    /// ends.
    pub fn reboot_scan<F>(self: &Arc<Self>, cx: &Arc<Thread>, filter: Option<Filter<'_>>, mut callback: F)
    where
        F: FnMut(ProcRef),
    {
        loop {
            let next = {
                let list = self.lock_list();
                let mut next = None;
                for node in list.live() {
                    if !accepts(filter, &node.process) {
                        continue;
                    }
                    match Self::try_ref_locked(&node.process, cx) {
                        RefAttempt::Granted => next = Some(Ok(node.process.clone())),
                        RefAttempt::MustWait => next = Some(Err(node.process.clone())),
                        RefAttempt::Refused => continue,
                    }
                    break;
                }
                next
            };
            match next {
                None => return,
                Some(Ok(process)) => {
                    let visited = ProcRef::from_counted(self, process, cx);
                    // Refused only when the caller is `visited` mid-commit.
                    visited.transition().wait(cx, &visited).ok();
                    callback(visited);
                }
                Some(Err(process)) => process
                    .refwait_wq
                    .wait_until(|| !process.list_flags.contains(ListFlags::REF_WAIT)),
            }
        }
    }
}
