//! Job-control eligibility and orphaned process groups.
//!
//! A group's `jobc` counts the members whose parent sits in a different
//! group of the same session: those parents can still stop and resume the
//! group from the terminal. When the count drops to zero the group is
//! orphaned, and its stopped members are woken with a hang-up followed by a
//! continue so that they do not stay stopped forever.

use crate::arena;
use crate::iter::Directive;
use crate::process::{ProcRef, Process};
use crate::process_group::ProcessGroup;
use crate::registry::{KERNEL_PID, Registry};
use crate::session::Session;
use crate::thread::Thread;
use alloc::sync::Arc;

/// Signal numbers, as on Linux.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Signo {
    SIGHUP = 1,
    SIGINT = 2,
    SIGQUIT = 3,
    SIGKILL = 9,
    SIGTERM = 15,
    SIGCHLD = 17,
    SIGCONT = 18,
    SIGSTOP = 19,
    SIGTSTP = 20,
    SIGTTIN = 21,
    SIGTTOU = 22,
}

impl Signo {
    pub fn from_repr(signo: u8) -> Option<Self> {
        Some(match signo {
            1 => Self::SIGHUP,
            2 => Self::SIGINT,
            3 => Self::SIGQUIT,
            9 => Self::SIGKILL,
            15 => Self::SIGTERM,
            17 => Self::SIGCHLD,
            18 => Self::SIGCONT,
            19 => Self::SIGSTOP,
            20 => Self::SIGTSTP,
            21 => Self::SIGTTIN,
            22 => Self::SIGTTOU,
            _ => return None,
        })
    }
}

/// Signal delivery, as seen from the registry.
///
/// Implementations may re-enter the registry; they are never called with a
/// registry or group lock held.
pub trait SignalSink: Send + Sync {
    /// Makes a stopped process schedulable again.
    fn make_runnable(&self, process: &Process);

    /// Posts `signo` to `process`.
    fn post(&self, process: &Process, signo: Signo);

    fn hangup(&self, process: &Process) {
        self.post(process, Signo::SIGHUP);
    }

    fn cont(&self, process: &Process) {
        self.post(process, Signo::SIGCONT);
    }
}

fn same_group(a: Option<&ProcessGroup>, b: &ProcessGroup) -> bool {
    a.is_some_and(|a| core::ptr::eq(a, b))
}

fn same_session(a: Option<&Session>, b: &Session) -> bool {
    a.is_some_and(|a| core::ptr::eq(a, b))
}

impl Registry {
    /// Adjusts job-control counts for `process` entering or leaving `group`.
    ///
    /// `group` gains or loses eligibility through the parent of `process`;
    /// the groups of the children of `process` gain or lose it through
    /// `process` itself.
    pub fn recompute_jobc(
        self: &Arc<Self>,
        cx: &Arc<Thread>,
        process: &Process,
        group: &ProcessGroup,
        entering: bool,
    ) {
        let my_session = group.get_session();

        // Taking a ref on our own process could deadlock if we are the one
        // exiting.
        let current = cx.get_process();
        let parent_is_current = current.as_ref().is_some_and(|current| {
            self.lock_list()
                .parent_of(process)
                .is_some_and(|parent| Arc::ptr_eq(parent, current))
        });
        let parent_ref;
        let parent: Option<&Process> = if parent_is_current {
            current.as_deref()
        } else {
            parent_ref = self.parent(cx, process);
            parent_ref.as_deref()
        };

        if let Some(parent) = parent {
            let his_pgrp = self.proc_pgrp(parent);
            let his_session = self.proc_session(parent);
            if !same_group(his_pgrp.as_deref(), group)
                && same_session(his_session.as_deref(), my_session)
            {
                self.adjust_jobc(cx, group, entering);
            }
        }

        self.children_walk(cx, process, |child: ProcRef| {
            let his_pgrp = self.proc_pgrp(&child);
            let his_session = self.proc_session(&child);
            if let Some(his_pgrp) = his_pgrp.as_deref() {
                if !core::ptr::eq(his_pgrp, group)
                    && same_session(his_session.as_deref(), my_session)
                {
                    self.adjust_jobc(cx, his_pgrp, entering);
                }
            }
            Directive::Returned
        });
    }

    /// Counts `child`'s group in for its new parent `reaper`.
    pub(crate) fn qualify_for_new_parent(
        self: &Arc<Self>,
        cx: &Arc<Thread>,
        child: &Process,
        reaper: &Process,
    ) {
        let Some(his_pgrp) = self.proc_pgrp(child) else {
            return;
        };
        let reaper_pgrp = self.proc_pgrp(reaper);
        let reaper_session = self.proc_session(reaper);
        if !same_group(reaper_pgrp.as_deref(), &his_pgrp)
            && same_session(reaper_session.as_deref(), his_pgrp.get_session())
        {
            self.adjust_jobc(cx, &his_pgrp, true);
        }
    }

    fn adjust_jobc(self: &Arc<Self>, cx: &Arc<Thread>, group: &ProcessGroup, entering: bool) {
        let mut inner = group.inner.lock();
        if entering {
            inner.jobc += 1;
            return;
        }
        if inner.jobc == 0 {
            warn!("[process] jobc of pgrp {} already zero", group.get_pgid());
            return;
        }
        inner.jobc -= 1;
        let orphaned = inner.jobc == 0;
        drop(inner);
        if orphaned {
            self.orphan_handling(cx, group);
        }
    }

    /// Wakes up the stopped members of an orphaned group with a hang-up and
    /// a continue.
    pub fn orphan_handling(self: &Arc<Self>, cx: &Arc<Thread>, group: &ProcessGroup) {
        let pids = arena::snapshot(
            &group.inner,
            |inner| {
                let mut count = 0;
                let mut stopped = false;
                for member in inner.members.iter().filter_map(|member| member.upgrade()) {
                    count += 1;
                    stopped |= member.is_stopped();
                }
                (count > 0 && stopped).then_some(count)
            },
            |inner, snap| {
                for member in inner.members.iter().filter_map(|member| member.upgrade()) {
                    if !snap.push(member.get_pid()) {
                        break;
                    }
                }
            },
        );
        if pids.is_empty() {
            return;
        }
        info!(
            "[process] pgrp {} orphaned with stopped members",
            group.get_pgid()
        );

        for pid in pids.iter() {
            if pid == KERNEL_PID {
                continue;
            }
            let Some(member) = self.find(cx, pid) else {
                continue;
            };
            if !member.is_stopped() {
                continue;
            }
            // Refused only when the member is ourselves mid-commit.
            let _ = member.transition().wait(cx, &member);
            let sink = self.sink();
            sink.make_runnable(&member);
            sink.hangup(&member);
            sink.cont(&member);
            debug!("[process] hung up orphaned pid {}", pid);
        }
    }
}
