use crate::TaskContext;
use alloc::sync::Arc;
use axerrno::{LinuxError, LinuxResult};
use process_registry::{Directive, JoinMode, Pid, Signo};
use syscall_trace::syscall_trace;

/// Moves process `pid` (0 for the caller) into group `pgid` (0 for a group
/// named after `pid`).
///
/// The target must be the caller or one of its children that has not
/// exec'd yet, live in the caller's session and not lead a session. An
/// existing group must belong to the caller's session.
#[syscall_trace]
pub fn sys_setpgid(cx: &TaskContext, pid: i32, pgid: i32) -> LinuxResult<isize> {
    if pgid < 0 {
        return Err(LinuxError::EINVAL);
    }
    let registry = cx.registry();
    let current = cx.current_process()?;
    let target = cx.target(pid)?;
    let my_sid = registry.get_sid(&current);

    if !Arc::ptr_eq(target.process(), &current) {
        if registry.get_ppid(&target) != Some(current.get_pid()) {
            return Err(LinuxError::ESRCH);
        }
        if registry.get_sid(&target) != my_sid {
            return Err(LinuxError::EPERM);
        }
        if target.get_id_version() != 0 {
            return Err(LinuxError::EACCES);
        }
    }
    if registry.get_sid(&target) == Some(target.get_pid()) {
        return Err(LinuxError::EPERM);
    }

    let pgid = if pgid == 0 {
        target.get_pid()
    } else {
        pgid as Pid
    };
    let mode = if pgid == target.get_pid() {
        JoinMode::CreateGroup
    } else {
        let group = registry.find_group(pgid).ok_or(LinuxError::EPERM)?;
        if Some(group.get_sid()) != my_sid {
            return Err(LinuxError::EPERM);
        }
        JoinMode::Existing
    };
    registry.join_group(cx.thread(), target.process(), pgid, mode)?;
    Ok(0)
}

/// Starts a new session led by the caller, in a new group of its own.
#[syscall_trace]
pub fn sys_setsid(cx: &TaskContext) -> LinuxResult<isize> {
    let registry = cx.registry();
    let current = cx.current_process()?;
    let pid = current.get_pid();
    if registry.get_pgid(&current) == Some(pid) || registry.find_group(pid).is_some() {
        return Err(LinuxError::EPERM);
    }
    registry.join_group(cx.thread(), &current, pid, JoinMode::CreateSession)?;
    Ok(pid as _)
}

/// Sends `signo` to every member of group `pgid` (0 for the caller's
/// group). Signal 0 only checks that the group exists.
#[syscall_trace]
pub fn sys_killpg(cx: &TaskContext, pgid: i32, signo: u32) -> LinuxResult<isize> {
    let registry = cx.registry();
    let pgid = match pgid {
        0 => {
            let current = cx.current_process()?;
            registry.get_pgid(&current).ok_or(LinuxError::ESRCH)?
        }
        1.. => pgid as Pid,
        _ => return Err(LinuxError::EINVAL),
    };
    let signo = match signo {
        0 => None,
        _ => Some(
            u8::try_from(signo)
                .ok()
                .and_then(Signo::from_repr)
                .ok_or(LinuxError::EINVAL)?,
        ),
    };
    let group = registry.find_group(pgid).ok_or(LinuxError::ESRCH)?;
    let Some(signo) = signo else {
        return Ok(0);
    };

    info!("Send signal {:?} to process group {}", signo, pgid);
    let mut count = 0usize;
    registry.group_iterate(cx.thread(), &group, None, |member| {
        registry.sink().post(&member, signo);
        count += 1;
        Directive::Returned
    });
    debug!("[sys_killpg] successfully sent signal {} processes", count);

    if count > 0 {
        Ok(0)
    } else {
        Err(LinuxError::ESRCH)
    }
}
