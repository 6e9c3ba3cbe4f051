use crate::TaskContext;
use axerrno::{LinuxError, LinuxResult};
use syscall_trace::syscall_trace;

#[syscall_trace]
pub fn sys_getpid(cx: &TaskContext) -> LinuxResult<isize> {
    Ok(cx.current_process()?.get_pid() as _)
}

#[syscall_trace]
pub fn sys_getppid(cx: &TaskContext) -> LinuxResult<isize> {
    let process = cx.current_process()?;
    Ok(cx.registry().get_ppid(&process).unwrap_or(0) as _)
}

#[syscall_trace]
pub fn sys_getpgid(cx: &TaskContext, pid: i32) -> LinuxResult<isize> {
    let target = cx.target(pid)?;
    let pgid = cx.registry().get_pgid(&target).ok_or(LinuxError::ESRCH)?;
    Ok(pgid as _)
}

#[syscall_trace]
pub fn sys_getsid(cx: &TaskContext, pid: i32) -> LinuxResult<isize> {
    let target = cx.target(pid)?;
    let sid = cx.registry().get_sid(&target).ok_or(LinuxError::ESRCH)?;
    Ok(sid as _)
}
