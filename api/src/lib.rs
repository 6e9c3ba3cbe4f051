//! Control surfaces on top of the process registry.
//!
//! The `sys_*` functions follow the Linux calling convention: arguments
//! arrive as raw integers, results come back as `LinuxResult<isize>`. Every
//! entry is traced with `#[syscall_trace]`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

mod context;
pub mod imp;
mod tests;

pub use context::TaskContext;
