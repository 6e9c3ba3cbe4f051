#![cfg(test)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axerrno::LinuxError;
use process_registry::{
    JoinMode, Pcontrol, PcontrolAction, Pid, Process, Registry, SignalSink, Signo, Thread,
};

use crate::TaskContext;
use crate::imp::lowswap::{CompressorStats, LowSwapOutcome, LowSwapPolicy, TaskControl};
use crate::imp::task::*;

#[derive(Default)]
struct Mailbox {
    posted: Mutex<Vec<(Pid, Signo)>>,
}

impl Mailbox {
    fn take(&self) -> Vec<(Pid, Signo)> {
        core::mem::take(&mut *self.posted.lock().unwrap())
    }
}

impl SignalSink for Mailbox {
    fn make_runnable(&self, _process: &Process) {}

    fn post(&self, process: &Process, signo: Signo) {
        self.posted.lock().unwrap().push((process.get_pid(), signo));
    }
}

struct World {
    registry: Arc<Registry>,
    mailbox: Arc<Mailbox>,
    kcx: Arc<Thread>,
    init: Arc<Process>,
}

impl World {
    fn new() -> Self {
        let mailbox = Arc::new(Mailbox::default());
        let registry = Registry::new(mailbox.clone());
        let kcx = Thread::kernel(0);
        let init = registry.spawn_init(&kcx, "init").unwrap().process().clone();
        Self {
            registry,
            mailbox,
            kcx,
            init,
        }
    }

    fn spawn(&self, parent: &Arc<Process>, name: &str) -> Arc<Process> {
        self.registry
            .fork(&self.kcx, parent, name)
            .unwrap()
            .process()
            .clone()
    }

    /// A caller running inside `process`.
    fn caller(&self, process: &Arc<Process>) -> TaskContext {
        TaskContext::new(
            self.registry.clone(),
            Thread::new(process.get_pid(), process),
        )
    }

    fn kernel_caller(&self) -> TaskContext {
        TaskContext::new(self.registry.clone(), self.kcx.clone())
    }
}

#[test]
fn test_identity_queries() {
    let world = World::new();
    let sh = world.spawn(&world.init, "sh");
    let cx = world.caller(&sh);

    assert_eq!(sys_getpid(&cx), Ok(sh.get_pid() as isize));
    assert_eq!(sys_getppid(&cx), Ok(1));
    assert_eq!(sys_getpgid(&cx, 0), Ok(1));
    assert_eq!(sys_getsid(&cx, 0), Ok(1));
    assert_eq!(sys_getpgid(&cx, 4242), Err(LinuxError::ESRCH));
    assert_eq!(sys_getsid(&cx, -3), Err(LinuxError::EINVAL));

    let init_cx = world.caller(&world.init);
    assert_eq!(sys_getppid(&init_cx), Ok(0));
    assert_eq!(sys_getpgid(&init_cx, sh.get_pid() as i32), Ok(1));

    assert_eq!(sys_getpid(&world.kernel_caller()), Err(LinuxError::ESRCH));
}

#[test]
fn test_setpgid_moves_children() {
    let world = World::new();
    let shell = world.spawn(&world.init, "shell");
    let shell_cx = world.caller(&shell);
    assert_eq!(sys_setsid(&shell_cx), Ok(shell.get_pid() as isize));

    let first = world.spawn(&shell, "first");
    let second = world.spawn(&shell, "second");
    let job = first.get_pid();

    // The shell puts its first child in a job of its own, then the second
    // one in the same job.
    assert_eq!(sys_setpgid(&shell_cx, job as i32, 0), Ok(0));
    assert_eq!(
        sys_setpgid(&shell_cx, second.get_pid() as i32, job as i32),
        Ok(0)
    );
    assert_eq!(world.registry.get_pgid(&first), Some(job));
    assert_eq!(world.registry.get_pgid(&second), Some(job));
    let group = world.registry.find_group(job).unwrap();
    assert_eq!(group.member_count(), 2);
    assert_eq!(group.get_sid(), shell.get_pid());
    // Both members have their parent in another group of the session.
    assert_eq!(group.jobc(), 2);

    // A child can also move itself back.
    let second_cx = world.caller(&second);
    assert_eq!(
        sys_setpgid(&second_cx, 0, shell.get_pid() as i32),
        Ok(0)
    );
    assert_eq!(group.member_count(), 1);
}

#[test]
fn test_setpgid_refusals() {
    let world = World::new();
    let shell = world.spawn(&world.init, "shell");
    let shell_cx = world.caller(&shell);
    let child = world.spawn(&shell, "child");
    let stranger = world.spawn(&world.init, "stranger");

    assert_eq!(sys_setpgid(&shell_cx, 0, -1), Err(LinuxError::EINVAL));
    // Not a child of the caller.
    assert_eq!(
        sys_setpgid(&shell_cx, stranger.get_pid() as i32, 0),
        Err(LinuxError::ESRCH)
    );
    // The group must already exist unless it is named after the target.
    assert_eq!(
        sys_setpgid(&shell_cx, child.get_pid() as i32, 4242),
        Err(LinuxError::EPERM)
    );

    // A session leader cannot move.
    let leader = world.spawn(&shell, "leader");
    assert_eq!(sys_setsid(&world.caller(&leader)), Ok(leader.get_pid() as isize));
    assert_eq!(
        sys_setpgid(&world.caller(&leader), 0, 0),
        Err(LinuxError::EPERM)
    );
    // Nor can a child that went to another session.
    assert_eq!(
        sys_setpgid(&shell_cx, leader.get_pid() as i32, 0),
        Err(LinuxError::EPERM)
    );
    // Groups of other sessions are off limits.
    assert_eq!(
        sys_setpgid(&shell_cx, child.get_pid() as i32, leader.get_pid() as i32),
        Err(LinuxError::EPERM)
    );

    // A child that has exec'd is out of reach.
    world.registry.exec(&world.kcx, &child).unwrap();
    assert_eq!(
        sys_setpgid(&shell_cx, child.get_pid() as i32, 0),
        Err(LinuxError::EACCES)
    );
    assert_eq!(world.registry.get_pgid(&child), Some(1));
}

#[test]
fn test_setsid_refused_for_group_leader() {
    let world = World::new();
    let leader = world.spawn(&world.init, "leader");
    world
        .registry
        .join_group(&world.kcx, &leader, leader.get_pid(), JoinMode::CreateGroup)
        .unwrap();
    assert_eq!(sys_setsid(&world.caller(&leader)), Err(LinuxError::EPERM));
    assert_eq!(sys_setsid(&world.caller(&world.init)), Err(LinuxError::EPERM));

    let member = world.spawn(&leader, "member");
    let member_cx = world.caller(&member);
    assert_eq!(sys_setsid(&member_cx), Ok(member.get_pid() as isize));
    assert_eq!(sys_getsid(&member_cx, 0), Ok(member.get_pid() as isize));
    assert_eq!(sys_getpgid(&member_cx, 0), Ok(member.get_pid() as isize));
    let session = world.registry.find_session(member.get_pid()).unwrap();
    assert_eq!(session.get_leader_pid(), member.get_pid());
}

#[test]
fn test_killpg() {
    let world = World::new();
    let leader = world.spawn(&world.init, "leader");
    let cx = world.caller(&leader);
    let pgid = leader.get_pid();
    assert_eq!(sys_setpgid(&cx, 0, 0), Ok(0));
    let a = world.spawn(&leader, "a");
    let b = world.spawn(&leader, "b");

    assert_eq!(sys_killpg(&cx, pgid as i32, Signo::SIGTERM as u32), Ok(0));
    let mut posted = world.mailbox.take();
    posted.sort_by_key(|(pid, _)| *pid);
    assert_eq!(
        posted,
        vec![
            (pgid, Signo::SIGTERM),
            (a.get_pid(), Signo::SIGTERM),
            (b.get_pid(), Signo::SIGTERM),
        ]
    );

    // Own group, and the existence check.
    assert_eq!(sys_killpg(&world.caller(&a), 0, Signo::SIGHUP as u32), Ok(0));
    assert_eq!(world.mailbox.take().len(), 3);
    assert_eq!(sys_killpg(&cx, pgid as i32, 0), Ok(0));
    assert!(world.mailbox.take().is_empty());

    assert_eq!(sys_killpg(&cx, 4242, 9), Err(LinuxError::ESRCH));
    assert_eq!(sys_killpg(&cx, pgid as i32, 64), Err(LinuxError::EINVAL));
    assert_eq!(sys_killpg(&cx, -1, 9), Err(LinuxError::EINVAL));
    assert!(world.mailbox.take().is_empty());
}

#[derive(Default)]
struct Pool {
    sizes: Mutex<Vec<(Pid, u64)>>,
    total: AtomicUsize,
}

impl Pool {
    fn set(&self, process: &Process, size: u64) {
        self.sizes.lock().unwrap().push((process.get_pid(), size));
    }
}

impl CompressorStats for Pool {
    fn task_compressed(&self, process: &Process) -> u64 {
        self.sizes
            .lock()
            .unwrap()
            .iter()
            .find(|(pid, _)| *pid == process.get_pid())
            .map_or(0, |(_, size)| *size)
    }

    fn pages_compressed(&self) -> u64 {
        self.total.load(Ordering::Relaxed) as u64
    }
}

#[derive(Default)]
struct Tasks {
    suspended: Mutex<Vec<Pid>>,
    resumed: Mutex<Vec<Pid>>,
    jetsam_ready: AtomicBool,
    jetsam_kills: AtomicUsize,
    owners: Mutex<Vec<Pid>>,
}

impl TaskControl for Tasks {
    fn suspend(&self, process: &Process) {
        self.suspended.lock().unwrap().push(process.get_pid());
    }

    fn resume(&self, process: &Process) {
        self.resumed.lock().unwrap().push(process.get_pid());
    }

    fn is_resource_owner(&self, process: &Process) -> bool {
        self.owners.lock().unwrap().contains(&process.get_pid())
    }

    fn jetsam_candidates(&self) -> usize {
        self.jetsam_ready.load(Ordering::Relaxed) as usize
    }

    fn jetsam_kill_async(&self) {
        self.jetsam_kills.fetch_add(1, Ordering::Relaxed);
    }
}

struct LowSwap {
    world: World,
    pool: Arc<Pool>,
    tasks: Arc<Tasks>,
    policy: LowSwapPolicy,
}

fn low_swap() -> LowSwap {
    let world = World::new();
    let pool = Arc::new(Pool::default());
    let tasks = Arc::new(Tasks::default());
    let policy = LowSwapPolicy::new(world.registry.clone(), pool.clone(), tasks.clone());
    LowSwap {
        world,
        pool,
        tasks,
        policy,
    }
}

#[test]
fn test_lowswap_kills_dominant_process() {
    let ls = low_swap();
    let hog = ls.world.spawn(&ls.world.init, "hog");
    let small = ls.world.spawn(&ls.world.init, "small");
    ls.pool.set(&hog, 600);
    ls.pool.set(&small, 100);
    ls.pool.total.store(1000, Ordering::Relaxed);

    let kcx = ls.world.kcx.clone();
    assert_eq!(
        ls.policy.no_paging_space_action(&kcx, 100),
        LowSwapOutcome::KilledLargest(hog.get_pid())
    );
    assert_eq!(ls.world.mailbox.take(), vec![(hog.get_pid(), Signo::SIGKILL)]);

    // Rate limited.
    assert_eq!(
        ls.policy.no_paging_space_action(&kcx, 105),
        LowSwapOutcome::TooSoon
    );
    assert_ne!(
        ls.policy.no_paging_space_action(&kcx, 106),
        LowSwapOutcome::TooSoon
    );
}

#[test]
fn test_lowswap_prefers_jetsam_then_declared_action() {
    let ls = low_swap();
    let big = ls.world.spawn(&ls.world.init, "big");
    let bigger = ls.world.spawn(&ls.world.init, "bigger");
    let unmanaged = ls.world.spawn(&ls.world.init, "unmanaged");
    ls.pool.set(&big, 100);
    ls.pool.set(&bigger, 300);
    ls.pool.set(&unmanaged, 400);
    ls.pool.total.store(1000, Ordering::Relaxed);

    for process in [&big, &bigger] {
        let cx = ls.world.caller(process);
        assert_eq!(ls.policy.set_pcontrol(&cx, PcontrolAction::Suspend), Ok(0));
    }

    let kcx = ls.world.kcx.clone();
    ls.tasks.jetsam_ready.store(true, Ordering::Relaxed);
    assert_eq!(
        ls.policy.no_paging_space_action(&kcx, 10),
        LowSwapOutcome::Jetsam
    );
    assert_eq!(ls.tasks.jetsam_kills.load(Ordering::Relaxed), 1);

    ls.tasks.jetsam_ready.store(false, Ordering::Relaxed);
    assert_eq!(
        ls.policy.no_paging_space_action(&kcx, 20),
        LowSwapOutcome::Controlled(bigger.get_pid())
    );
    assert_eq!(*ls.tasks.suspended.lock().unwrap(), vec![bigger.get_pid()]);
    assert_eq!(
        ls.policy.get_pcontrol(&ls.world.kernel_caller(), bigger.get_pid() as i32),
        Ok(Pcontrol {
            control: PcontrolAction::Suspend,
            acted: true,
        })
    );

    // The acted-on process is out of the running; the next one is picked.
    assert_eq!(
        ls.policy.no_paging_space_action(&kcx, 30),
        LowSwapOutcome::Controlled(big.get_pid())
    );
    assert_eq!(
        ls.policy.no_paging_space_action(&kcx, 40),
        LowSwapOutcome::NoneEligible
    );
    // The unmanaged process never crossed the danger line.
    assert!(ls.world.mailbox.take().is_empty());
}

#[test]
fn test_lowswap_reset() {
    let ls = low_swap();
    let owner = ls.world.spawn(&ls.world.init, "owner");
    let throttled = ls.world.spawn(&ls.world.init, "throttled");
    let suspended = ls.world.spawn(&ls.world.init, "suspended");
    let doomed = ls.world.spawn(&ls.world.init, "doomed");
    ls.tasks.owners.lock().unwrap().push(owner.get_pid());

    let pairs = [
        (&throttled, PcontrolAction::Throttle),
        (&suspended, PcontrolAction::Suspend),
        (&doomed, PcontrolAction::Kill),
    ];
    for (process, control) in pairs {
        ls.policy
            .set_pcontrol(&ls.world.caller(process), control)
            .unwrap();
        ls.policy.do_pcontrol(process);
        assert!(process.pcontrol().lock().acted);
    }
    assert_eq!(*ls.tasks.suspended.lock().unwrap(), vec![suspended.get_pid()]);
    assert_eq!(ls.world.mailbox.take(), vec![(doomed.get_pid(), Signo::SIGKILL)]);

    // Applying twice does nothing.
    ls.policy.do_pcontrol(&doomed);
    assert!(ls.world.mailbox.take().is_empty());

    let intruder = ls.world.caller(&throttled);
    assert_eq!(
        ls.policy.reset_pcontrol(&intruder, suspended.get_pid() as i32),
        Err(LinuxError::EACCES)
    );

    let cx = ls.world.caller(&owner);
    for process in [&throttled, &suspended, &doomed] {
        assert_eq!(ls.policy.reset_pcontrol(&cx, process.get_pid() as i32), Ok(0));
    }
    assert!(!throttled.pcontrol().lock().acted);
    assert!(!suspended.pcontrol().lock().acted);
    assert!(doomed.pcontrol().lock().acted);
    assert_eq!(*ls.tasks.resumed.lock().unwrap(), vec![suspended.get_pid()]);

    assert_eq!(ls.policy.reset_pcontrol(&cx, 4242), Err(LinuxError::ESRCH));
    assert_eq!(
        ls.policy.get_pcontrol(&cx, 4242),
        Err(LinuxError::ESRCH)
    );
}
