//! Wait queues keyed by object.
//!
//! A waiter states the condition it needs with [`WaitQueue::wait_until`]; the
//! side that changes the state calls [`WaitQueue::notify_all`] afterwards.
//! The waiter registers a listener before its last check of the condition, so
//! a notification sent in between is never lost.

use event_listener::{Event, EventListener};

/// A queue of threads waiting for a condition on one object.
pub struct WaitQueue {
    event: Event,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            event: Event::new(),
        }
    }

    /// Blocks the current thread until `condition` returns `true`.
    pub fn wait_until(&self, mut condition: impl FnMut() -> bool) {
        loop {
            if condition() {
                return;
            }
            let listener = self.event.listen();
            if condition() {
                return;
            }
            block_on(listener);
        }
    }

    /// Wakes up every waiter so that it re-checks its condition.
    pub fn notify_all(&self) {
        self.event.notify(usize::MAX);
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "std"))]
fn block_on(listener: EventListener) {
    use event_listener::Listener;

    listener.wait();
}

/// Without a scheduler to park on, polls the listener until it fires.
#[cfg(not(any(test, feature = "std")))]
fn block_on(mut listener: EventListener) {
    use core::future::Future;
    use core::pin::Pin;
    use core::task::{Context, Waker};

    let mut cx = Context::from_waker(Waker::noop());
    while Pin::new(&mut listener).poll(&mut cx).is_pending() {
        core::hint::spin_loop();
    }
}
