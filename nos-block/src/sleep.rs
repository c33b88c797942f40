//! Suspension hooks used by blocking allocation and synchronous I/O
//!
//! The block layer does not own a scheduler. Callers that must wait for a
//! request slot or for a synchronous transfer go through a [`Sleeper`]
//! supplied by the kernel. The subsystem lock is never held across a call
//! into the sleeper.

use core::sync::atomic::{AtomicU64, Ordering};

/// Block/wake primitives of the host scheduler
pub trait Sleeper: Send + Sync {
    /// Suspend the calling task until `ready` returns true.
    ///
    /// Implementations must re-check `ready` after every wake-up and must
    /// return immediately when it already holds, so a wake-up delivered
    /// before the caller went to sleep is never lost.
    fn sleep_until(&self, ready: &dyn Fn() -> bool);

    /// Wake every task suspended in [`Sleeper::sleep_until`] so it can
    /// re-check its predicate.
    ///
    /// This is the only wake primitive. Tasks waiting for a free slot and
    /// tasks waiting for their own synchronous transfer share one sleeper,
    /// and a single freed slot may satisfy a waiter other than the one a
    /// targeted wake would pick, so the layer wakes all of them and lets
    /// each predicate decide. It does so once per completion that freed a
    /// slot or finished a synchronous request, and never otherwise.
    fn wake_all(&self);
}

/// Busy-waiting sleeper for contexts without a scheduler.
///
/// Waiters spin on their predicate, so the wake calls only count how often
/// they were issued.
#[derive(Debug, Default)]
pub struct SpinSleeper {
    wakeups: AtomicU64,
}

impl SpinSleeper {
    /// Create a spinning sleeper
    pub const fn new() -> Self {
        Self { wakeups: AtomicU64::new(0) }
    }

    /// Number of wake-ups issued so far
    pub fn wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }
}

impl Sleeper for SpinSleeper {
    fn sleep_until(&self, ready: &dyn Fn() -> bool) {
        while !ready() {
            core::hint::spin_loop();
        }
    }

    fn wake_all(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }
}
