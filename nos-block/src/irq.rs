//! Interrupt masking around the subsystem lock
//!
//! Drivers report completions from their interrupt handlers, so the
//! subsystem lock is also taken in interrupt context. If an interrupt
//! arrived on a CPU that already holds the lock, the handler would spin on
//! it forever. [`IrqLock`] therefore masks local interrupts through an
//! [`IrqControl`] hook before acquiring the lock and restores the previous
//! state after releasing it, the same push/pop discipline the kernel's
//! `SpinLockIrq` follows.

use alloc::sync::Arc;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

/// Local interrupt masking supplied by the kernel
pub trait IrqControl: Send + Sync {
    /// Disable interrupts on the current CPU and report whether they were
    /// enabled before
    fn save_disable(&self) -> bool;

    /// Restore the state returned by the matching [`IrqControl::save_disable`]
    fn restore(&self, was_enabled: bool);
}

/// Control for contexts where completions never arrive from an interrupt,
/// such as hosted builds and tests
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIrq;

impl IrqControl for NoIrq {
    fn save_disable(&self) -> bool {
        false
    }

    fn restore(&self, _was_enabled: bool) {}
}

/// Nesting counter standing in for a CPU's interrupt flag.
///
/// Useful for checking that every masked section is unmasked again.
#[derive(Debug, Default)]
pub struct CountingIrq {
    depth: AtomicUsize,
    disables: AtomicUsize,
}

impl CountingIrq {
    /// Create a control with interrupts enabled
    pub const fn new() -> Self {
        Self { depth: AtomicUsize::new(0), disables: AtomicUsize::new(0) }
    }

    /// Whether interrupts are currently masked
    pub fn masked(&self) -> bool {
        self.depth.load(Ordering::Acquire) > 0
    }

    /// Number of masked sections entered so far
    pub fn disables(&self) -> usize {
        self.disables.load(Ordering::Relaxed)
    }
}

impl IrqControl for CountingIrq {
    fn save_disable(&self) -> bool {
        self.disables.fetch_add(1, Ordering::Relaxed);
        self.depth.fetch_add(1, Ordering::AcqRel) == 0
    }

    fn restore(&self, was_enabled: bool) {
        let previous = self.depth.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            crate::blk_fatal!("interrupt restore without matching disable");
        }
        if was_enabled != (previous == 1) {
            crate::blk_fatal!("interrupt restore out of order (depth {})", previous);
        }
    }
}

/// Spin lock that keeps local interrupts masked while held
pub struct IrqLock<T> {
    inner: Mutex<T>,
    irq: Arc<dyn IrqControl>,
}

impl<T> IrqLock<T> {
    /// Wrap `value`
    pub fn new(value: T, irq: Arc<dyn IrqControl>) -> Self {
        Self { inner: Mutex::new(value), irq }
    }

    /// Mask interrupts, then acquire the lock
    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        let was_enabled = self.irq.save_disable();
        IrqLockGuard { guard: Some(self.inner.lock()), irq: &*self.irq, was_enabled }
    }
}

/// RAII guard for [`IrqLock`]; unlocks before restoring interrupts
pub struct IrqLockGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    irq: &'a dyn IrqControl,
    was_enabled: bool,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("guard is only taken on drop"),
        }
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("guard is only taken on drop"),
        }
    }
}

impl<T> Drop for IrqLockGuard<'_, T> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.irq.restore(self.was_enabled);
    }
}
