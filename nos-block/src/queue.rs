//! Per-device request queue
//!
//! Each registered device owns a [`DeviceQueue`]: the ordered list of
//! pending request handles, the plug that holds dispatch back while a batch
//! forms, the device limits and tunables, and the driver to call when work
//! is ready.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::blk_fatal;
use crate::config::{DeviceClass, DeviceConfig, ElevatorTunables};
use crate::elevator;
use crate::pool::RequestPool;
use crate::request::{RequestHandle, RequestInfo};
use crate::types::DeviceId;

/// Low-level driver of a block device.
///
/// `request` is called without the subsystem lock held whenever the queue
/// has work and is not plugged. The driver pulls the head through
/// [`BlockLayer::current_request`](crate::BlockLayer::current_request) and
/// reports progress with
/// [`BlockLayer::complete_one`](crate::BlockLayer::complete_one). It may be
/// called again before an earlier call returns, so drivers serialize their
/// own hardware access.
///
/// Completions may be reported from the driver's interrupt handler when the
/// layer was built with
/// [`BlockLayer::with_irq_control`](crate::BlockLayer::with_irq_control):
/// the subsystem lock is then only ever held with local interrupts masked.
/// Completion callbacks run after interrupts are restored, on whatever
/// context reported the completion, and must not sleep.
#[cfg_attr(test, mockall::automock)]
pub trait BlockDriver: Send + Sync {
    /// Start or continue work on the device's pending list
    fn request(&self, layer: &crate::BlockLayer, device: DeviceId);
}

/// Per-device counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Submissions accepted (merged or queued)
    pub submitted: u64,
    /// Submissions appended to an existing request
    pub back_merges: u64,
    /// Submissions prepended to an existing request
    pub front_merges: u64,
    /// Requests folded into their predecessor after a front merge
    pub collapses: u64,
    /// Requests given a new slot and inserted by the elevator
    pub queued: u64,
    /// Driver invocations
    pub dispatches: u64,
    /// Dispatches forced by a request out of credit
    pub forced_dispatches: u64,
    /// Read-ahead/write-ahead submissions dropped on pool exhaustion
    pub dropped: u64,
    /// Submissions refused at admission
    pub rejected: u64,
    /// Sub-buffers completed successfully
    pub completed: u64,
    /// Sub-buffers completed with an error
    pub failed: u64,
}

impl QueueStats {
    pub(crate) fn record_merge(&mut self, front: bool, collapsed: bool) {
        self.submitted += 1;
        if front {
            self.front_merges += 1;
        } else {
            self.back_merges += 1;
        }
        if collapsed {
            self.collapses += 1;
        }
    }

    pub(crate) fn record_queued(&mut self) {
        self.submitted += 1;
        self.queued += 1;
    }

    pub(crate) fn record_completion(&mut self, success: bool) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Pending list and settings of one device
pub struct DeviceQueue {
    id: DeviceId,
    /// Pending requests in dispatch order
    pub(crate) pending: Vec<RequestHandle>,
    /// Dispatch is held back while a batch forms
    pub(crate) plugged: bool,
    pub(crate) config: DeviceConfig,
    pub(crate) read_only: bool,
    pub(crate) stats: QueueStats,
    driver: Arc<dyn BlockDriver>,
}

impl DeviceQueue {
    /// Create an empty, unplugged queue
    pub fn new(id: DeviceId, config: DeviceConfig, driver: Arc<dyn BlockDriver>) -> Self {
        Self {
            id,
            pending: Vec::new(),
            plugged: false,
            config,
            read_only: false,
            stats: QueueStats::default(),
            driver,
        }
    }

    /// Device this queue belongs to
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Device class descriptor
    pub fn class(&self) -> &DeviceClass {
        &self.config.class
    }

    /// Current latency tunables
    pub fn tunables(&self) -> ElevatorTunables {
        self.config.tunables
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no request is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether dispatch is being held back
    pub fn is_plugged(&self) -> bool {
        self.plugged
    }

    /// Counters
    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    pub(crate) fn driver(&self) -> Arc<dyn BlockDriver> {
        Arc::clone(&self.driver)
    }

    /// Add `handle` to the queue.
    ///
    /// The first request into an empty queue plugs it so that submissions
    /// arriving right behind can merge before the driver sees anything.
    /// Returns whether the caller must dispatch now.
    pub(crate) fn enqueue(&mut self, pool: &mut RequestPool, handle: RequestHandle) -> bool {
        let was_empty = self.pending.is_empty();
        let outcome = elevator::insert(self, pool, handle);
        self.stats.record_queued();
        self.verify(pool);

        if outcome.starved {
            self.stats.forced_dispatches += 1;
            self.plugged = false;
            return true;
        }
        if self.config.class.always_dispatch() {
            return true;
        }
        if was_empty {
            self.plugged = true;
            return false;
        }
        false
    }

    /// Remove a finished request from the pending list
    pub(crate) fn remove(&mut self, handle: RequestHandle) {
        match self.pending.iter().position(|&h| h == handle) {
            Some(index) => {
                self.pending.remove(index);
            }
            None => blk_fatal!("finished request {:?} is not pending on {}", handle, self.id),
        }
    }

    /// Head request for the driver, marked as started
    pub(crate) fn fetch_head(&mut self, pool: &mut RequestPool) -> Option<RequestInfo> {
        if self.plugged {
            return None;
        }
        let handle = *self.pending.first()?;
        let request = pool.expect_mut(handle);
        request.started = true;
        Some(request.info(handle))
    }

    /// Snapshot of the pending list
    pub(crate) fn snapshot(&self, pool: &RequestPool) -> Vec<RequestInfo> {
        self.pending.iter().map(|&h| pool.expect(h).info(h)).collect()
    }

    /// Check queue consistency; any violation is fatal.
    ///
    /// Only runs with the `debug_subsystems` feature; the checks walk the
    /// whole list on every mutation.
    pub(crate) fn verify(&self, pool: &RequestPool) {
        if !cfg!(feature = "debug_subsystems") {
            return;
        }
        let mut seen_unstarted = false;
        for &handle in &self.pending {
            let request = pool.expect(handle);
            if request.device != self.id {
                blk_fatal!("request {:?} for {} queued on {}", handle, request.device, self.id);
            }
            if request.started && seen_unstarted {
                blk_fatal!("started request {:?} behind unstarted work on {}", handle, self.id);
            }
            seen_unstarted |= !request.started;
            if request.nr_sectors > self.config.max_sectors && request.sub_buffers() > 1 {
                blk_fatal!("merged request {:?} exceeds {} sectors", handle, self.config.max_sectors);
            }
        }
    }
}
