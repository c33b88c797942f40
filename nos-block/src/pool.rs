//! Request slot pool
//!
//! A fixed array of request slots shared by every device. Slots are handed
//! out as generation-checked [`RequestHandle`]s; releasing a slot bumps its
//! generation so stale handles are detected instead of aliasing the next
//! request placed in the slot.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::blk_fatal;
use crate::request::{Request, RequestHandle};

/// Request pool statistics.
///
/// Tracks usage and capacity information for the request pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of slots in the pool.
    pub total_slots: usize,
    /// Number of slots currently active.
    pub active_slots: usize,
    /// Number of free slots.
    pub free_slots: usize,
    /// Highest number of simultaneously active slots.
    pub peak_active: usize,
    /// Number of allocations that found no free slot within their limit.
    pub failed_allocations: u64,
    /// Number of slots released so far.
    pub releases: u64,
}

struct Slot {
    generation: u32,
    request: Option<Request>,
}

/// Fixed-capacity arena of request slots
pub struct RequestPool {
    slots: Vec<Slot>,
    /// Number of active slots
    active: usize,
    /// Index of the last successful allocation; the next search starts here
    last_found: usize,
    peak_active: usize,
    failed_allocations: u64,
    /// Bumped on every release; blocked allocators sleep until it moves
    releases: Arc<AtomicU64>,
}

impl RequestPool {
    /// Create a pool of `nr_slots` free slots
    pub fn new(nr_slots: usize) -> Self {
        let mut slots = Vec::with_capacity(nr_slots);
        slots.resize_with(nr_slots, || Slot { generation: 0, request: None });
        Self {
            slots,
            active: 0,
            last_found: nr_slots,
            peak_active: 0,
            failed_allocations: 0,
            releases: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Place `request` in the first free slot among the first
    /// `search_limit` slots.
    ///
    /// The search begins at the last successful index, walks downward and
    /// wraps within the limit, visiting each candidate once. On failure the
    /// request is handed back so the caller can retry or drop it.
    pub fn allocate(&mut self, request: Request, search_limit: usize) -> Result<RequestHandle, Request> {
        let limit = search_limit.min(self.slots.len());
        if limit == 0 {
            self.failed_allocations += 1;
            return Err(request);
        }
        let start = self.last_found.min(limit - 1);
        for step in 0..limit {
            let index = (start + limit - step) % limit;
            let slot = &mut self.slots[index];
            if slot.request.is_none() {
                slot.request = Some(request);
                let generation = slot.generation;
                self.last_found = index;
                self.active += 1;
                if self.active > self.slots.len() {
                    blk_fatal!("request pool overflow: {} active of {}", self.active, self.slots.len());
                }
                self.peak_active = self.peak_active.max(self.active);
                return Ok(RequestHandle { index: index as u32, generation });
            }
        }
        self.failed_allocations += 1;
        Err(request)
    }

    /// Free the slot behind `handle` and return its request.
    ///
    /// Releasing a free slot or a handle from an earlier generation means
    /// two owners believed they held the same request; that is fatal.
    pub fn release(&mut self, handle: RequestHandle) -> Request {
        let Some(slot) = self.slots.get_mut(handle.index()) else {
            blk_fatal!("release of out-of-range request slot {}", handle.index());
        };
        if slot.generation != handle.generation {
            blk_fatal!(
                "double release of request slot {} (generation {} now {})",
                handle.index(),
                handle.generation,
                slot.generation
            );
        }
        let Some(request) = slot.request.take() else {
            blk_fatal!("release of free request slot {}", handle.index());
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.active -= 1;
        self.releases.fetch_add(1, Ordering::Release);
        request
    }

    /// Whether `handle` still names an active request
    pub fn contains(&self, handle: RequestHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Look up an active request
    pub fn get(&self, handle: RequestHandle) -> Option<&Request> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.request.as_ref())
    }

    /// Look up an active request for mutation
    pub fn get_mut(&mut self, handle: RequestHandle) -> Option<&mut Request> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.request.as_mut())
    }

    /// Look up a request the caller knows to be active.
    ///
    /// Pending lists only hold live handles, so a miss here is corruption.
    pub(crate) fn expect(&self, handle: RequestHandle) -> &Request {
        match self.get(handle) {
            Some(request) => request,
            None => blk_fatal!("queued handle {:?} refers to a free slot", handle),
        }
    }

    /// Mutable variant of [`RequestPool::expect`]
    pub(crate) fn expect_mut(&mut self, handle: RequestHandle) -> &mut Request {
        match self.get_mut(handle) {
            Some(request) => request,
            None => blk_fatal!("queued handle {:?} refers to a free slot", handle),
        }
    }

    /// Counter bumped on every release
    pub fn release_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.releases)
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of active slots
    pub fn active(&self) -> usize {
        self.active
    }

    /// Check if no slot is active
    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Check if every slot is active
    pub fn is_full(&self) -> bool {
        self.active == self.slots.len()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_slots: self.slots.len(),
            active_slots: self.active,
            free_slots: self.slots.len() - self.active,
            peak_active: self.peak_active,
            failed_allocations: self.failed_allocations,
            releases: self.releases.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceId, Direction, MemoryExtent, Submission};

    fn request(sector: u64) -> Request {
        Request::new(
            DeviceId::new(8, 0),
            Direction::Read,
            Submission::detached(sector, 1, MemoryExtent::new(0x1000, 512)),
        )
    }

    #[test]
    fn test_request_pool() {
        let mut pool = RequestPool::new(4);
        assert!(pool.is_empty());

        let a = pool.allocate(request(0), 4).ok().unwrap();
        let b = pool.allocate(request(1), 4).ok().unwrap();
        let c = pool.allocate(request(2), 4).ok().unwrap();
        assert_ne!(a.index(), b.index());
        assert_ne!(b.index(), c.index());
        assert_eq!(pool.stats().active_slots, 3);

        let released = pool.release(b);
        assert_eq!(released.sector, 1);
        assert_eq!(pool.stats().active_slots, 2);
        assert!(!pool.contains(b));

        let d = pool.allocate(request(3), 4).ok().unwrap();
        assert!(pool.contains(d));
        assert_eq!(pool.stats().releases, 1);
    }

    #[test]
    fn test_search_starts_below_last_found() {
        let mut pool = RequestPool::new(8);
        let first = pool.allocate(request(0), 8).ok().unwrap();
        assert_eq!(first.index(), 7);
        let second = pool.allocate(request(1), 8).ok().unwrap();
        assert_eq!(second.index(), 6);
    }

    #[test]
    fn test_search_limit_bounds_slots() {
        let mut pool = RequestPool::new(6);
        let mut handles = Vec::new();
        for sector in 0..4 {
            let handle = pool.allocate(request(sector), 4).ok().unwrap();
            assert!(handle.index() < 4);
            handles.push(handle);
        }
        // The first four slots are taken; a limited search must fail even
        // though slots 4 and 5 are free.
        let refused = pool.allocate(request(9), 4);
        assert_eq!(refused.err().map(|r| r.sector), Some(9));
        assert_eq!(pool.stats().failed_allocations, 1);
        assert!(pool.allocate(request(10), 6).is_ok());
    }

    #[test]
    fn test_stale_handle_misses() {
        let mut pool = RequestPool::new(2);
        let handle = pool.allocate(request(0), 2).ok().unwrap();
        pool.release(handle);
        let reused = pool.allocate(request(5), 2).ok().unwrap();
        assert_eq!(reused.index(), handle.index());
        assert!(pool.get(handle).is_none());
        assert_eq!(pool.get(reused).map(|r| r.sector), Some(5));
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn test_double_release_is_fatal() {
        let mut pool = RequestPool::new(2);
        let handle = pool.allocate(request(0), 2).ok().unwrap();
        pool.release(handle);
        pool.release(handle);
    }
}
