//! Request and sub-buffer representation
//!
//! A [`Request`] is the unit the elevator orders and a driver transfers. It
//! starts as a single submission and grows as adjacent submissions merge
//! into it; each merged submission stays a separate [`SubBuffer`] so that it
//! gets its own completion.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::types::{CompletionFn, DeviceId, Direction, IoCompletion, IoStatus, MemoryExtent, SECTOR_SIZE, Submission};

/// Generation-checked reference to a request slot.
///
/// The generation changes every time the slot is released, so a handle kept
/// past completion can never reach the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl RequestHandle {
    /// Slot index in the pool
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Slot generation this handle was issued for
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// One submission's contribution to a request
pub struct SubBuffer {
    /// First sector
    pub sector: u64,
    /// Number of sectors
    pub sectors: u32,
    /// Caller memory
    pub memory: MemoryExtent,
    on_complete: Option<CompletionFn>,
}

impl SubBuffer {
    pub(crate) fn from_submission(submission: Submission) -> Self {
        Self {
            sector: submission.sector,
            sectors: submission.sectors,
            memory: submission.memory,
            on_complete: submission.on_complete,
        }
    }

    /// One past the last sector
    pub fn end_sector(&self) -> u64 {
        self.sector + self.sectors as u64
    }

    /// Take the callback together with its completion record
    pub(crate) fn into_completion(self, status: IoStatus) -> Option<(CompletionFn, IoCompletion)> {
        let transferred = if status.is_ok() { self.sectors } else { 0 };
        let completion = IoCompletion { sector: self.sector, sectors: self.sectors, transferred, status };
        self.on_complete.map(|callback| (callback, completion))
    }
}

/// Wakes a caller blocked in a synchronous submission
#[derive(Debug, Default)]
pub struct SyncSignal {
    done: AtomicBool,
    status: Mutex<Option<IoStatus>>,
}

impl SyncSignal {
    /// Create an unsignalled handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the status of the request's sub-buffer
    pub fn record(&self, status: IoStatus) {
        let mut slot = self.status.lock();
        // A failure anywhere in the request wins over later successes.
        if !matches!(*slot, Some(IoStatus::Failed)) {
            *slot = Some(status);
        }
    }

    /// Mark the request finished
    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Whether the request has finished
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Final status, once finished
    pub fn status(&self) -> Option<IoStatus> {
        if self.is_done() { *self.status.lock() } else { None }
    }
}

/// An admitted, possibly merged, transfer
pub struct Request {
    /// Target device
    pub device: DeviceId,
    /// Queued direction, always `Read` or `Write`
    pub direction: Direction,
    /// Next sector to transfer
    pub sector: u64,
    /// Sectors left in the whole request
    pub nr_sectors: u32,
    /// Sectors left in the front sub-buffer
    pub current_sectors: u32,
    /// Memory left in the front sub-buffer
    pub buffer: MemoryExtent,
    /// Discontiguous memory extents across the chain
    pub segments: u32,
    /// Insertions this request may still tolerate before it must be serviced
    pub credit: u32,
    /// A driver has fetched this request
    pub started: bool,
    pub(crate) chain: VecDeque<SubBuffer>,
    pub(crate) waiter: Option<Arc<SyncSignal>>,
}

impl Request {
    /// Build a request holding a single submission
    pub(crate) fn new(device: DeviceId, direction: Direction, submission: Submission) -> Self {
        let sub = SubBuffer::from_submission(submission);
        let (sector, sectors, memory) = (sub.sector, sub.sectors, sub.memory);
        let mut chain = VecDeque::with_capacity(4);
        chain.push_back(sub);
        Request {
            device,
            direction: direction.base(),
            sector,
            nr_sectors: sectors,
            current_sectors: sectors,
            buffer: memory,
            segments: 1,
            credit: 0,
            started: false,
            chain,
            waiter: None,
        }
    }

    /// One past the last sector
    pub fn end_sector(&self) -> u64 {
        self.sector + self.nr_sectors as u64
    }

    /// Number of sub-buffers still chained
    pub fn sub_buffers(&self) -> usize {
        self.chain.len()
    }

    /// Whether a synchronous waiter owns this request
    pub fn has_waiter(&self) -> bool {
        self.waiter.is_some()
    }

    /// Append a sub-buffer that starts at `end_sector`
    pub(crate) fn push_back(&mut self, sub: SubBuffer) {
        let contiguous = self.chain.back().is_some_and(|tail| tail.memory.precedes(&sub.memory));
        if !contiguous {
            self.segments += 1;
        }
        self.nr_sectors += sub.sectors;
        self.chain.push_back(sub);
    }

    /// Prepend a sub-buffer that ends at `sector` and make it current
    pub(crate) fn push_front(&mut self, sub: SubBuffer) {
        let contiguous = self.chain.front().is_some_and(|head| sub.memory.precedes(&head.memory));
        if !contiguous {
            self.segments += 1;
        }
        self.sector = sub.sector;
        self.nr_sectors += sub.sectors;
        self.current_sectors = sub.sectors;
        self.buffer = sub.memory;
        self.chain.push_front(sub);
    }

    /// Move every sub-buffer of `next`, which starts at `end_sector`, to the tail
    pub(crate) fn absorb(&mut self, mut next: Request) {
        let contiguous = match (self.chain.back(), next.chain.front()) {
            (Some(tail), Some(head)) => tail.memory.precedes(&head.memory),
            _ => false,
        };
        self.segments += next.segments;
        if contiguous {
            self.segments -= 1;
        }
        self.nr_sectors += next.nr_sectors;
        self.credit = self.credit.min(next.credit);
        self.chain.append(&mut next.chain);
    }

    /// Segment count after appending `memory` at the tail
    pub(crate) fn segments_after_push_back(&self, memory: &MemoryExtent) -> u32 {
        match self.chain.back() {
            Some(tail) if tail.memory.precedes(memory) => self.segments,
            _ => self.segments + 1,
        }
    }

    /// Segment count after prepending `memory` at the head
    pub(crate) fn segments_after_push_front(&self, memory: &MemoryExtent) -> u32 {
        match self.chain.front() {
            Some(head) if memory.precedes(&head.memory) => self.segments,
            _ => self.segments + 1,
        }
    }

    /// Segment count after absorbing `next`
    pub(crate) fn segments_after_absorb(&self, next: &Request) -> u32 {
        match (self.chain.back(), next.chain.front()) {
            (Some(tail), Some(head)) if tail.memory.precedes(&head.memory) => self.segments + next.segments - 1,
            _ => self.segments + next.segments,
        }
    }

    /// Record partial progress inside the front sub-buffer
    pub(crate) fn advance(&mut self, sectors: u32) {
        self.sector += sectors as u64;
        self.nr_sectors -= sectors;
        self.current_sectors -= sectors;
        self.buffer = self.buffer.advance(sectors as usize * SECTOR_SIZE);
    }

    /// Detach the front sub-buffer and point the cursor at the next one.
    ///
    /// The remaining sectors of the front sub-buffer are dropped whether or
    /// not they were transferred, so the request skips exactly to the next
    /// sub-buffer boundary.
    pub(crate) fn pop_front(&mut self) -> Option<SubBuffer> {
        let sub = self.chain.pop_front()?;
        self.sector += self.current_sectors as u64;
        self.nr_sectors -= self.current_sectors;
        if let Some(next) = self.chain.front() {
            self.current_sectors = next.sectors;
            self.buffer = next.memory;
            if !sub.memory.precedes(&next.memory) {
                self.segments -= 1;
            }
        } else {
            self.current_sectors = 0;
            self.buffer = MemoryExtent::new(self.buffer.end(), 0);
            self.segments = 0;
        }
        Some(sub)
    }

    /// Snapshot for drivers and diagnostics
    pub fn info(&self, handle: RequestHandle) -> RequestInfo {
        RequestInfo {
            handle,
            device: self.device,
            direction: self.direction,
            sector: self.sector,
            nr_sectors: self.nr_sectors,
            current_sectors: self.current_sectors,
            buffer: self.buffer,
            segments: self.segments,
            sub_buffers: self.chain.len(),
            credit: self.credit,
            started: self.started,
        }
    }
}

/// Copy of a request's state handed out of the subsystem lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestInfo {
    /// Handle to pass back to completion calls
    pub handle: RequestHandle,
    /// Target device
    pub device: DeviceId,
    /// `Read` or `Write`
    pub direction: Direction,
    /// Next sector to transfer
    pub sector: u64,
    /// Sectors left in the request
    pub nr_sectors: u32,
    /// Sectors left in the current sub-buffer
    pub current_sectors: u32,
    /// Memory for the current sub-buffer
    pub buffer: MemoryExtent,
    /// Discontiguous memory extents
    pub segments: u32,
    /// Chained sub-buffers
    pub sub_buffers: usize,
    /// Remaining starvation credit
    pub credit: u32,
    /// Fetched by the driver
    pub started: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(sector: u64, sectors: u32, addr: usize) -> SubBuffer {
        SubBuffer::from_submission(Submission::detached(
            sector,
            sectors,
            MemoryExtent::new(addr, sectors as usize * SECTOR_SIZE),
        ))
    }

    fn request(sector: u64, sectors: u32, addr: usize) -> Request {
        Request::new(
            DeviceId::new(3, 0),
            Direction::ReadAhead,
            Submission::detached(sector, sectors, MemoryExtent::new(addr, sectors as usize * SECTOR_SIZE)),
        )
    }

    #[test]
    fn test_new_request_uses_base_direction() {
        let req = request(0, 8, 0x1000);
        assert_eq!(req.direction, Direction::Read);
        assert_eq!(req.segments, 1);
        assert_eq!(req.current_sectors, 8);
    }

    #[test]
    fn test_push_back_contiguous_keeps_segments() {
        let mut req = request(0, 8, 0x1000);
        req.push_back(sub(8, 8, 0x2000));
        assert_eq!(req.segments, 1);
        req.push_back(sub(16, 8, 0x9000));
        assert_eq!(req.segments, 2);
        assert_eq!(req.nr_sectors, 24);
        assert_eq!(req.end_sector(), 24);
    }

    #[test]
    fn test_push_front_moves_cursor() {
        let mut req = request(8, 8, 0x2000);
        req.push_front(sub(0, 8, 0x1000));
        assert_eq!(req.sector, 0);
        assert_eq!(req.current_sectors, 8);
        assert_eq!(req.buffer.addr, 0x1000);
        assert_eq!(req.segments, 1);
    }

    #[test]
    fn test_pop_front_skips_to_boundary() {
        let mut req = request(0, 8, 0x1000);
        req.push_back(sub(8, 4, 0x8000));
        req.advance(3);
        assert_eq!(req.sector, 3);
        assert_eq!(req.current_sectors, 5);

        let first = req.pop_front().unwrap();
        assert_eq!(first.sector, 0);
        assert_eq!(req.sector, 8);
        assert_eq!(req.nr_sectors, 4);
        assert_eq!(req.current_sectors, 4);
        assert_eq!(req.segments, 1);

        req.pop_front().unwrap();
        assert_eq!(req.nr_sectors, 0);
        assert!(req.pop_front().is_none());
    }

    #[test]
    fn test_absorb_takes_lower_credit() {
        let mut a = request(0, 8, 0x1000);
        a.credit = 5;
        let mut b = request(8, 8, 0x2000);
        b.credit = 2;
        assert_eq!(a.segments_after_absorb(&b), 1);
        a.absorb(b);
        assert_eq!(a.credit, 2);
        assert_eq!(a.nr_sectors, 16);
        assert_eq!(a.sub_buffers(), 2);
    }

    #[test]
    fn test_sync_signal_keeps_failure() {
        let signal = SyncSignal::new();
        signal.record(IoStatus::Failed);
        signal.record(IoStatus::Done);
        assert_eq!(signal.status(), None);
        signal.complete();
        assert_eq!(signal.status(), Some(IoStatus::Failed));
    }
}
