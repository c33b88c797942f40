//! Core types shared by every block layer component

use alloc::boxed::Box;
use core::fmt;

use static_assertions::const_assert;

use crate::error::BlockError;

/// Sector size in bytes
pub const SECTOR_SIZE: usize = 512;

/// log2 of [`SECTOR_SIZE`]
pub const SECTOR_SHIFT: u32 = 9;

const_assert!(SECTOR_SIZE.is_power_of_two());
const_assert!(1usize << SECTOR_SHIFT == SECTOR_SIZE);

/// Block device identifier (major, minor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId {
    /// Driver class number
    pub major: u16,
    /// Unit within the driver class
    pub minor: u16,
}

impl DeviceId {
    /// Create a device identifier
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Transfer direction of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Read, blocks for a request slot if the pool is exhausted
    Read,
    /// Write, blocks for a request slot if the pool is exhausted
    Write,
    /// Speculative read, dropped instead of blocking
    ReadAhead,
    /// Speculative write, dropped instead of blocking
    WriteAhead,
}

impl Direction {
    /// The direction a request is queued under.
    ///
    /// Read-ahead and write-ahead only change the allocation policy; once
    /// admitted they merge and sort with plain reads and writes.
    pub const fn base(self) -> Direction {
        match self {
            Direction::Read | Direction::ReadAhead => Direction::Read,
            Direction::Write | Direction::WriteAhead => Direction::Write,
        }
    }

    /// Whether this submission is dropped rather than blocked on pool exhaustion
    pub const fn is_ahead(self) -> bool {
        matches!(self, Direction::ReadAhead | Direction::WriteAhead)
    }

    /// Whether data moves to the device
    pub const fn is_write(self) -> bool {
        matches!(self, Direction::Write | Direction::WriteAhead)
    }
}

/// Memory backing one sub-buffer.
///
/// The block layer only records where the caller's memory lives; it never
/// dereferences it. Drivers translate the extent into DMA descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryExtent {
    /// Start address
    pub addr: usize,
    /// Length in bytes
    pub len: usize,
}

impl MemoryExtent {
    /// Create a memory extent
    pub const fn new(addr: usize, len: usize) -> Self {
        Self { addr, len }
    }

    /// One past the last byte
    pub const fn end(&self) -> usize {
        self.addr + self.len
    }

    /// Whether `next` starts exactly where this extent ends
    pub const fn precedes(&self, next: &MemoryExtent) -> bool {
        self.end() == next.addr
    }

    /// Drop the first `bytes` bytes
    pub const fn advance(&self, bytes: usize) -> MemoryExtent {
        MemoryExtent { addr: self.addr + bytes, len: self.len - bytes }
    }
}

/// Final status of one sub-buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// All sectors transferred
    Done,
    /// The device failed the transfer
    Failed,
    /// Read-ahead or write-ahead dropped because no request slot was free
    Dropped,
    /// Refused at admission, nothing was queued
    Rejected(BlockError),
}

impl IoStatus {
    /// Whether the data is valid
    pub const fn is_ok(&self) -> bool {
        matches!(self, IoStatus::Done)
    }
}

/// Delivered to a submission's callback exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCompletion {
    /// First sector of the submission
    pub sector: u64,
    /// Sectors covered by the submission
    pub sectors: u32,
    /// Sectors actually moved; zero unless `status` is `Done`
    pub transferred: u32,
    /// Outcome
    pub status: IoStatus,
}

/// Completion callback of a submission
pub type CompletionFn = Box<dyn FnOnce(IoCompletion) + Send>;

/// One caller's request for a contiguous sector range
pub struct Submission {
    /// First sector
    pub sector: u64,
    /// Number of sectors
    pub sectors: u32,
    /// Caller-owned memory for the transfer
    pub memory: MemoryExtent,
    /// Invoked once the sub-buffer completes, fails, or is refused
    pub on_complete: Option<CompletionFn>,
}

impl Submission {
    /// Create a submission with a completion callback
    pub fn new<F>(sector: u64, sectors: u32, memory: MemoryExtent, on_complete: F) -> Self
    where
        F: FnOnce(IoCompletion) + Send + 'static,
    {
        Self { sector, sectors, memory, on_complete: Some(Box::new(on_complete)) }
    }

    /// Create a submission nobody waits on
    pub fn detached(sector: u64, sectors: u32, memory: MemoryExtent) -> Self {
        Self { sector, sectors, memory, on_complete: None }
    }

    /// One past the last sector
    pub fn end_sector(&self) -> u64 {
        self.sector + self.sectors as u64
    }

    /// Deliver a completion that moved no data
    pub(crate) fn finish_untransferred(self, status: IoStatus) {
        if let Some(callback) = self.on_complete {
            callback(IoCompletion { sector: self.sector, sectors: self.sectors, transferred: 0, status });
        }
    }
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("sector", &self.sector)
            .field("sectors", &self.sectors)
            .field("memory", &self.memory)
            .field("has_callback", &self.on_complete.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_base() {
        assert_eq!(Direction::ReadAhead.base(), Direction::Read);
        assert_eq!(Direction::WriteAhead.base(), Direction::Write);
        assert!(Direction::WriteAhead.is_write());
        assert!(!Direction::Read.is_ahead());
    }

    #[test]
    fn test_memory_extent_contiguity() {
        let a = MemoryExtent::new(0x1000, 0x200);
        let b = MemoryExtent::new(0x1200, 0x200);
        assert!(a.precedes(&b));
        assert!(!b.precedes(&a));
        assert_eq!(a.advance(0x100), MemoryExtent::new(0x1100, 0x100));
    }
}
