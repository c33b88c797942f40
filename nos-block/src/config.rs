//! Block layer and per-device configuration

use crate::error::{BlockError, Result};
use crate::types::Direction;

/// Default number of request slots shared by all devices
pub const DEFAULT_NR_REQUESTS: usize = 64;

/// Default bound on sectors per merged request
pub const DEFAULT_MAX_SECTORS: u32 = 128;

/// Default bound on discontiguous memory extents per request
pub const DEFAULT_MAX_SEGMENTS: u32 = 64;

/// Default number of insertions a pending read tolerates
pub const DEFAULT_READ_LATENCY: u32 = 128;

/// Default number of insertions a pending write tolerates
pub const DEFAULT_WRITE_LATENCY: u32 = 8192;

bitflags::bitflags! {
    /// Behaviour switches of a device class
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u8 {
        /// The driver works on the head request in place; once started it
        /// must not be merged into or reordered
        const OWNS_HEAD_WHILE_PROCESSING = 0b0000_0001;
        /// Batching gains nothing; dispatch on every insertion
        const ALWAYS_DISPATCH_ON_INSERT = 0b0000_0010;
    }
}

/// Capability descriptor of a device class, fixed at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceClass {
    /// Behaviour switches
    pub flags: ClassFlags,
    /// The driver consumes this many slots per I/O internally, so the
    /// allocation search limit is divided by it
    pub slot_budget_divisor: usize,
}

impl DeviceClass {
    /// Disk-like device: head owned while processing, batched dispatch
    pub const DISK: DeviceClass =
        DeviceClass { flags: ClassFlags::OWNS_HEAD_WHILE_PROCESSING, slot_budget_divisor: 1 };

    /// Device whose driver re-reads the head on every step
    pub const SIMPLE: DeviceClass = DeviceClass { flags: ClassFlags::empty(), slot_budget_divisor: 1 };

    /// Host-adapter device that takes requests off the queue itself and
    /// needs a second slot per command
    pub const HOST_ADAPTER: DeviceClass = DeviceClass {
        flags: ClassFlags::OWNS_HEAD_WHILE_PROCESSING.union(ClassFlags::ALWAYS_DISPATCH_ON_INSERT),
        slot_budget_divisor: 2,
    };

    /// Whether a started head is off-limits for merging
    pub fn owns_head(&self) -> bool {
        self.flags.contains(ClassFlags::OWNS_HEAD_WHILE_PROCESSING)
    }

    /// Whether every insertion dispatches
    pub fn always_dispatch(&self) -> bool {
        self.flags.contains(ClassFlags::ALWAYS_DISPATCH_ON_INSERT)
    }
}

impl Default for DeviceClass {
    fn default() -> Self {
        DeviceClass::DISK
    }
}

/// Subsystem-wide configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayerConfig {
    /// Number of request slots in the pool
    pub nr_requests: usize,
}

impl Default for BlockLayerConfig {
    fn default() -> Self {
        Self { nr_requests: DEFAULT_NR_REQUESTS }
    }
}

impl BlockLayerConfig {
    /// Check the configuration before building a block layer
    pub fn validate(&self) -> Result<()> {
        if self.nr_requests == 0 {
            return Err(BlockError::InvalidArgument("request pool must hold at least one slot"));
        }
        if self.nr_requests > u32::MAX as usize {
            return Err(BlockError::InvalidArgument("request pool too large"));
        }
        Ok(())
    }
}

/// Starvation bounds of a device, in insertions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElevatorTunables {
    /// Credit stamped on new reads
    pub read_latency: u32,
    /// Credit stamped on new writes
    pub write_latency: u32,
}

impl ElevatorTunables {
    /// Credit for a new request of the given direction
    pub fn latency_for(&self, direction: Direction) -> u32 {
        if direction.is_write() { self.write_latency } else { self.read_latency }
    }

    /// Build tunables from user-supplied values, rejecting negatives
    pub fn from_signed(read_latency: i64, write_latency: i64) -> Result<Self> {
        if read_latency < 0 || write_latency < 0 {
            return Err(BlockError::InvalidArgument("elevator latency must not be negative"));
        }
        let read_latency = u32::try_from(read_latency)
            .map_err(|_| BlockError::InvalidArgument("read latency too large"))?;
        let write_latency = u32::try_from(write_latency)
            .map_err(|_| BlockError::InvalidArgument("write latency too large"))?;
        Ok(Self { read_latency, write_latency })
    }
}

impl Default for ElevatorTunables {
    fn default() -> Self {
        Self { read_latency: DEFAULT_READ_LATENCY, write_latency: DEFAULT_WRITE_LATENCY }
    }
}

/// Static description of a device handed over at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Maximum sectors in one request
    pub max_sectors: u32,
    /// Maximum discontiguous memory extents in one request
    pub max_segments: u32,
    /// Starvation bounds
    pub tunables: ElevatorTunables,
    /// Device size in sectors
    pub extent_sectors: u64,
    /// Device class behaviour
    pub class: DeviceClass,
}

impl DeviceConfig {
    /// Configuration with default limits for a device of `extent_sectors`
    pub fn new(extent_sectors: u64) -> Self {
        Self {
            max_sectors: DEFAULT_MAX_SECTORS,
            max_segments: DEFAULT_MAX_SEGMENTS,
            tunables: ElevatorTunables::default(),
            extent_sectors,
            class: DeviceClass::default(),
        }
    }

    /// Set the merge limits
    pub fn with_limits(mut self, max_sectors: u32, max_segments: u32) -> Self {
        self.max_sectors = max_sectors;
        self.max_segments = max_segments;
        self
    }

    /// Set the read and write latency credits
    pub fn with_latency(mut self, read_latency: u32, write_latency: u32) -> Self {
        self.tunables = ElevatorTunables { read_latency, write_latency };
        self
    }

    /// Set the device class
    pub fn with_class(mut self, class: DeviceClass) -> Self {
        self.class = class;
        self
    }

    /// Check limits before registration
    pub fn validate(&self) -> Result<()> {
        if self.max_sectors == 0 {
            return Err(BlockError::InvalidArgument("max_sectors must be non-zero"));
        }
        if self.max_segments == 0 {
            return Err(BlockError::InvalidArgument("max_segments must be non-zero"));
        }
        if self.class.slot_budget_divisor == 0 {
            return Err(BlockError::InvalidArgument("slot budget divisor must be non-zero"));
        }
        Ok(())
    }
}

/// How many pool slots a submission may search.
///
/// Reads may use the whole pool. Writes stop at two thirds so a burst of
/// writes always leaves slots for readers. Classes that spend two slots per
/// command get their share divided again.
pub fn search_limit(pool_size: usize, direction: Direction, class: &DeviceClass) -> usize {
    let base = if direction.is_write() { pool_size * 2 / 3 } else { pool_size };
    (base / class.slot_budget_divisor.max(1)).max(1)
}
