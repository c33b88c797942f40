//! Error types for the block layer

use core::fmt;

use crate::types::DeviceId;

/// Errors reported to callers and drivers of the block layer.
///
/// Invariant violations inside the subsystem are not represented here; they
/// halt through [`blk_fatal!`](crate::blk_fatal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// No queue is registered for the device
    NoDevice(DeviceId),
    /// The sector range ends beyond the device extent
    OutOfRange {
        /// First sector of the rejected range
        sector: u64,
        /// Number of sectors requested
        sectors: u32,
        /// Device size in sectors
        extent: u64,
    },
    /// Write submitted to a read-only device
    ReadOnly(DeviceId),
    /// Malformed argument
    InvalidArgument(&'static str),
    /// Device already registered, or still has pending requests
    Busy(DeviceId),
    /// Handle refers to a request slot that has since been released
    StaleRequest,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::NoDevice(dev) => write!(f, "No such device: {}", dev),
            BlockError::OutOfRange { sector, sectors, extent } => write!(
                f,
                "Access beyond end of device: sector {} + {} > {}",
                sector, sectors, extent
            ),
            BlockError::ReadOnly(dev) => write!(f, "Can't write to read-only device {}", dev),
            BlockError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            BlockError::Busy(dev) => write!(f, "Device busy: {}", dev),
            BlockError::StaleRequest => write!(f, "Stale request handle"),
        }
    }
}

/// Result type for block layer operations
pub type Result<T> = core::result::Result<T, BlockError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_display_out_of_range() {
        let err = BlockError::OutOfRange { sector: 100, sectors: 8, extent: 104 };
        assert_eq!(err.to_string(), "Access beyond end of device: sector 100 + 8 > 104");
    }

    #[test]
    fn test_display_device() {
        let err = BlockError::ReadOnly(DeviceId::new(3, 1));
        assert_eq!(err.to_string(), "Can't write to read-only device 3:1");
    }
}
