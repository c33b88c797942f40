//! Unified logging support for nos-block
//!
//! The block layer runs in contexts where a logger may not exist yet
//! (early boot, interrupt handlers), so every log statement goes through
//! these macros and compiles away when the `log` feature is disabled.

/// Unified trace-level logging
#[macro_export]
macro_rules! blk_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::trace!($($arg)*);
    }
}

/// Unified debug-level logging
#[macro_export]
macro_rules! blk_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::debug!($($arg)*);
    }
}

/// Unified info-level logging
#[macro_export]
macro_rules! blk_info {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::info!($($arg)*);
    }
}

/// Unified warn-level logging
#[macro_export]
macro_rules! blk_warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::warn!($($arg)*);
    }
}

/// Unified error-level logging
#[macro_export]
macro_rules! blk_error {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::error!($($arg)*);
    }
}

/// Report a broken scheduler invariant and halt.
///
/// Invariant violations mean the block layer itself is corrupt; continuing
/// would hand a driver a request that may alias another caller's memory.
#[macro_export]
macro_rules! blk_fatal {
    ($($arg:tt)*) => {{
        $crate::blk_error!($($arg)*);
        panic!($($arg)*)
    }}
}
