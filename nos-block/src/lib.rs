//! NOS Block Layer
//!
//! This crate provides request queueing and elevator scheduling for NOS block
//! devices. It sits between callers that read and write 512-byte sectors and
//! the drivers that move the data.
//!
//! # Architecture
//!
//! The block layer is organized into the following components:
//!
//! - **Pool**: fixed set of request slots shared by all devices
//! - **Merge**: folds adjacent submissions into queued requests
//! - **Elevator**: orders pending requests by sector with a starvation bound
//! - **Queue**: per-device pending list, plugging and the driver boundary
//! - **Completion**: per-sub-buffer completion and slot recycling
//! - **Irq**: interrupt masking around the subsystem lock
//! - **Layer**: the [`BlockLayer`] facade and its subsystem lock
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use nos_block::{
//!     BlockDriver, BlockLayer, BlockLayerConfig, DeviceConfig, DeviceId, Direction, MemoryExtent,
//!     SpinSleeper, Submission,
//! };
//!
//! /// Completes every request as soon as it is dispatched
//! struct Instant;
//!
//! impl BlockDriver for Instant {
//!     fn request(&self, layer: &BlockLayer, device: DeviceId) {
//!         while let Ok(Some(head)) = layer.current_request(device) {
//!             layer.end_request(head.handle, true).unwrap();
//!         }
//!     }
//! }
//!
//! let layer = BlockLayer::new(BlockLayerConfig::default(), Arc::new(SpinSleeper::new())).unwrap();
//! let disk = DeviceId::new(3, 0);
//! layer.register_device(disk, DeviceConfig::new(2048), Arc::new(Instant)).unwrap();
//!
//! let sub = Submission::new(0, 8, MemoryExtent::new(0x10_0000, 4096), |done| assert!(done.status.is_ok()));
//! layer.submit(disk, Direction::Read, sub).unwrap();
//! layer.unplug_all();
//! assert_eq!(layer.pool_stats().active_slots, 0);
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod logging;

pub mod completion;
pub mod config;
pub mod elevator;
pub mod error;
pub mod irq;
pub mod layer;
pub mod merge;
pub mod pool;
pub mod queue;
pub mod request;
pub mod sleep;
pub mod types;

// Re-export commonly used types
pub use completion::Completion;
pub use config::{BlockLayerConfig, ClassFlags, DeviceClass, DeviceConfig, ElevatorTunables};
pub use error::{BlockError, Result};
pub use irq::{CountingIrq, IrqControl, NoIrq};
pub use layer::{BlockLayer, SubmitOutcome};
pub use pool::PoolStats;
pub use queue::{BlockDriver, QueueStats};
pub use request::{RequestHandle, RequestInfo};
pub use sleep::{Sleeper, SpinSleeper};
pub use types::{DeviceId, Direction, IoCompletion, IoStatus, MemoryExtent, SECTOR_SIZE, Submission};
