//! Elevator ordering with a starvation bound
//!
//! Pending requests are kept in sweep order: sectors ascend along the list
//! until the sweep wraps back to a lower sector and starts ascending again.
//! A new request is slotted into the sweep where it costs the least head
//! movement.
//!
//! Ordering alone can starve a request at the far end of the disk, so every
//! request carries a credit, stamped from the device's latency tunable for
//! its direction. Each later insertion costs every other pending request one
//! credit. A request at zero credit cannot be overtaken: new work lands
//! behind it and the queue is dispatched instead.

use crate::blk_fatal;
use crate::pool::RequestPool;
use crate::queue::DeviceQueue;
use crate::request::{Request, RequestHandle};

/// Where an insertion landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Index in the pending list
    pub position: usize,
    /// A pending request has run out of credit and must be serviced
    pub starved: bool,
}

/// Charge one credit to a request that has been let behind another.
pub(crate) fn charge(request: &mut Request) {
    request.credit = match request.credit.checked_sub(1) {
        Some(credit) => credit,
        None => blk_fatal!(
            "elevator credit underflow: request at sector {} on {}",
            request.sector,
            request.device
        ),
    };
}

/// Whether `new` belongs between neighbours `cur` and `next`.
///
/// Inside an ascending run it must fall in `[cur, next)`. At the wrap point,
/// where the sweep ends at `cur` and the next one starts at `next`, it either
/// extends the current sweep (`new >= cur`) or opens the next one before
/// `next` (`new < next`). Equal sectors go after existing ones, keeping
/// arrival order.
pub fn fits_between(cur: u64, new: u64, next: u64) -> bool {
    if cur <= next {
        cur <= new && new < next
    } else {
        new >= cur || new < next
    }
}

/// First index the elevator may place a new request at, and whether a
/// starved request set that bound.
///
/// The head is never displaced. Started requests are in the driver's
/// hands, and zero-credit requests may not be overtaken.
fn insertion_floor(queue: &DeviceQueue, pool: &RequestPool) -> (usize, bool) {
    let mut cursor = 0;
    let mut starved = false;
    for (index, &handle) in queue.pending.iter().enumerate() {
        let request = pool.expect(handle);
        if request.started {
            cursor = index;
        } else if request.credit == 0 {
            cursor = index;
            starved = true;
        }
    }
    (cursor, starved)
}

/// Insert `handle` into the device's pending list.
///
/// Stamps the new request with its direction's latency and charges every
/// other waiting request one credit.
pub fn insert(queue: &mut DeviceQueue, pool: &mut RequestPool, handle: RequestHandle) -> InsertOutcome {
    let latency = queue.tunables().latency_for(pool.expect(handle).direction);
    let sector = {
        let request = pool.expect_mut(handle);
        request.credit = latency;
        request.sector
    };

    if queue.pending.is_empty() {
        queue.pending.push(handle);
        return InsertOutcome { position: 0, starved: false };
    }

    let (cursor, starved) = insertion_floor(queue, pool);
    let mut position = queue.pending.len();
    for index in cursor..queue.pending.len() - 1 {
        let cur = pool.expect(queue.pending[index]).sector;
        let next = pool.expect(queue.pending[index + 1]).sector;
        if fits_between(cur, sector, next) {
            position = index + 1;
            break;
        }
    }
    queue.pending.insert(position, handle);

    for (index, &other) in queue.pending.iter().enumerate() {
        if index == position {
            continue;
        }
        let request = pool.expect_mut(other);
        if request.started {
            continue;
        }
        if request.credit == 0 {
            if index > position {
                blk_fatal!("starved request at sector {} overtaken on {}", request.sector, queue.id());
            }
            continue;
        }
        charge(request);
    }

    crate::blk_trace!("elevator: {} sector {} at {} (starved={})", queue.id(), sector, position, starved);
    InsertOutcome { position, starved }
}
