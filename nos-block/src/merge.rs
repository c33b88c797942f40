//! Merging submissions into queued requests
//!
//! A submission that continues a pending request of the same direction is
//! folded into it instead of taking a new slot. Back merges append to the
//! request; front merges prepend and may then close the gap to the request
//! in front, collapsing the two into one.

use crate::blk_debug;
use crate::elevator::charge;
use crate::pool::RequestPool;
use crate::queue::DeviceQueue;
use crate::request::{RequestHandle, SubBuffer};
use crate::types::{Direction, Submission};

/// Result of a merge attempt
#[derive(Debug)]
pub enum MergeOutcome {
    /// Appended to the tail of a request
    Back(RequestHandle),
    /// Prepended to the head of a request
    Front(RequestHandle),
    /// Prepended, after which the request was folded into its predecessor;
    /// the freed slot has been released
    Collapsed {
        /// Request that now holds both chains
        survivor: RequestHandle,
        /// Released slot
        freed: RequestHandle,
    },
    /// No adjacent request; the submission is handed back
    NoMerge(Submission),
}

impl MergeOutcome {
    /// Request the submission ended up in, if any
    pub fn handle(&self) -> Option<RequestHandle> {
        match self {
            MergeOutcome::Back(h) | MergeOutcome::Front(h) => Some(*h),
            MergeOutcome::Collapsed { survivor, .. } => Some(*survivor),
            MergeOutcome::NoMerge(_) => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Back,
    Front,
}

/// Lowest list index a merge may touch, and whether that entry only
/// accepts back merges.
fn merge_floor(queue: &DeviceQueue, pool: &RequestPool) -> (usize, bool) {
    match queue.pending.first() {
        Some(&head) if pool.expect(head).started => {
            if queue.class().owns_head() {
                (1, false)
            } else {
                (0, true)
            }
        }
        _ => (0, false),
    }
}

/// Try to fold `submission` into a pending request of `queue`.
///
/// The list is scanned from the tail. Requests passed over on the way to the
/// merge target end up behind the grown request, so each is charged one
/// credit. The scan never passes a request without credit, and such a
/// request only takes back merges, which leave its start untouched.
pub fn try_merge(
    queue: &mut DeviceQueue,
    pool: &mut RequestPool,
    direction: Direction,
    submission: Submission,
) -> MergeOutcome {
    let direction = direction.base();
    let max_sectors = queue.config.max_sectors as u64;
    let max_segments = queue.config.max_segments;
    let (floor, head_back_only) = merge_floor(queue, pool);

    let mut found = None;
    for index in (floor..queue.pending.len()).rev() {
        let request = pool.expect(queue.pending[index]);
        let starved = request.credit == 0;
        let back_only = starved || (index == 0 && head_back_only);

        if !request.has_waiter()
            && request.direction == direction
            && request.nr_sectors as u64 + submission.sectors as u64 <= max_sectors
        {
            if request.end_sector() == submission.sector
                && request.segments_after_push_back(&submission.memory) <= max_segments
            {
                found = Some((index, Side::Back));
                break;
            }
            if !back_only
                && submission.end_sector() == request.sector
                && request.segments_after_push_front(&submission.memory) <= max_segments
            {
                found = Some((index, Side::Front));
                break;
            }
        }
        if starved {
            break;
        }
    }

    let Some((index, side)) = found else {
        return MergeOutcome::NoMerge(submission);
    };

    for &skipped in &queue.pending[index + 1..] {
        let request = pool.expect_mut(skipped);
        if !request.started {
            charge(request);
        }
    }

    let handle = queue.pending[index];
    let sub = SubBuffer::from_submission(submission);
    match side {
        Side::Back => {
            pool.expect_mut(handle).push_back(sub);
            queue.stats.record_merge(false, false);
            blk_debug!("merge: back into {:?} on {}", handle, queue.id());
            MergeOutcome::Back(handle)
        }
        Side::Front => {
            pool.expect_mut(handle).push_front(sub);
            match try_collapse(queue, pool, index, floor) {
                Some(survivor) => {
                    queue.stats.record_merge(true, true);
                    blk_debug!("merge: front into {:?}, collapsed into {:?} on {}", handle, survivor, queue.id());
                    MergeOutcome::Collapsed { survivor, freed: handle }
                }
                None => {
                    queue.stats.record_merge(true, false);
                    blk_debug!("merge: front into {:?} on {}", handle, queue.id());
                    MergeOutcome::Front(handle)
                }
            }
        }
    }
}

/// Fold the request at `index` into the one in front of it when they are
/// now adjacent. Returns the surviving handle.
fn try_collapse(queue: &mut DeviceQueue, pool: &mut RequestPool, index: usize, floor: usize) -> Option<RequestHandle> {
    if index == 0 || index - 1 < floor {
        return None;
    }
    let prev_handle = queue.pending[index - 1];
    let handle = queue.pending[index];
    let prev = pool.expect(prev_handle);
    let next = pool.expect(handle);

    let mergeable = !prev.started
        && !prev.has_waiter()
        && prev.direction == next.direction
        && prev.end_sector() == next.sector
        && prev.nr_sectors as u64 + next.nr_sectors as u64 <= queue.config.max_sectors as u64
        && prev.segments_after_absorb(next) <= queue.config.max_segments;
    if !mergeable {
        return None;
    }

    queue.pending.remove(index);
    let next = pool.release(handle);
    pool.expect_mut(prev_handle).absorb(next);
    Some(prev_handle)
}
