//! Completion accounting
//!
//! Drivers report progress one sub-buffer at a time. Each completion
//! detaches the front sub-buffer, queues its callback and moves the request
//! cursor to the next one. When the chain runs dry the request leaves its
//! device queue and its slot goes back to the pool.
//!
//! Nothing here calls out of the subsystem: callbacks, waiter signals and
//! slot wake-ups are collected in [`CompletionEffects`] and run by the
//! caller once the subsystem lock is dropped.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{BlockError, Result};
use crate::layer::SubsystemState;
use crate::request::{RequestHandle, RequestInfo, SyncSignal};
use crate::types::{CompletionFn, IoCompletion, IoStatus};
use crate::{blk_fatal, blk_trace, blk_warn};

/// What a driver learns from a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// More sub-buffers remain; the cursor now points at the next one
    More(RequestInfo),
    /// The request is done and its slot has been released
    Finished,
}

/// Side effects to run after the subsystem lock is released
#[derive(Default)]
pub(crate) struct CompletionEffects {
    pub(crate) callbacks: Vec<(CompletionFn, IoCompletion)>,
    pub(crate) waiters: Vec<Arc<SyncSignal>>,
    pub(crate) released: usize,
}

impl CompletionEffects {
    /// Invoke callbacks and signal synchronous waiters.
    ///
    /// Returns the number of released slots the caller still has to
    /// announce to blocked allocators.
    pub(crate) fn run(self) -> (usize, bool) {
        for (callback, completion) in self.callbacks {
            callback(completion);
        }
        let signalled = !self.waiters.is_empty();
        for waiter in self.waiters {
            waiter.complete();
        }
        (self.released, signalled)
    }
}

/// Record partial progress of `sectors` inside the current sub-buffer
pub(crate) fn advance(state: &mut SubsystemState, handle: RequestHandle, sectors: u32) -> Result<RequestInfo> {
    let request = state.pool.get_mut(handle).ok_or(BlockError::StaleRequest)?;
    if sectors > request.current_sectors {
        return Err(BlockError::InvalidArgument("advance past the current sub-buffer"));
    }
    request.advance(sectors);
    Ok(request.info(handle))
}

/// Finish the front sub-buffer of a request.
///
/// A failure only costs the front sub-buffer: the rest of the request stays
/// queued and is reported as [`Completion::More`].
pub(crate) fn complete_one(
    state: &mut SubsystemState,
    handle: RequestHandle,
    success: bool,
    effects: &mut CompletionEffects,
) -> Result<Completion> {
    let request = state.pool.get_mut(handle).ok_or(BlockError::StaleRequest)?;
    let device = request.device;
    let status = if success { IoStatus::Done } else { IoStatus::Failed };
    if !success {
        blk_warn!(
            "I/O error: dev {}, sector {}, dropping {} sectors",
            device,
            request.sector,
            request.current_sectors
        );
    }

    let Some(sub) = request.pop_front() else {
        blk_fatal!("active request {:?} on {} has an empty chain", handle, device);
    };
    if let Some(waiter) = &request.waiter {
        waiter.record(status);
    }
    blk_trace!("complete: {:?} sector {} +{} ok={}", handle, sub.sector, sub.sectors, success);
    if let Some(entry) = sub.into_completion(status) {
        effects.callbacks.push(entry);
    }

    let more = (request.sub_buffers() > 0).then(|| request.info(handle));

    let Some(queue) = state.devices.get_mut(&device) else {
        blk_fatal!("request {:?} completing on unregistered device {}", handle, device);
    };
    queue.stats.record_completion(success);

    if let Some(info) = more {
        return Ok(Completion::More(info));
    }

    queue.remove(handle);
    let finished = state.pool.release(handle);
    effects.released += 1;
    if let Some(waiter) = finished.waiter {
        effects.waiters.push(waiter);
    }
    Ok(Completion::Finished)
}

/// Finish every remaining sub-buffer of a request with the same status
pub(crate) fn end_request(
    state: &mut SubsystemState,
    handle: RequestHandle,
    success: bool,
    effects: &mut CompletionEffects,
) -> Result<()> {
    loop {
        if complete_one(state, handle, success, effects)? == Completion::Finished {
            return Ok(());
        }
    }
}
