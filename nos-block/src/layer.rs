//! Block layer entry points
//!
//! [`BlockLayer`] owns the subsystem lock around [`SubsystemState`] and is
//! the only way in: callers submit I/O through it, drivers pull work and
//! report completions through it, and administration goes through it.
//!
//! Lock discipline:
//! - every pool, merge, elevator and queue mutation happens under the lock,
//!   with local interrupts masked through the layer's [`IrqControl`], so a
//!   driver may call [`BlockLayer::complete_one`] from its interrupt handler;
//! - completion callbacks, driver calls and sleeps happen after it is
//!   dropped and interrupts are restored, so either may re-enter the layer.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;

use crate::completion::{self, Completion, CompletionEffects};
use crate::config::{self, BlockLayerConfig, DeviceConfig, ElevatorTunables};
use crate::error::{BlockError, Result};
use crate::irq::{IrqControl, IrqLock, IrqLockGuard, NoIrq};
use crate::merge::{self, MergeOutcome};
use crate::pool::{PoolStats, RequestPool};
use crate::queue::{BlockDriver, DeviceQueue, QueueStats};
use crate::request::{Request, RequestHandle, RequestInfo, SyncSignal};
use crate::sleep::Sleeper;
use crate::types::{DeviceId, Direction, IoStatus, MemoryExtent, SECTOR_SIZE, Submission};
use crate::{blk_debug, blk_info, blk_trace, blk_warn};

/// Everything the subsystem lock protects
pub(crate) struct SubsystemState {
    pub(crate) pool: RequestPool,
    pub(crate) devices: HashMap<DeviceId, DeviceQueue>,
}

impl SubsystemState {
    pub(crate) fn new(config: &BlockLayerConfig) -> Self {
        Self { pool: RequestPool::new(config.nr_requests), devices: HashMap::new() }
    }
}

/// How an accepted submission was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Folded into an already queued request
    Merged(RequestHandle),
    /// Given its own request slot and queued
    Queued(RequestHandle),
    /// Read-ahead or write-ahead dropped because the pool was exhausted
    Dropped,
}

impl SubmitOutcome {
    /// Request carrying the submission, unless it was dropped
    pub fn handle(&self) -> Option<RequestHandle> {
        match self {
            SubmitOutcome::Merged(h) | SubmitOutcome::Queued(h) => Some(*h),
            SubmitOutcome::Dropped => None,
        }
    }
}

/// Request queueing and elevator scheduling for every registered device
pub struct BlockLayer {
    state: IrqLock<SubsystemState>,
    sleeper: Arc<dyn Sleeper>,
    /// Release epoch of the pool; blocked allocators sleep until it moves
    releases: Arc<AtomicU64>,
    config: BlockLayerConfig,
}

impl BlockLayer {
    /// Create a block layer whose completions never arrive in interrupt
    /// context
    pub fn new(config: BlockLayerConfig, sleeper: Arc<dyn Sleeper>) -> Result<Self> {
        Self::with_irq_control(config, sleeper, Arc::new(NoIrq))
    }

    /// Create a block layer that masks interrupts through `irq` whenever it
    /// holds the subsystem lock
    pub fn with_irq_control(
        config: BlockLayerConfig,
        sleeper: Arc<dyn Sleeper>,
        irq: Arc<dyn IrqControl>,
    ) -> Result<Self> {
        config.validate()?;
        let state = SubsystemState::new(&config);
        let releases = state.pool.release_counter();
        blk_info!("block layer: {} request slots", config.nr_requests);
        Ok(Self { state: IrqLock::new(state, irq), sleeper, releases, config })
    }

    /// Subsystem configuration
    pub fn config(&self) -> &BlockLayerConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Device administration
    // ---------------------------------------------------------------------

    /// Attach a driver to `device`
    pub fn register_device(&self, device: DeviceId, config: DeviceConfig, driver: Arc<dyn BlockDriver>) -> Result<()> {
        config.validate()?;
        let mut state = self.state.lock();
        if state.devices.contains_key(&device) {
            return Err(BlockError::Busy(device));
        }
        state.devices.insert(device, DeviceQueue::new(device, config, driver));
        blk_info!(
            "block device {}: {} sectors, max {} sectors/{} segments per request",
            device,
            config.extent_sectors,
            config.max_sectors,
            config.max_segments
        );
        Ok(())
    }

    /// Detach `device`; refused while it still has pending requests
    pub fn unregister_device(&self, device: DeviceId) -> Result<()> {
        let mut state = self.state.lock();
        let queue = state.devices.get(&device).ok_or(BlockError::NoDevice(device))?;
        if !queue.is_empty() {
            return Err(BlockError::Busy(device));
        }
        state.devices.remove(&device);
        blk_info!("block device {} unregistered", device);
        Ok(())
    }

    /// Current latency tunables of `device`
    pub fn elevator_tunables(&self, device: DeviceId) -> Result<ElevatorTunables> {
        self.with_queue(device, |queue| queue.tunables())
    }

    /// Replace the latency tunables of `device`.
    ///
    /// Requests already queued keep the credit they were stamped with.
    pub fn set_elevator_tunables(&self, device: DeviceId, read_latency: i64, write_latency: i64) -> Result<()> {
        let tunables = ElevatorTunables::from_signed(read_latency, write_latency)?;
        self.with_queue_mut(device, |queue| queue.config.tunables = tunables)
    }

    /// Mark `device` read-only or writable
    pub fn set_read_only(&self, device: DeviceId, read_only: bool) -> Result<()> {
        self.with_queue_mut(device, |queue| queue.read_only = read_only)
    }

    /// Whether writes to `device` are refused
    pub fn is_read_only(&self, device: DeviceId) -> Result<bool> {
        self.with_queue(device, |queue| queue.read_only)
    }

    /// Counters of `device`
    pub fn device_stats(&self, device: DeviceId) -> Result<QueueStats> {
        self.with_queue(device, |queue| queue.stats())
    }

    /// Request pool counters
    pub fn pool_stats(&self) -> PoolStats {
        self.state.lock().pool.stats()
    }

    /// Snapshot of the pending list of `device` in dispatch order
    pub fn pending(&self, device: DeviceId) -> Result<Vec<RequestInfo>> {
        let state = self.state.lock();
        let queue = state.devices.get(&device).ok_or(BlockError::NoDevice(device))?;
        Ok(queue.snapshot(&state.pool))
    }

    fn with_queue<T>(&self, device: DeviceId, f: impl FnOnce(&DeviceQueue) -> T) -> Result<T> {
        let state = self.state.lock();
        state.devices.get(&device).map(f).ok_or(BlockError::NoDevice(device))
    }

    fn with_queue_mut<T>(&self, device: DeviceId, f: impl FnOnce(&mut DeviceQueue) -> T) -> Result<T> {
        let mut state = self.state.lock();
        state.devices.get_mut(&device).map(f).ok_or(BlockError::NoDevice(device))
    }

    // ---------------------------------------------------------------------
    // Submission
    // ---------------------------------------------------------------------

    /// Submit one contiguous transfer.
    ///
    /// Rejected submissions fail synchronously: the error is returned, the
    /// callback runs with [`IoStatus::Rejected`] and no slot is consumed.
    /// Plain reads and writes block while the pool is exhausted; read-ahead
    /// and write-ahead are dropped instead.
    pub fn submit(&self, device: DeviceId, direction: Direction, submission: Submission) -> Result<SubmitOutcome> {
        self.submit_inner(device, direction, submission, None)
    }

    /// Submit several transfers as one batch.
    ///
    /// The device stays plugged while the batch is admitted so adjacent
    /// submissions merge before the driver sees any of them.
    pub fn submit_batch(
        &self,
        device: DeviceId,
        direction: Direction,
        submissions: Vec<Submission>,
    ) -> Vec<Result<SubmitOutcome>> {
        let plugged = self.plug(device).is_ok();
        let outcomes = submissions
            .into_iter()
            .map(|submission| self.submit(device, direction, submission))
            .collect();
        if plugged {
            // The device can only disappear once its queue drained.
            let _ = self.unplug(device);
        }
        outcomes
    }

    /// Submit a transfer and sleep until it completes.
    ///
    /// The request is never merged with other submissions. Returns the
    /// final status; a failure anywhere in the transfer is reported as
    /// [`IoStatus::Failed`].
    pub fn submit_and_wait(
        &self,
        device: DeviceId,
        direction: Direction,
        sector: u64,
        sectors: u32,
        memory: MemoryExtent,
    ) -> Result<IoStatus> {
        let signal = Arc::new(SyncSignal::new());
        let submission = Submission::detached(sector, sectors, memory);
        if self.submit_inner(device, direction, submission, Some(Arc::clone(&signal)))? == SubmitOutcome::Dropped {
            return Ok(IoStatus::Dropped);
        }
        self.unplug(device)?;
        self.sleeper.sleep_until(&|| signal.is_done());
        Ok(signal.status().unwrap_or(IoStatus::Failed))
    }

    fn submit_inner(
        &self,
        device: DeviceId,
        direction: Direction,
        submission: Submission,
        waiter: Option<Arc<SyncSignal>>,
    ) -> Result<SubmitOutcome> {
        if let Err(err) = check_shape(&submission) {
            return Err(reject(submission, err));
        }

        let mut state = self.state.lock();
        let SubsystemState { pool, devices } = &mut *state;
        let Some(queue) = devices.get_mut(&device) else {
            drop(state);
            return Err(reject(submission, BlockError::NoDevice(device)));
        };
        if let Err(err) = admit(queue, direction, &submission) {
            queue.stats.rejected += 1;
            drop(state);
            return Err(reject(submission, err));
        }

        let submission = if waiter.is_some() {
            submission
        } else {
            match merge::try_merge(queue, pool, direction, submission) {
                MergeOutcome::NoMerge(submission) => submission,
                MergeOutcome::Back(handle) | MergeOutcome::Front(handle) => return Ok(SubmitOutcome::Merged(handle)),
                MergeOutcome::Collapsed { survivor, .. } => {
                    drop(state);
                    self.sleeper.wake_all();
                    return Ok(SubmitOutcome::Merged(survivor));
                }
            }
        };

        let limit = config::search_limit(self.config.nr_requests, direction, queue.class());
        let mut request = Request::new(device, direction, submission);
        request.waiter = waiter;

        let (mut state, handle) = match pool.allocate(request, limit) {
            Ok(handle) => (state, handle),
            Err(request) if direction.is_ahead() => {
                queue.stats.dropped += 1;
                drop(state);
                blk_debug!("{}: pool exhausted, dropping {:?} at sector {}", device, direction, request.sector);
                finish_unqueued(request, IoStatus::Dropped);
                return Ok(SubmitOutcome::Dropped);
            }
            Err(request) => {
                drop(state);
                self.allocate_blocking(device, request, limit)?
            }
        };

        let SubsystemState { pool, devices } = &mut *state;
        let Some(queue) = devices.get_mut(&device) else {
            let request = pool.release(handle);
            drop(state);
            self.sleeper.wake_all();
            return Err(reject_request(request, BlockError::NoDevice(device)));
        };
        let dispatch = queue.enqueue(pool, handle) && !queue.is_plugged();
        let driver = dispatch.then(|| {
            queue.stats.dispatches += 1;
            queue.driver()
        });
        drop(state);

        if let Some(driver) = driver {
            blk_trace!("{}: dispatch on insert", device);
            driver.request(self, device);
        }
        Ok(SubmitOutcome::Queued(handle))
    }

    /// Wait for a free slot within `limit`.
    ///
    /// Each round unplugs the device so queued work drains, then sleeps
    /// until some slot is released. The release epoch is read before the
    /// retry, so a release that lands between the failed attempt and the
    /// sleep cuts the sleep short instead of being lost. Returns with the
    /// subsystem lock held.
    fn allocate_blocking(
        &self,
        device: DeviceId,
        mut request: Request,
        limit: usize,
    ) -> Result<(IrqLockGuard<'_, SubsystemState>, RequestHandle)> {
        blk_debug!("{}: request pool exhausted, waiting for a slot", device);
        loop {
            let epoch = self.releases.load(Ordering::Acquire);
            if let Err(err) = self.unplug(device) {
                return Err(reject_request(request, err));
            }

            let mut state = self.state.lock();
            if !state.devices.contains_key(&device) {
                drop(state);
                return Err(reject_request(request, BlockError::NoDevice(device)));
            }
            match state.pool.allocate(request, limit) {
                Ok(handle) => return Ok((state, handle)),
                Err(returned) => request = returned,
            }
            drop(state);

            self.sleeper.sleep_until(&|| self.releases.load(Ordering::Acquire) != epoch);
        }
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    /// Hold back dispatch on `device` until [`BlockLayer::unplug`]
    pub fn plug(&self, device: DeviceId) -> Result<()> {
        self.with_queue_mut(device, |queue| queue.plugged = true)
    }

    /// Release the plug and hand pending work to the driver.
    ///
    /// Returns whether the driver was called.
    pub fn unplug(&self, device: DeviceId) -> Result<bool> {
        self.with_queue_mut(device, |queue| queue.plugged = false)?;
        self.dispatch(device)
    }

    /// Unplug every plugged device
    pub fn unplug_all(&self) {
        let plugged: Vec<DeviceId> = {
            let state = self.state.lock();
            state.devices.values().filter(|q| q.is_plugged()).map(|q| q.id()).collect()
        };
        for device in plugged {
            // Unregistered since the scan; nothing left to run.
            let _ = self.unplug(device);
        }
    }

    /// Call the driver of `device` if it is unplugged and has work.
    ///
    /// Returns whether the driver was called.
    pub fn dispatch(&self, device: DeviceId) -> Result<bool> {
        let driver = {
            let mut state = self.state.lock();
            let queue = state.devices.get_mut(&device).ok_or(BlockError::NoDevice(device))?;
            if queue.is_plugged() || queue.is_empty() {
                return Ok(false);
            }
            queue.stats.dispatches += 1;
            queue.driver()
        };
        blk_trace!("{}: dispatch", device);
        driver.request(self, device);
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Driver interface
    // ---------------------------------------------------------------------

    /// Head request of `device`, marked as started.
    ///
    /// `None` while the device is plugged or idle.
    pub fn current_request(&self, device: DeviceId) -> Result<Option<RequestInfo>> {
        let mut state = self.state.lock();
        let SubsystemState { pool, devices } = &mut *state;
        let queue = devices.get_mut(&device).ok_or(BlockError::NoDevice(device))?;
        Ok(queue.fetch_head(pool))
    }

    /// Record partial progress inside the current sub-buffer of a request
    pub fn advance(&self, handle: RequestHandle, sectors: u32) -> Result<RequestInfo> {
        completion::advance(&mut self.state.lock(), handle, sectors)
    }

    /// Finish the current sub-buffer of a request
    pub fn complete_one(&self, handle: RequestHandle, success: bool) -> Result<Completion> {
        let mut effects = CompletionEffects::default();
        let result = completion::complete_one(&mut self.state.lock(), handle, success, &mut effects);
        self.settle(effects);
        result
    }

    /// Finish every remaining sub-buffer of a request
    pub fn end_request(&self, handle: RequestHandle, success: bool) -> Result<()> {
        let mut effects = CompletionEffects::default();
        let result = completion::end_request(&mut self.state.lock(), handle, success, &mut effects);
        self.settle(effects);
        result
    }

    /// Run completion side effects with the lock released.
    ///
    /// Slot waiters and synchronous waiters share one sleeper, so a single
    /// targeted wake could land on a waiter whose condition did not change
    /// and be lost. One `wake_all` per completion that released a slot or
    /// finished a synchronous request lets every waiter re-check instead;
    /// completions that do neither wake nobody.
    fn settle(&self, effects: CompletionEffects) {
        let (released, signalled) = effects.run();
        if released > 0 || signalled {
            self.sleeper.wake_all();
        }
    }
}

/// Argument checks that need no device
fn check_shape(submission: &Submission) -> Result<()> {
    if submission.sectors == 0 {
        return Err(BlockError::InvalidArgument("zero-length submission"));
    }
    let expected = (submission.sectors as usize).checked_mul(SECTOR_SIZE);
    if expected != Some(submission.memory.len) {
        return Err(BlockError::InvalidArgument("memory length does not match sector count"));
    }
    Ok(())
}

/// Per-device admission checks
fn admit(queue: &DeviceQueue, direction: Direction, submission: &Submission) -> Result<()> {
    if direction.is_write() && queue.read_only {
        return Err(BlockError::ReadOnly(queue.id()));
    }
    let extent = queue.config.extent_sectors;
    let end = submission.sector.checked_add(submission.sectors as u64);
    if end.is_none_or(|end| end > extent) {
        return Err(BlockError::OutOfRange { sector: submission.sector, sectors: submission.sectors, extent });
    }
    Ok(())
}

fn reject(submission: Submission, err: BlockError) -> BlockError {
    blk_warn!("refused submission at sector {}: {}", submission.sector, err);
    submission.finish_untransferred(IoStatus::Rejected(err));
    err
}

fn reject_request(request: Request, err: BlockError) -> BlockError {
    blk_warn!("refused request at sector {}: {}", request.sector, err);
    finish_unqueued(request, IoStatus::Rejected(err));
    err
}

/// Deliver `status` to every sub-buffer of a request that never reached a queue
fn finish_unqueued(request: Request, status: IoStatus) {
    if let Some(waiter) = &request.waiter {
        waiter.record(status);
        waiter.complete();
    }
    for sub in request.chain {
        if let Some((callback, completion)) = sub.into_completion(status) {
            callback(completion);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceClass;
    use crate::irq::CountingIrq;
    use crate::queue::MockBlockDriver;
    use crate::sleep::SpinSleeper;
    use spin::Mutex;
    use crate::types::IoCompletion;
    use alloc::vec;

    const DEV: DeviceId = DeviceId::new(3, 0);

    fn layer(nr_requests: usize) -> BlockLayer {
        BlockLayer::new(BlockLayerConfig { nr_requests }, Arc::new(SpinSleeper::new())).unwrap()
    }

    fn idle_driver() -> Arc<MockBlockDriver> {
        let mut driver = MockBlockDriver::new();
        driver.expect_request().returning(|_, _| ());
        Arc::new(driver)
    }

    fn read(sector: u64, sectors: u32) -> Submission {
        Submission::detached(sector, sectors, MemoryExtent::new(0x10000 + sector as usize * SECTOR_SIZE, sectors as usize * SECTOR_SIZE))
    }

    #[test]
    fn test_register_twice_is_busy() {
        let layer = layer(8);
        layer.register_device(DEV, DeviceConfig::new(100), idle_driver()).unwrap();
        assert_eq!(layer.register_device(DEV, DeviceConfig::new(100), idle_driver()), Err(BlockError::Busy(DEV)));
    }

    #[test]
    fn test_out_of_range_consumes_no_slot() {
        let layer = layer(8);
        layer.register_device(DEV, DeviceConfig::new(100), idle_driver()).unwrap();
        let status = Arc::new(Mutex::new(None::<IoCompletion>));
        let seen = Arc::clone(&status);
        let sub = Submission::new(96, 8, MemoryExtent::new(0, 8 * SECTOR_SIZE), move |c| *seen.lock() = Some(c));

        let err = layer.submit(DEV, Direction::Read, sub).unwrap_err();
        assert_eq!(err, BlockError::OutOfRange { sector: 96, sectors: 8, extent: 100 });
        let completion = status.lock().unwrap();
        assert_eq!(completion.transferred, 0);
        assert_eq!(completion.status, IoStatus::Rejected(err));
        assert_eq!(layer.pool_stats().active_slots, 0);
        assert_eq!(layer.device_stats(DEV).unwrap().rejected, 1);
    }

    #[test]
    fn test_shape_checks() {
        let layer = layer(8);
        layer.register_device(DEV, DeviceConfig::new(100), idle_driver()).unwrap();
        let zero = Submission::detached(0, 0, MemoryExtent::new(0, 0));
        assert!(matches!(layer.submit(DEV, Direction::Read, zero), Err(BlockError::InvalidArgument(_))));
        let short = Submission::detached(0, 2, MemoryExtent::new(0, SECTOR_SIZE));
        assert!(matches!(layer.submit(DEV, Direction::Read, short), Err(BlockError::InvalidArgument(_))));
        assert_eq!(layer.submit(DeviceId::new(9, 9), Direction::Read, read(0, 1)), Err(BlockError::NoDevice(DeviceId::new(9, 9))));
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let layer = layer(8);
        layer.register_device(DEV, DeviceConfig::new(100), idle_driver()).unwrap();
        layer.set_read_only(DEV, true).unwrap();
        assert!(layer.is_read_only(DEV).unwrap());
        assert_eq!(layer.submit(DEV, Direction::WriteAhead, read(0, 1)), Err(BlockError::ReadOnly(DEV)));
        assert!(layer.submit(DEV, Direction::Read, read(0, 1)).is_ok());
    }

    #[test]
    fn test_unregister_refused_while_pending() {
        let layer = layer(8);
        layer.register_device(DEV, DeviceConfig::new(100), idle_driver()).unwrap();
        let handle = layer.submit(DEV, Direction::Read, read(0, 1)).unwrap().handle().unwrap();
        assert_eq!(layer.unregister_device(DEV), Err(BlockError::Busy(DEV)));
        layer.end_request(handle, true).unwrap();
        layer.unregister_device(DEV).unwrap();
        assert_eq!(layer.pending(DEV), Err(BlockError::NoDevice(DEV)));
    }

    #[test]
    fn test_read_ahead_dropped_on_exhaustion() {
        let layer = layer(1);
        layer.register_device(DEV, DeviceConfig::new(1000), idle_driver()).unwrap();
        layer.submit(DEV, Direction::Read, read(0, 1)).unwrap();

        let status = Arc::new(Mutex::new(None::<IoStatus>));
        let seen = Arc::clone(&status);
        let sub = Submission::new(500, 1, MemoryExtent::new(0, SECTOR_SIZE), move |c| *seen.lock() = Some(c.status));
        assert_eq!(layer.submit(DEV, Direction::ReadAhead, sub), Ok(SubmitOutcome::Dropped));
        assert_eq!(*status.lock(), Some(IoStatus::Dropped));
        assert_eq!(layer.device_stats(DEV).unwrap().dropped, 1);
    }

    #[test]
    fn test_tunables_round_trip_and_validation() {
        let layer = layer(8);
        layer.register_device(DEV, DeviceConfig::new(100), idle_driver()).unwrap();
        layer.set_elevator_tunables(DEV, 3, 12).unwrap();
        assert_eq!(layer.elevator_tunables(DEV).unwrap(), ElevatorTunables { read_latency: 3, write_latency: 12 });
        assert!(matches!(layer.set_elevator_tunables(DEV, -1, 12), Err(BlockError::InvalidArgument(_))));
        assert_eq!(layer.elevator_tunables(DEV).unwrap().read_latency, 3);
    }

    #[test]
    fn test_plugged_queue_hides_head() {
        let layer = layer(8);
        let mut driver = MockBlockDriver::new();
        driver.expect_request().times(1).returning(|_, _| ());
        layer.register_device(DEV, DeviceConfig::new(1000), Arc::new(driver)).unwrap();

        layer.submit(DEV, Direction::Read, read(0, 8)).unwrap();
        assert_eq!(layer.current_request(DEV).unwrap(), None);
        assert_eq!(layer.dispatch(DEV), Ok(false));
        assert_eq!(layer.unplug(DEV), Ok(true));
        let head = layer.current_request(DEV).unwrap().unwrap();
        assert!(head.started);
        assert_eq!(layer.device_stats(DEV).unwrap().dispatches, 1);
    }

    #[test]
    fn test_host_adapter_dispatches_on_insert() {
        let layer = layer(8);
        let mut driver = MockBlockDriver::new();
        driver.expect_request().times(2).returning(|_, _| ());
        let config = DeviceConfig::new(1000).with_class(DeviceClass::HOST_ADAPTER);
        layer.register_device(DEV, config, Arc::new(driver)).unwrap();
        layer.submit(DEV, Direction::Read, read(0, 8)).unwrap();
        layer.submit(DEV, Direction::Read, read(500, 8)).unwrap();
        assert_eq!(layer.pending(DEV).unwrap().len(), 2);
    }

    #[test]
    fn test_batch_merges_before_dispatch() {
        let layer = layer(8);
        let mut driver = MockBlockDriver::new();
        driver.expect_request().times(1).returning(|_, _| ());
        layer.register_device(DEV, DeviceConfig::new(1000), Arc::new(driver)).unwrap();

        let outcomes = layer.submit_batch(DEV, Direction::Write, vec![read(0, 8), read(8, 8), read(16, 8)]);
        assert!(matches!(outcomes[0], Ok(SubmitOutcome::Queued(_))));
        assert!(matches!(outcomes[1], Ok(SubmitOutcome::Merged(_))));
        assert!(matches!(outcomes[2], Ok(SubmitOutcome::Merged(_))));
        let pending = layer.pending(DEV).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].nr_sectors, 24);
        assert_eq!(layer.device_stats(DEV).unwrap().queued, 1);
    }

    #[test]
    fn test_completion_from_interrupt_handler() {
        let irq = Arc::new(CountingIrq::new());
        let layer = BlockLayer::with_irq_control(BlockLayerConfig { nr_requests: 8 }, Arc::new(SpinSleeper::new()), irq.clone()).unwrap();

        // The driver finishes the head the way its interrupt handler would.
        let mut driver = MockBlockDriver::new();
        let handler_irq = Arc::clone(&irq);
        driver.expect_request().times(1).returning(move |layer, device| {
            assert!(!handler_irq.masked());
            let head = layer.current_request(device).unwrap().unwrap();
            assert_eq!(layer.complete_one(head.handle, true), Ok(Completion::Finished));
        });
        layer.register_device(DEV, DeviceConfig::new(1000), Arc::new(driver)).unwrap();

        let masked_in_callback = Arc::new(Mutex::new(None::<bool>));
        let seen = Arc::clone(&masked_in_callback);
        let callback_irq = Arc::clone(&irq);
        let sub = Submission::new(0, 8, MemoryExtent::new(0x10000, 8 * SECTOR_SIZE), move |c| {
            assert!(c.status.is_ok());
            *seen.lock() = Some(callback_irq.masked());
        });
        layer.submit(DEV, Direction::Read, sub).unwrap();
        assert_eq!(layer.unplug(DEV), Ok(true));

        assert_eq!(*masked_in_callback.lock(), Some(false));
        assert!(!irq.masked());
        assert!(irq.disables() > 0);
        assert_eq!(layer.pool_stats().active_slots, 0);
    }

    #[test]
    fn test_only_finished_requests_wake_waiters() {
        let sleeper = Arc::new(SpinSleeper::new());
        let layer = BlockLayer::new(BlockLayerConfig { nr_requests: 8 }, sleeper.clone()).unwrap();
        layer.register_device(DEV, DeviceConfig::new(1000), idle_driver()).unwrap();
        layer.submit(DEV, Direction::Read, read(0, 8)).unwrap();
        layer.submit(DEV, Direction::Read, read(8, 8)).unwrap();
        layer.unplug(DEV).unwrap();

        let head = layer.current_request(DEV).unwrap().unwrap();
        assert!(matches!(layer.complete_one(head.handle, true), Ok(Completion::More(_))));
        assert_eq!(sleeper.wakeups(), 0);
        assert_eq!(layer.complete_one(head.handle, true), Ok(Completion::Finished));
        assert_eq!(sleeper.wakeups(), 1);
    }
}
