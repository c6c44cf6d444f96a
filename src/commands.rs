use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc,
};

use smallvec::SmallVec;

use crate::{
    backend::{Backend, PresentOutcome},
    double_buffered::DoubleBuffered,
    error::GpuError,
    worker::{SubmissionWorker, SubmitRequest},
};

/// Where a bundle's submission currently is, shared between the recording
/// thread and the submission worker.
///
/// `SubmitPending` means the bundle sits in the worker's queue: its fence
/// has not been handed to the GPU yet, so waiting on it directly would
/// hang. `SubmitFailed` means the queue submit itself errored and the
/// fence will never signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BundleStage {
    Recording,
    SubmitPending,
    Submitted,
    SubmitFailed,
}

pub(crate) struct BundleStages(Box<[AtomicU8]>);

impl BundleStages {
    fn new(count: usize) -> BundleStages {
        BundleStages((0..count).map(|_| AtomicU8::new(0)).collect())
    }

    pub(crate) fn get(&self, slot: usize) -> BundleStage {
        match self.0[slot].load(Ordering::Acquire) {
            0 => BundleStage::Recording,
            1 => BundleStage::SubmitPending,
            2 => BundleStage::Submitted,
            _ => BundleStage::SubmitFailed,
        }
    }

    pub(crate) fn set(&self, slot: usize, stage: BundleStage) {
        let value = match stage {
            BundleStage::Recording => 0,
            BundleStage::SubmitPending => 1,
            BundleStage::Submitted => 2,
            BundleStage::SubmitFailed => 3,
        };
        self.0[slot].store(value, Ordering::Release);
    }
}

/// Latest present result, written by whichever thread issued the present
/// and read by the recording thread once per loop iteration. The outcome
/// tag and the raw result code travel in one word so a reader can never
/// pair one present's tag with another present's code.
pub(crate) struct PresentState(AtomicU64);

impl PresentState {
    fn new() -> PresentState {
        PresentState(AtomicU64::new(0))
    }

    pub(crate) fn record(&self, outcome: PresentOutcome) {
        let (tag, code) = match outcome {
            PresentOutcome::Presented => (1u64, 0i32),
            PresentOutcome::NeedsRecreation(res) => (2, res.as_raw()),
            PresentOutcome::Failed(res) => (3, res.as_raw()),
        };
        self.0
            .store(tag << 32 | u64::from(code as u32), Ordering::Release);
    }

    pub(crate) fn load(&self) -> Option<PresentOutcome> {
        let packed = self.0.load(Ordering::Acquire);
        let res = ash::vk::Result::from_raw(packed as u32 as i32);
        match packed >> 32 {
            0 => None,
            1 => Some(PresentOutcome::Presented),
            2 => Some(PresentOutcome::NeedsRecreation(res)),
            _ => Some(PresentOutcome::Failed(res)),
        }
    }
}

struct Bundle<B: Backend> {
    fence_counter: u64,
    frame_index: u32,
    init_used: bool,
    semaphore_used: bool,
    cleanups: Vec<B::Cleanup>,
}

impl<B: Backend> Bundle<B> {
    fn new() -> Bundle<B> {
        Bundle {
            fence_counter: 0,
            frame_index: 0,
            init_used: false,
            semaphore_used: false,
            cleanups: Vec::new(),
        }
    }
}

/// Descriptor pools for one rendering frame (swap-chain image index).
/// Overflow during a frame appends extra pools; the rotation step later
/// collapses them back to one.
struct FrameResources<B: Backend> {
    pools: SmallVec<[B::DescriptorPool; 2]>,
    current_pool: usize,
    sets_per_pool: u32,
}

impl<B: Backend> FrameResources<B> {
    fn new(backend: &B, sets_per_pool: u32) -> Result<FrameResources<B>, GpuError> {
        let mut pools = SmallVec::new();
        pools.push(backend.create_descriptor_pool(sets_per_pool)?);
        Ok(FrameResources {
            pools,
            current_pool: 0,
            sets_per_pool,
        })
    }
}

/// What to do with a frame's descriptor pools when it overflowed and
/// allocated more than one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorPoolGrowth {
    /// Destroy them all and allocate a single pool sized to the observed
    /// peak demand, keeping steady-state at one pool per frame.
    RebalanceToPeak,
    /// Keep the extra pools and just reset them.
    KeepPools,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Rendering frames (swap-chain images) to rotate descriptor pools
    /// across. Distinct from the command buffer ring size.
    pub num_frames: usize,
    /// Route submissions through a background thread.
    pub use_worker_thread: bool,
    pub descriptor_sets_per_pool: u32,
    pub descriptor_pool_growth: DescriptorPoolGrowth,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            num_frames: 3,
            use_worker_thread: false,
            descriptor_sets_per_pool: 1024,
            descriptor_pool_growth: DescriptorPoolGrowth::RebalanceToPeak,
        }
    }
}

/// The command-buffer ring: the one safe interface for obtaining the
/// buffer currently being recorded, submitting it (optionally with a
/// present chained behind it), waiting on fence counters, and deferring
/// destruction of anything the GPU might still be reading.
///
/// Counters are assigned when a bundle begins recording and increase
/// strictly in ring order, so "counter K completed" is a watermark: once
/// observed it covers every bundle at or below K.
pub struct CommandBufferPool<B: Backend> {
    backend: Arc<B>,
    bundles: Vec<Bundle<B>>,
    stages: Arc<BundleStages>,
    present: Arc<PresentState>,
    frames: DoubleBuffered<FrameResources<B>>,
    worker: Option<SubmissionWorker<B>>,
    current_slot: usize,
    current_frame: u32,
    next_fence_counter: u64,
    completed_fence_counter: u64,
    growth: DescriptorPoolGrowth,
}

impl<B: Backend> CommandBufferPool<B> {
    pub fn new(backend: Arc<B>, config: PoolConfig) -> Result<CommandBufferPool<B>, GpuError> {
        let ring = backend.ring_size();
        assert!(ring >= 2, "command buffer ring needs at least two bundles");
        assert!(
            config.num_frames >= 2,
            "frame resources need at least two rendering frames"
        );

        let frames = DoubleBuffered::try_new(config.num_frames, |_| {
            FrameResources::new(&*backend, config.descriptor_sets_per_pool)
        })?;
        let stages = Arc::new(BundleStages::new(ring));
        let present = Arc::new(PresentState::new());
        let worker = if config.use_worker_thread {
            Some(SubmissionWorker::spawn(
                Arc::clone(&backend),
                Arc::clone(&stages),
                Arc::clone(&present),
            )?)
        } else {
            None
        };

        let mut pool = CommandBufferPool {
            backend,
            bundles: (0..ring).map(|_| Bundle::new()).collect(),
            stages,
            present,
            frames,
            worker,
            current_slot: 0,
            current_frame: 0,
            next_fence_counter: 1,
            completed_fence_counter: 0,
            growth: config.descriptor_pool_growth,
        };
        pool.begin_bundle(0)?;
        Ok(pool)
    }

    /// The "main" buffer of the active bundle, for draw and dispatch work.
    pub fn current_command_buffer(&self) -> B::CommandBuffer {
        self.backend.command_buffer(self.current_slot)
    }

    /// The "init" buffer of the active bundle. Setup and transfer commands
    /// recorded here execute before the main buffer; accessing it marks it
    /// for inclusion in the next submit.
    pub fn current_init_command_buffer(&mut self) -> B::CommandBuffer {
        self.bundles[self.current_slot].init_used = true;
        self.backend.init_command_buffer(self.current_slot)
    }

    /// The active bundle's semaphore, to be signaled by an acquire (or
    /// similar) operation; the next submit will wait on it.
    pub fn current_semaphore(&mut self) -> B::Semaphore {
        self.bundles[self.current_slot].semaphore_used = true;
        self.backend.semaphore(self.current_slot)
    }

    /// Completion token for the work being recorded right now.
    pub fn current_fence_counter(&self) -> u64 {
        self.bundles[self.current_slot].fence_counter
    }

    /// Highest counter the GPU is known to have finished.
    pub fn completed_fence_counter(&self) -> u64 {
        self.completed_fence_counter
    }

    pub fn current_frame_index(&self) -> u32 {
        self.current_frame
    }

    /// Runs `cleanup` once the GPU has retired the bundle currently being
    /// recorded. The resource must not be referenced by any later bundle:
    /// destruction can run as soon as the ring wraps back to this slot.
    pub fn defer_destruction(&mut self, cleanup: B::Cleanup) {
        self.bundles[self.current_slot].cleanups.push(cleanup);
    }

    pub fn last_present_outcome(&self) -> Option<PresentOutcome> {
        self.present.load()
    }

    /// The last present folded into an error the caller can match on, or
    /// `None` if it went through cleanly.
    pub fn present_error(&self) -> Option<GpuError> {
        match self.present.load() {
            Some(PresentOutcome::NeedsRecreation(result)) => Some(GpuError::PresentFailed {
                result,
                transient: true,
            }),
            Some(PresentOutcome::Failed(result)) => Some(GpuError::PresentFailed {
                result,
                transient: false,
            }),
            _ => None,
        }
    }

    /// Ends recording on the active bundle and hands it to the GPU,
    /// presenting `present` right behind it if given, then opens the next
    /// bundle in the ring (waiting for its previous use to retire first).
    ///
    /// A queue-submit failure is returned, but only after the ring has
    /// advanced past the dead bundle so the pool never wedges.
    pub fn submit_command_buffer(
        &mut self,
        present: Option<B::PresentTarget>,
        wait_for_completion: bool,
        allow_worker_thread: bool,
    ) -> Result<(), GpuError> {
        let slot = self.current_slot;
        let init_used = self.bundles[slot].init_used;
        let semaphore_used = self.bundles[slot].semaphore_used;
        let presenting = present.is_some();

        self.backend.end_bundle(slot)?;
        self.stages.set(slot, BundleStage::SubmitPending);

        let mut submit_error = None;
        match (allow_worker_thread && !wait_for_completion, &self.worker) {
            (true, Some(worker)) => worker.enqueue(SubmitRequest {
                slot,
                init_used,
                semaphore_used,
                present,
            }),
            _ => {
                // Only one thread may touch the queue; flush anything the
                // worker still has queued before submitting directly.
                self.wait_for_worker_thread_idle();
                match self
                    .backend
                    .submit(slot, init_used, semaphore_used, present.as_ref())
                {
                    Ok(outcome) => {
                        self.stages.set(slot, BundleStage::Submitted);
                        if let Some(outcome) = outcome {
                            self.present.record(outcome);
                        }
                    }
                    Err(err) => {
                        log::error!("command buffer submission failed: {}", err);
                        self.stages.set(slot, BundleStage::SubmitFailed);
                        if presenting {
                            self.present.record(PresentOutcome::Failed(
                                ash::vk::Result::ERROR_DEVICE_LOST,
                            ));
                        }
                        submit_error = Some(err);
                    }
                }
            }
        }

        if wait_for_completion {
            self.wait_for_command_buffer(slot)?;
        }
        if presenting {
            self.advance_frame()?;
        }

        let next = (slot + 1) % self.bundles.len();
        self.begin_bundle(next)?;

        match submit_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Blocks until `counter` is known complete, then runs every deferred
    /// destruction at or below the new watermark. Returns immediately if it
    /// already is.
    pub fn wait_for_fence_counter(&mut self, counter: u64) -> Result<(), GpuError> {
        if counter <= self.completed_fence_counter {
            return Ok(());
        }
        // The open bundle's counter has no submission behind it yet.
        debug_assert!(
            counter < self.bundles[self.current_slot].fence_counter,
            "waiting on a fence counter that has not been submitted"
        );

        // Scan from the oldest outstanding bundle; the ring is strictly
        // ordered, so waiting on the first bundle at or past `counter`
        // transitively covers everything older.
        let ring = self.bundles.len();
        for i in 1..ring {
            let slot = (self.current_slot + i) % ring;
            if self.stages.get(slot) == BundleStage::Recording {
                continue;
            }
            if self.bundles[slot].fence_counter >= counter {
                return self.wait_for_command_buffer(slot);
            }
        }
        Ok(())
    }

    /// Blocks until the submission worker has drained its queue. Required
    /// before waiting directly on any fence that might still be sitting in
    /// the worker's queue.
    pub fn wait_for_worker_thread_idle(&self) {
        if let Some(worker) = &self.worker {
            worker.wait_idle();
        }
    }

    /// Drains the worker, waits out all outstanding GPU work, runs every
    /// remaining deferred destruction and releases the descriptor pools.
    pub fn destroy(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }

        let ring = self.bundles.len();
        for i in 1..ring {
            let slot = (self.current_slot + i) % ring;
            if self.stages.get(slot) != BundleStage::Submitted {
                continue;
            }
            if self.bundles[slot].fence_counter > self.completed_fence_counter {
                if let Err(err) = self.backend.wait_fence(slot) {
                    log::error!("fence wait during teardown failed: {}", err);
                }
            }
        }

        let backend = Arc::clone(&self.backend);
        for bundle in &mut self.bundles {
            for cleanup in bundle.cleanups.drain(..) {
                backend.execute_cleanup(cleanup);
            }
        }
        for resources in self.frames.iter_mut() {
            for pool in resources.pools.drain(..) {
                backend.destroy_descriptor_pool(pool);
            }
        }
    }

    /// Descriptor pool for the current rendering frame.
    pub fn descriptor_pool(&self) -> &B::DescriptorPool {
        let resources = self.frames.current(self.current_frame);
        &resources.pools[resources.current_pool]
    }

    /// Appends another pool for the current frame after the active one ran
    /// out of sets mid-frame. The rotation step rebalances later.
    pub fn grow_descriptor_pool(&mut self) -> Result<&B::DescriptorPool, GpuError> {
        let backend = Arc::clone(&self.backend);
        let resources = self.frames.current_mut(self.current_frame);
        let pool = backend.create_descriptor_pool(resources.sets_per_pool)?;
        resources.pools.push(pool);
        resources.current_pool = resources.pools.len() - 1;
        log::debug!(
            "descriptor pool overflow, now {} pools for frame {}",
            resources.pools.len(),
            self.current_frame
        );
        Ok(&resources.pools[resources.current_pool])
    }

    fn begin_bundle(&mut self, slot: usize) -> Result<(), GpuError> {
        if self.bundles[slot].fence_counter > self.completed_fence_counter {
            self.wait_for_command_buffer(slot)?;
        }
        self.backend.reset_fence(slot)?;
        self.backend.begin_bundle(slot)?;

        let counter = self.next_fence_counter;
        self.next_fence_counter += 1;

        let bundle = &mut self.bundles[slot];
        debug_assert!(bundle.cleanups.is_empty());
        bundle.fence_counter = counter;
        bundle.frame_index = self.current_frame;
        bundle.init_used = false;
        bundle.semaphore_used = false;

        self.stages.set(slot, BundleStage::Recording);
        self.current_slot = slot;
        Ok(())
    }

    fn wait_for_command_buffer(&mut self, slot: usize) -> Result<(), GpuError> {
        // A bundle still queued on the worker has no fence on the GPU yet.
        if self.stages.get(slot) == BundleStage::SubmitPending {
            self.wait_for_worker_thread_idle();
        }
        let counter = self.bundles[slot].fence_counter;
        if self.stages.get(slot) != BundleStage::SubmitFailed {
            self.backend.wait_fence(slot)?;
        }
        self.retire_up_to(counter);
        Ok(())
    }

    fn retire_up_to(&mut self, counter: u64) {
        if counter <= self.completed_fence_counter {
            return;
        }
        self.completed_fence_counter = counter;

        let backend = Arc::clone(&self.backend);
        for bundle in &mut self.bundles {
            if bundle.fence_counter <= counter && !bundle.cleanups.is_empty() {
                for cleanup in bundle.cleanups.drain(..) {
                    backend.execute_cleanup(cleanup);
                }
            }
        }
    }

    /// Rotates to the next rendering frame and resets its descriptor
    /// pools, first waiting out every other bundle still tagged with that
    /// frame index so no in-flight command buffer references a set from
    /// the pools being reset.
    fn advance_frame(&mut self) -> Result<(), GpuError> {
        self.current_frame = (self.current_frame + 1) % self.frames.len() as u32;
        let frame = self.current_frame;

        let ring = self.bundles.len();
        for i in 1..ring {
            let slot = (self.current_slot + i) % ring;
            if self.stages.get(slot) == BundleStage::Recording {
                continue;
            }
            if self.bundles[slot].frame_index == frame
                && self.bundles[slot].fence_counter > self.completed_fence_counter
            {
                self.wait_for_command_buffer(slot)?;
            }
        }

        self.reset_frame_resources(frame)
    }

    fn reset_frame_resources(&mut self, frame: u32) -> Result<(), GpuError> {
        let backend = Arc::clone(&self.backend);
        let rebalance = self.growth == DescriptorPoolGrowth::RebalanceToPeak;
        let resources = self.frames.current_mut(frame);

        if rebalance && resources.pools.len() > 1 {
            // The single pool overflowed last time this frame was live;
            // replace the lot with one pool sized to the peak demand.
            let peak = resources
                .sets_per_pool
                .saturating_mul(resources.pools.len() as u32);
            for pool in resources.pools.drain(..) {
                backend.destroy_descriptor_pool(pool);
            }
            resources.pools.push(backend.create_descriptor_pool(peak)?);
            resources.sets_per_pool = peak;
        } else {
            for pool in resources.pools.iter() {
                backend.reset_descriptor_pool(pool)?;
            }
        }
        resources.current_pool = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::backend::mock::{Event, MockBackend, MockCleanup};

    fn default_pool(backend: &Arc<MockBackend>) -> CommandBufferPool<MockBackend> {
        CommandBufferPool::new(Arc::clone(backend), PoolConfig::default()).unwrap()
    }

    #[test]
    fn counters_start_at_one_and_increase_per_submission() {
        let backend = Arc::new(MockBackend::fast(2));
        let mut pool = default_pool(&backend);

        assert_eq!(pool.current_fence_counter(), 1);
        assert_eq!(pool.completed_fence_counter(), 0);

        pool.submit_command_buffer(None, false, false).unwrap();
        assert_eq!(pool.current_fence_counter(), 2);

        // Wrapping back to the first slot forces a wait on counter 1.
        pool.submit_command_buffer(None, false, false).unwrap();
        assert_eq!(pool.current_fence_counter(), 3);
        assert_eq!(pool.completed_fence_counter(), 1);

        pool.destroy();
    }

    #[test]
    fn reusing_a_ring_slot_blocks_until_its_fence_signals() {
        let backend = Arc::new(MockBackend::manual(2));
        let mut pool = default_pool(&backend);

        pool.submit_command_buffer(None, false, false).unwrap();

        let signaler = Arc::clone(&backend);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            signaler.signal_fence(0);
        });

        // Wrapping back to slot 0 must not begin recording while its prior
        // submission is outstanding.
        let start = Instant::now();
        pool.submit_command_buffer(None, false, false).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));

        handle.join().unwrap();
        backend.signal_fence(1);
        pool.destroy();
    }

    #[test]
    fn wait_for_fence_counter_blocks_until_signal() {
        let backend = Arc::new(MockBackend::manual(2));
        let mut pool = default_pool(&backend);

        pool.submit_command_buffer(None, false, false).unwrap();
        // Already-completed counters return without touching any fence.
        pool.wait_for_fence_counter(0).unwrap();

        let signaler = Arc::clone(&backend);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            signaler.signal_fence(0);
        });

        let start = Instant::now();
        pool.wait_for_fence_counter(1).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(pool.completed_fence_counter(), 1);

        handle.join().unwrap();
        pool.destroy();
    }

    #[test]
    fn deferred_destruction_runs_only_after_completion() {
        let backend = Arc::new(MockBackend::manual(2));
        let ran = Arc::new(AtomicUsize::new(0));
        let mut pool = default_pool(&backend);

        pool.defer_destruction(MockCleanup::new(&ran));
        pool.submit_command_buffer(None, false, false).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        backend.signal_fence(0);
        pool.wait_for_fence_counter(1).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        pool.destroy();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn multiple_deferred_destructions_on_one_bundle_each_run_once() {
        let backend = Arc::new(MockBackend::manual(2));
        let ran = Arc::new(AtomicUsize::new(0));
        let mut pool = default_pool(&backend);

        pool.defer_destruction(MockCleanup::new(&ran));
        pool.defer_destruction(MockCleanup::new(&ran));
        pool.submit_command_buffer(None, false, false).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        backend.signal_fence(0);
        pool.wait_for_fence_counter(1).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 2);

        pool.destroy();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[should_panic(expected = "not been submitted")]
    fn waiting_on_the_open_bundles_counter_is_rejected() {
        let backend = Arc::new(MockBackend::fast(2));
        let mut pool = default_pool(&backend);
        // Counter 1 belongs to the bundle still being recorded.
        let _ = pool.wait_for_fence_counter(1);
    }

    #[test]
    fn present_state_keeps_outcome_and_code_paired() {
        let state = PresentState::new();
        assert!(state.load().is_none());

        state.record(PresentOutcome::NeedsRecreation(
            ash::vk::Result::ERROR_OUT_OF_DATE_KHR,
        ));
        assert_eq!(
            state.load(),
            Some(PresentOutcome::NeedsRecreation(
                ash::vk::Result::ERROR_OUT_OF_DATE_KHR
            ))
        );

        state.record(PresentOutcome::Failed(ash::vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(
            state.load(),
            Some(PresentOutcome::Failed(ash::vk::Result::ERROR_DEVICE_LOST))
        );

        state.record(PresentOutcome::Presented);
        assert_eq!(state.load(), Some(PresentOutcome::Presented));
    }

    #[test]
    fn wait_for_completion_drains_cleanups_before_returning() {
        let backend = Arc::new(MockBackend::fast(2));
        let ran = Arc::new(AtomicUsize::new(0));
        let mut pool = default_pool(&backend);

        pool.defer_destruction(MockCleanup::new(&ran));
        pool.submit_command_buffer(None, true, false).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        pool.destroy();
    }

    #[test]
    fn teardown_drains_outstanding_cleanups() {
        let backend = Arc::new(MockBackend::manual(2));
        let ran = Arc::new(AtomicUsize::new(0));
        let mut pool = default_pool(&backend);

        pool.defer_destruction(MockCleanup::new(&ran));
        pool.submit_command_buffer(None, false, false).unwrap();
        pool.defer_destruction(MockCleanup::new(&ran));

        backend.signal_fence(0);
        pool.destroy();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_submission_does_not_wedge_the_ring() {
        let backend = Arc::new(MockBackend::manual(2));
        let mut pool = default_pool(&backend);

        backend.fail_next_submit();
        assert!(pool.submit_command_buffer(None, false, false).is_err());

        // The dead bundle's fence will never signal; the ring must still
        // wrap past it.
        pool.submit_command_buffer(None, false, false).unwrap();
        assert_eq!(pool.current_fence_counter(), 3);
        assert_eq!(pool.completed_fence_counter(), 1);

        backend.signal_fence(1);
        pool.destroy();
    }

    #[test]
    fn init_buffer_and_semaphore_usage_is_tracked_per_bundle() {
        let backend = Arc::new(MockBackend::fast(2));
        let mut pool = default_pool(&backend);

        assert_eq!(pool.current_command_buffer(), 0);
        assert_eq!(pool.current_init_command_buffer(), 1);
        assert_eq!(pool.current_semaphore(), 0);
        pool.submit_command_buffer(None, false, false).unwrap();
        pool.submit_command_buffer(None, false, false).unwrap();

        let submits: Vec<Event> = backend
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Submit { .. }))
            .collect();
        assert_eq!(
            submits,
            vec![
                Event::Submit {
                    slot: 0,
                    init_used: true,
                    semaphore_used: true,
                    present: false,
                },
                Event::Submit {
                    slot: 1,
                    init_used: false,
                    semaphore_used: false,
                    present: false,
                },
            ]
        );

        pool.destroy();
    }

    #[test]
    fn present_outcomes_are_recorded_and_classified() {
        let backend = Arc::new(MockBackend::fast(2));
        let mut pool = default_pool(&backend);

        assert!(pool.last_present_outcome().is_none());
        pool.submit_command_buffer(Some(7), false, false).unwrap();
        assert_eq!(pool.last_present_outcome(), Some(PresentOutcome::Presented));
        assert!(pool.present_error().is_none());

        backend.set_present_outcome(PresentOutcome::NeedsRecreation(
            ash::vk::Result::ERROR_OUT_OF_DATE_KHR,
        ));
        pool.submit_command_buffer(Some(8), false, false).unwrap();
        assert_eq!(
            pool.last_present_outcome(),
            Some(PresentOutcome::NeedsRecreation(
                ash::vk::Result::ERROR_OUT_OF_DATE_KHR
            ))
        );
        match pool.present_error() {
            Some(GpuError::PresentFailed { transient, .. }) => assert!(transient),
            other => panic!("unexpected present error: {:?}", other),
        }

        pool.destroy();
    }

    #[test]
    fn frame_rotation_waits_before_resetting_descriptor_pools() {
        let backend = Arc::new(MockBackend::fast(2));
        let config = PoolConfig {
            num_frames: 2,
            ..PoolConfig::default()
        };
        let mut pool = CommandBufferPool::new(Arc::clone(&backend), config).unwrap();

        pool.submit_command_buffer(Some(1), false, false).unwrap();
        pool.submit_command_buffer(Some(2), false, false).unwrap();

        // Rotating back to frame 0 must wait out the bundle recorded for
        // it before its descriptor pool is reset.
        let events = backend.events();
        let wait = events
            .iter()
            .position(|e| *e == Event::WaitFence(0))
            .expect("no fence wait for frame 0");
        let reset = events
            .iter()
            .position(|e| *e == Event::ResetDescriptorPool(0))
            .expect("frame 0 pool never reset");
        assert!(wait < reset);

        pool.destroy();
    }

    #[test]
    fn descriptor_pool_overflow_rebalances_to_peak() {
        let backend = Arc::new(MockBackend::fast(2));
        let config = PoolConfig {
            num_frames: 2,
            descriptor_sets_per_pool: 64,
            ..PoolConfig::default()
        };
        let mut pool = CommandBufferPool::new(Arc::clone(&backend), config).unwrap();

        // Frame 0 overflows into a second pool.
        assert_eq!(*pool.descriptor_pool(), 0);
        pool.grow_descriptor_pool().unwrap();
        assert_eq!(*pool.descriptor_pool(), 2);

        // Rotate through frame 1 and back to frame 0.
        pool.submit_command_buffer(Some(1), false, false).unwrap();
        pool.submit_command_buffer(Some(2), false, false).unwrap();

        let events = backend.events();
        assert!(events.contains(&Event::DestroyDescriptorPool(0)));
        assert!(events.contains(&Event::DestroyDescriptorPool(2)));
        assert!(events.contains(&Event::CreateDescriptorPool {
            id: 3,
            max_sets: 128,
        }));
        assert_eq!(*pool.descriptor_pool(), 3);

        pool.destroy();
    }

    #[test]
    fn descriptor_pool_overflow_can_keep_extra_pools() {
        let backend = Arc::new(MockBackend::fast(2));
        let config = PoolConfig {
            num_frames: 2,
            descriptor_pool_growth: DescriptorPoolGrowth::KeepPools,
            ..PoolConfig::default()
        };
        let mut pool = CommandBufferPool::new(Arc::clone(&backend), config).unwrap();

        pool.grow_descriptor_pool().unwrap();
        pool.submit_command_buffer(Some(1), false, false).unwrap();
        pool.submit_command_buffer(Some(2), false, false).unwrap();

        let events = backend.events();
        assert!(!events.contains(&Event::DestroyDescriptorPool(0)));
        assert!(events.contains(&Event::ResetDescriptorPool(0)));
        assert!(events.contains(&Event::ResetDescriptorPool(2)));
        assert_eq!(*pool.descriptor_pool(), 0);

        pool.destroy();
    }

    #[test]
    fn worker_thread_performs_queued_submissions() {
        let backend = Arc::new(MockBackend::fast(2));
        let ran = Arc::new(AtomicUsize::new(0));
        let config = PoolConfig {
            use_worker_thread: true,
            ..PoolConfig::default()
        };
        let mut pool = CommandBufferPool::new(Arc::clone(&backend), config).unwrap();

        pool.defer_destruction(MockCleanup::new(&ran));
        pool.submit_command_buffer(None, false, true).unwrap();
        pool.wait_for_worker_thread_idle();

        let submits = backend
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Submit { .. }))
            .count();
        assert_eq!(submits, 1);

        pool.wait_for_fence_counter(1).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        // Direct submission flushes the worker first, so queue access
        // stays exclusive.
        pool.submit_command_buffer(None, false, false).unwrap();
        pool.destroy();
    }
}
