use ash::vk;

use crate::error::GpuError;

/// Result of a present issued right after a queue submission.
///
/// Transient conditions (surface suboptimal or out of date) are not
/// failures: the work was submitted and will be waited on normally, the
/// caller only has to recreate the swap chain before the next present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    NeedsRecreation(vk::Result),
    Failed(vk::Result),
}

/// The native primitives the command-buffer ring is built on, indexed by
/// ring slot. The production implementation records and submits through a
/// real Vulkan queue; tests drive the ring with controllable fences.
///
/// All methods take `&self`: distinct slots own distinct native objects,
/// and the one shared object (the queue) is behind a lock inside the
/// implementation, so the recording thread and the submission worker can
/// both call in without coordination beyond what the pool already does.
pub trait Backend: Send + Sync + 'static {
    type CommandBuffer: Copy + Send;
    type Semaphore: Copy + Send;
    type DescriptorPool: Send;
    type PresentTarget: Send;
    type Cleanup: Send;

    /// Number of bundle slots this backend was created with.
    fn ring_size(&self) -> usize;

    fn command_buffer(&self, slot: usize) -> Self::CommandBuffer;
    fn init_command_buffer(&self, slot: usize) -> Self::CommandBuffer;
    fn semaphore(&self, slot: usize) -> Self::Semaphore;

    /// Resets the slot's command pool and opens both of its command buffers
    /// for recording. The slot's fence must not be in flight.
    fn begin_bundle(&self, slot: usize) -> Result<(), GpuError>;

    /// Closes recording on both of the slot's command buffers.
    fn end_bundle(&self, slot: usize) -> Result<(), GpuError>;

    /// Blocks until the slot's fence is signaled. No-op if it already is.
    fn wait_fence(&self, slot: usize) -> Result<(), GpuError>;

    fn reset_fence(&self, slot: usize) -> Result<(), GpuError>;

    /// Submits the slot's command buffers (the init buffer only when it was
    /// used), signaling the slot's fence, and presents right after when a
    /// target is given. Returns the present outcome, or `None` when no
    /// present was requested.
    fn submit(
        &self,
        slot: usize,
        init_used: bool,
        semaphore_used: bool,
        present: Option<&Self::PresentTarget>,
    ) -> Result<Option<PresentOutcome>, GpuError>;

    fn execute_cleanup(&self, cleanup: Self::Cleanup);

    fn create_descriptor_pool(&self, max_sets: u32) -> Result<Self::DescriptorPool, GpuError>;
    fn reset_descriptor_pool(&self, pool: &Self::DescriptorPool) -> Result<(), GpuError>;
    fn destroy_descriptor_pool(&self, pool: Self::DescriptorPool);
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    };

    use parking_lot::{Condvar, Mutex};

    use super::{Backend, PresentOutcome};
    use crate::error::GpuError;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) enum Event {
        BeginBundle(usize),
        EndBundle(usize),
        WaitFence(usize),
        ResetFence(usize),
        Submit {
            slot: usize,
            init_used: bool,
            semaphore_used: bool,
            present: bool,
        },
        Cleanup,
        CreateDescriptorPool { id: u32, max_sets: u32 },
        ResetDescriptorPool(u32),
        DestroyDescriptorPool(u32),
    }

    /// Counts how many times it ran; stands in for a native destroy call.
    pub(crate) struct MockCleanup(Arc<AtomicUsize>);

    impl MockCleanup {
        pub(crate) fn new(ran: &Arc<AtomicUsize>) -> MockCleanup {
            MockCleanup(Arc::clone(ran))
        }
    }

    pub(crate) struct MockBackend {
        ring: usize,
        fences: Mutex<Vec<bool>>,
        signal: Condvar,
        auto_signal: bool,
        fail_submit: AtomicBool,
        present_outcome: Mutex<PresentOutcome>,
        next_pool_id: AtomicU32,
        events: Mutex<Vec<Event>>,
    }

    impl MockBackend {
        /// Fences signal on their own the moment the slot is submitted.
        pub(crate) fn fast(ring: usize) -> MockBackend {
            MockBackend::with_auto_signal(ring, true)
        }

        /// Fences signal only when the test calls `signal_fence`.
        pub(crate) fn manual(ring: usize) -> MockBackend {
            MockBackend::with_auto_signal(ring, false)
        }

        fn with_auto_signal(ring: usize, auto_signal: bool) -> MockBackend {
            MockBackend {
                ring,
                // created signaled, like the real fences
                fences: Mutex::new(vec![true; ring]),
                signal: Condvar::new(),
                auto_signal,
                fail_submit: AtomicBool::new(false),
                present_outcome: Mutex::new(PresentOutcome::Presented),
                next_pool_id: AtomicU32::new(0),
                events: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn signal_fence(&self, slot: usize) {
            self.fences.lock()[slot] = true;
            self.signal.notify_all();
        }

        pub(crate) fn fail_next_submit(&self) {
            self.fail_submit.store(true, Ordering::SeqCst);
        }

        pub(crate) fn set_present_outcome(&self, outcome: PresentOutcome) {
            *self.present_outcome.lock() = outcome;
        }

        pub(crate) fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }

        fn record(&self, event: Event) {
            self.events.lock().push(event);
        }
    }

    impl Backend for MockBackend {
        type CommandBuffer = usize;
        type Semaphore = usize;
        type DescriptorPool = u32;
        type PresentTarget = u32;
        type Cleanup = MockCleanup;

        fn ring_size(&self) -> usize {
            self.ring
        }

        fn command_buffer(&self, slot: usize) -> usize {
            slot * 2
        }

        fn init_command_buffer(&self, slot: usize) -> usize {
            slot * 2 + 1
        }

        fn semaphore(&self, slot: usize) -> usize {
            slot
        }

        fn begin_bundle(&self, slot: usize) -> Result<(), GpuError> {
            self.record(Event::BeginBundle(slot));
            Ok(())
        }

        fn end_bundle(&self, slot: usize) -> Result<(), GpuError> {
            self.record(Event::EndBundle(slot));
            Ok(())
        }

        fn wait_fence(&self, slot: usize) -> Result<(), GpuError> {
            self.record(Event::WaitFence(slot));
            let mut fences = self.fences.lock();
            while !fences[slot] {
                self.signal.wait(&mut fences);
            }
            Ok(())
        }

        fn reset_fence(&self, slot: usize) -> Result<(), GpuError> {
            self.record(Event::ResetFence(slot));
            self.fences.lock()[slot] = false;
            Ok(())
        }

        fn submit(
            &self,
            slot: usize,
            init_used: bool,
            semaphore_used: bool,
            present: Option<&u32>,
        ) -> Result<Option<PresentOutcome>, GpuError> {
            self.record(Event::Submit {
                slot,
                init_used,
                semaphore_used,
                present: present.is_some(),
            });
            if self.fail_submit.swap(false, Ordering::SeqCst) {
                return Err(GpuError::SubmitFailed(
                    ash::vk::Result::ERROR_DEVICE_LOST,
                ));
            }
            if self.auto_signal {
                self.signal_fence(slot);
            }
            Ok(present.map(|_| *self.present_outcome.lock()))
        }

        fn execute_cleanup(&self, cleanup: MockCleanup) {
            self.record(Event::Cleanup);
            cleanup.0.fetch_add(1, Ordering::SeqCst);
        }

        fn create_descriptor_pool(&self, max_sets: u32) -> Result<u32, GpuError> {
            let id = self.next_pool_id.fetch_add(1, Ordering::SeqCst);
            self.record(Event::CreateDescriptorPool { id, max_sets });
            Ok(id)
        }

        fn reset_descriptor_pool(&self, pool: &u32) -> Result<(), GpuError> {
            self.record(Event::ResetDescriptorPool(*pool));
            Ok(())
        }

        fn destroy_descriptor_pool(&self, pool: u32) {
            self.record(Event::DestroyDescriptorPool(pool));
        }
    }
}
