use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::{
    backend::{Backend, PresentOutcome},
    commands::{BundleStage, BundleStages, PresentState},
    error::GpuError,
};

/// One queued submission. Mirrors the arguments of the synchronous path.
pub(crate) struct SubmitRequest<B: Backend> {
    pub(crate) slot: usize,
    pub(crate) init_used: bool,
    pub(crate) semaphore_used: bool,
    pub(crate) present: Option<B::PresentTarget>,
}

struct State<B: Backend> {
    queue: VecDeque<SubmitRequest<B>>,
    busy: bool,
    shutdown: bool,
}

struct Shared<B: Backend> {
    backend: Arc<B>,
    stages: Arc<BundleStages>,
    present: Arc<PresentState>,
    state: Mutex<State<B>>,
    work_ready: Condvar,
    work_done: Condvar,
}

/// Background thread that performs queue submissions and presents so the
/// recording thread never stalls on the driver. Requests finish in FIFO
/// order; shutdown drains the queue before the thread exits.
pub(crate) struct SubmissionWorker<B: Backend> {
    shared: Arc<Shared<B>>,
    thread: Option<JoinHandle<()>>,
}

impl<B: Backend> SubmissionWorker<B> {
    pub(crate) fn spawn(
        backend: Arc<B>,
        stages: Arc<BundleStages>,
        present: Arc<PresentState>,
    ) -> Result<SubmissionWorker<B>, GpuError> {
        let shared = Arc::new(Shared {
            backend,
            stages,
            present,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                busy: false,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
            work_done: Condvar::new(),
        });

        let for_thread = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("cmdstream-submit".into())
            .spawn(move || run(for_thread))?;

        Ok(SubmissionWorker {
            shared,
            thread: Some(thread),
        })
    }

    pub(crate) fn enqueue(&self, request: SubmitRequest<B>) {
        let mut state = self.shared.state.lock();
        state.queue.push_back(request);
        self.shared.work_ready.notify_one();
    }

    /// Blocks until the queue is empty and no submission is in flight.
    pub(crate) fn wait_idle(&self) {
        profiling::scope!("worker idle wait");
        let mut state = self.shared.state.lock();
        while state.busy || !state.queue.is_empty() {
            self.shared.work_done.wait(&mut state);
        }
    }

    /// Finishes everything still queued, then joins the thread.
    pub(crate) fn shutdown(mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work_ready.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("submission worker thread panicked");
            }
        }
    }
}

fn run<B: Backend>(shared: Arc<Shared<B>>) {
    loop {
        let request = {
            let mut state = shared.state.lock();
            loop {
                if let Some(request) = state.queue.pop_front() {
                    state.busy = true;
                    break request;
                }
                // Only quit on an empty queue so pending work drains.
                if state.shutdown {
                    return;
                }
                shared.work_ready.wait(&mut state);
            }
        };

        // The submission runs outside the lock; the slot's stage keeps the
        // recording thread from waiting on a fence that is not queued yet.
        let outcome = {
            profiling::scope!("worker submit");
            shared.backend.submit(
                request.slot,
                request.init_used,
                request.semaphore_used,
                request.present.as_ref(),
            )
        };
        match outcome {
            Ok(outcome) => {
                shared.stages.set(request.slot, BundleStage::Submitted);
                if let Some(outcome) = outcome {
                    shared.present.record(outcome);
                }
            }
            Err(err) => {
                log::error!("worker submission failed: {}", err);
                shared.stages.set(request.slot, BundleStage::SubmitFailed);
                if request.present.is_some() {
                    shared
                        .present
                        .record(PresentOutcome::Failed(ash::vk::Result::ERROR_DEVICE_LOST));
                }
            }
        }

        let mut state = shared.state.lock();
        state.busy = false;
        if state.queue.is_empty() {
            shared.work_done.notify_all();
        }
    }
}
