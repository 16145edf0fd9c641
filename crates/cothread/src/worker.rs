//! Worker thread management
//!
//! Workers are OS threads that drive one shared scheduler by calling
//! `Scheduler::run` until it is stopped.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cothread_core::{kdebug, kerror, kprint, WorkerError};
use cothread_runtime::Scheduler;

/// Pool of worker threads
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    num_workers: usize,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> Self {
        Self {
            handles: Vec::with_capacity(num_workers),
            num_workers,
        }
    }

    /// Start all worker threads
    ///
    /// On a spawn failure the workers started so far keep running; the
    /// caller stops the scheduler and joins them.
    pub fn start(&mut self, sched: &Arc<Scheduler>) -> Result<(), WorkerError> {
        for i in 0..self.num_workers {
            let sched = Arc::clone(sched);
            let handle = thread::Builder::new()
                .name(format!("cothread-worker-{}", i))
                .spawn(move || worker_main(i, sched))
                .map_err(|e| {
                    kerror!("failed to spawn worker {}: {}", i, e);
                    WorkerError::SpawnFailed
                })?;
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Wait for all workers to finish
    pub fn join(self) -> Result<(), WorkerError> {
        let mut result = Ok(());
        for handle in self.handles {
            if handle.join().is_err() {
                result = Err(WorkerError::Panicked);
            }
        }
        result
    }

    /// Get number of workers
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Workers actually started
    #[inline]
    pub fn started(&self) -> usize {
        self.handles.len()
    }
}

fn worker_main(id: usize, sched: Arc<Scheduler>) {
    kprint::set_worker_id(id);
    kdebug!("worker {} started", id);

    while !sched.is_stopped() {
        if let Err(e) = sched.run() {
            kerror!("worker {}: {}", id, e);
        }
    }

    kdebug!("worker {} exiting", id);
}
