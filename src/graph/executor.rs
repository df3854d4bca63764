//! Executors run scheduler jobs.
//!
//! Every node is assigned to one executor: the graph's default thread pool or
//! a named executor declared in the configuration or installed with
//! `CalculatorGraph::set_executor`. The scheduler hands an executor one job per
//! queued task.

use crate::error::Result;
use crate::framework::clock::Clock;
use crossbeam_channel::{Receiver, Sender};
use std::thread::JoinHandle;
use std::sync::Arc;

/// A unit of work produced by the scheduler.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs scheduler jobs.
///
/// `schedule` must not run the job on the calling thread: the scheduler may
/// hold node locks while it queues work.
pub trait Executor: Send + Sync {
    fn schedule(&self, job: Job);

    /// Number of jobs that can run at the same time.
    fn num_threads(&self) -> usize;
}

/// Fixed-size pool of named worker threads fed through a channel.
pub struct ThreadPoolExecutor {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolExecutor {
    /// Spawn `num_threads` workers named `{name}-{i}`.
    ///
    /// Workers report job boundaries to `clock` so a simulation clock knows
    /// when every thread is idle.
    pub fn new(name: impl Into<String>, num_threads: usize, clock: Arc<dyn Clock>) -> Result<Self> {
        let name = name.into();
        let num_threads = num_threads.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let receiver = receiver.clone();
            let clock = Arc::clone(&clock);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || worker_loop(receiver, clock))?;
            workers.push(handle);
        }

        tracing::debug!(executor = %name, num_threads, "started thread pool");
        Ok(Self {
            name,
            sender: Some(sender),
            workers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn worker_loop(receiver: Receiver<Job>, clock: Arc<dyn Clock>) {
    while let Ok(job) = receiver.recv() {
        clock.thread_start();
        job();
        clock.thread_finish();
    }
}

impl Executor for ThreadPoolExecutor {
    fn schedule(&self, job: Job) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(job).is_err() {
            tracing::error!(executor = %self.name, "executor stopped, job dropped");
        }
    }

    fn num_threads(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop once the queue drains.
        self.sender.take();
        let current = std::thread::current().id();
        for handle in self.workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!(executor = %self.name, "worker thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("name", &self.name)
            .field("num_threads", &self.workers.len())
            .finish()
    }
}
