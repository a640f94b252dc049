// src/worker.rs
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

/// A fire-and-forget unit of work for [`WorkerPool::for_tasks`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

type Handler<J> = Arc<dyn Fn(J) + Send + Sync + 'static>;

struct Queue<J> {
    jobs: VecDeque<J>,
    closing: bool,
}

struct Shared<J> {
    queue: Mutex<Queue<J>>,
    not_empty: Condvar,
}

impl<J> Shared<J> {
    // A panicking job must not wedge the whole pool behind a poisoned lock.
    fn lock(&self) -> MutexGuard<'_, Queue<J>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed set of threads consuming one shared job queue.
///
/// Every job is handed to the same handler. Jobs carry all the context a
/// worker needs; nothing is returned to the submitter.
pub struct WorkerPool<J: Send + 'static> {
    shared: Arc<Shared<J>>,
    handles: Vec<JoinHandle<()>>,
}

impl<J: Send + 'static> WorkerPool<J> {
    pub fn new<H>(threads: usize, handler: H) -> io::Result<Self>
    where
        H: Fn(J) + Send + Sync + 'static,
    {
        Self::build(threads, false, Arc::new(handler))
    }

    /// Like `new`, but each worker is pinned to a CPU core (wrapping around
    /// when there are more workers than cores).
    pub fn pinned<H>(threads: usize, handler: H) -> io::Result<Self>
    where
        H: Fn(J) + Send + Sync + 'static,
    {
        Self::build(threads, true, Arc::new(handler))
    }

    fn build(threads: usize, pin: bool, handler: Handler<J>) -> io::Result<Self> {
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                closing: false,
            }),
            not_empty: Condvar::new(),
        });
        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut pool = Self {
            shared,
            handles: Vec::with_capacity(threads),
        };
        for i in 0..threads {
            let shared = pool.shared.clone();
            let handler = handler.clone();
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };

            let handle = thread::Builder::new()
                .name(format!("webserv-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            tracing::debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            tracing::warn!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }
                    worker_loop(&shared, &*handler);
                });
            match handle {
                Ok(h) => pool.handles.push(h),
                Err(e) => {
                    // Joins whatever did start before reporting.
                    pool.shutdown();
                    return Err(e);
                }
            }
        }
        tracing::debug!(threads, "worker pool started");
        Ok(pool)
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Queue a job and wake one idle worker.
    pub fn submit(&self, job: J) {
        {
            let mut queue = self.shared.lock();
            queue.jobs.push_back(job);
        }
        self.shared.not_empty.notify_one();
    }

    /// Number of jobs waiting for a worker.
    pub fn pending(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    /// Stop the workers once the queue is drained and join them.
    pub fn shutdown(&mut self) {
        {
            let mut queue = self.shared.lock();
            queue.closing = true;
        }
        self.shared.not_empty.notify_all();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl WorkerPool<Task> {
    /// Pool whose jobs are the closures themselves.
    pub fn for_tasks(threads: usize) -> io::Result<Self> {
        Self::new(threads, |task: Task| task())
    }
}

impl<J: Send + 'static> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<J>(shared: &Shared<J>, handler: &(dyn Fn(J) + Send + Sync)) {
    loop {
        let job = {
            let mut queue = shared.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.closing {
                    return;
                }
                queue = shared
                    .not_empty
                    .wait(queue)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };
        // Lock is released here; the job runs unlocked.
        if panic::catch_unwind(AssertUnwindSafe(|| handler(job))).is_err() {
            tracing::error!("job panicked; worker continues");
        }
    }
}
