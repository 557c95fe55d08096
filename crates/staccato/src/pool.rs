// src/pool.rs
//
// Fixed set of worker threads draining a bounded FIFO. Producers never block:
// `append` hands the item back when the queue is full, which is the server's
// back-pressure signal.
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::error::{ServerError, ServerResult};
use crate::sync::{Semaphore, lock};

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Number of worker threads.
    pub threads: usize,
    /// Maximum number of items waiting in the queue.
    pub max_requests: usize,
    /// Pin worker `i` to core `i % cores`.
    pub pin_cores: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            threads: 8,
            max_requests: 10_000,
            pin_cores: false,
        }
    }
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    available: Semaphore,
    stop: AtomicBool,
    max_requests: usize,
}

pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Start `threads` workers running `handler` on every appended item.
    pub fn new<F>(threads: usize, max_requests: usize, handler: F) -> ServerResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::spawn(
            PoolOptions {
                threads,
                max_requests,
                pin_cores: false,
            },
            handler,
        )
    }

    pub fn spawn<F>(options: PoolOptions, handler: F) -> ServerResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if options.threads == 0 {
            return Err(ServerError::Config("worker threads must be >= 1".to_string()));
        }
        if options.max_requests == 0 {
            return Err(ServerError::Config("max requests must be >= 1".to_string()));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(options.max_requests.min(1024))),
            available: Semaphore::new(0),
            stop: AtomicBool::new(false),
            max_requests: options.max_requests,
        });
        let handler = Arc::new(handler);
        let core_ids = if options.pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(options.threads),
        };

        for i in 0..options.threads {
            let shared = pool.shared.clone();
            let handler = handler.clone();
            let core_id = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);

            let spawned = thread::Builder::new()
                .name(format!("staccato-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            warn!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }
                    run_worker(i, &shared, handler.as_ref());
                });

            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    // Workers already started are stopped by Drop.
                    return Err(ServerError::Io(e));
                }
            }
        }

        info!(
            threads = options.threads,
            max_requests = options.max_requests,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Queue `item` for a worker. Never blocks: when the queue already holds
    /// `max_requests` items the item is handed back untouched.
    pub fn append(&self, item: T) -> Result<(), T> {
        {
            let mut queue = lock(&self.shared.queue);
            if queue.len() >= self.shared.max_requests {
                return Err(item);
            }
            queue.push_back(item);
        }
        self.shared.available.post();
        Ok(())
    }

    /// Items waiting for a worker.
    pub fn queued(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.max_requests
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop all workers and wait for them. Items still queued are dropped.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.stop.store(true, Ordering::Release);
        self.shared.available.post_many(self.workers.len());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked outside its handler");
            }
        }
        let dropped = {
            let mut queue = lock(&self.shared.queue);
            let n = queue.len();
            queue.clear();
            n
        };
        info!(dropped, "worker pool stopped");
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<T, F>(id: usize, shared: &Shared<T>, handler: &F)
where
    F: Fn(T),
{
    loop {
        shared.available.wait();
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        // Another worker may have raced us to the item this permit announced.
        let Some(item) = lock(&shared.queue).pop_front() else {
            continue;
        };

        if catch_unwind(AssertUnwindSafe(|| handler(item))).is_err() {
            error!(worker = id, "handler panicked");
        }
    }
    debug!(worker = id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_rejects_zero_sizes() {
        assert!(matches!(
            WorkerPool::<u32>::new(0, 10, |_| {}),
            Err(ServerError::Config(_))
        ));
        assert!(matches!(
            WorkerPool::<u32>::new(2, 0, |_| {}),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn test_processes_every_item() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let pool = WorkerPool::new(4, 100, move |n: u32| {
            lock(&tx).send(n * 2).unwrap();
        })
        .unwrap();
        assert_eq!(pool.threads(), 4);
        assert_eq!(pool.capacity(), 100);

        for n in 0..50 {
            pool.append(n).unwrap();
        }
        let mut seen: Vec<u32> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_overflow_is_rejected_and_order_kept() {
        let (started_tx, started_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let gate = Arc::new(Mutex::new(()));
        let held = lock(&gate);

        let worker_gate = gate.clone();
        let started_tx = Mutex::new(started_tx);
        let done_tx = Mutex::new(done_tx);
        let pool = WorkerPool::new(1, 2, move |n: u32| {
            lock(&started_tx).send(n).unwrap();
            drop(lock(&worker_gate));
            lock(&done_tx).send(n).unwrap();
        })
        .unwrap();

        // The single worker takes item 0 and blocks on the gate.
        pool.append(0).unwrap();
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);

        pool.append(1).unwrap();
        pool.append(2).unwrap();
        assert_eq!(pool.queued(), 2);
        assert_eq!(pool.append(3), Err(3));
        assert_eq!(pool.queued(), 2);

        drop(held);
        let order: Vec<u32> = (0..3)
            .map(|_| done_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_survives_handler_panic() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let pool = WorkerPool::new(1, 10, move |n: u32| {
            if n == 0 {
                panic!("boom");
            }
            lock(&tx).send(n).unwrap();
        })
        .unwrap();

        pool.append(0).unwrap();
        pool.append(7).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn test_shutdown_wakes_idle_workers() {
        let mut pool = WorkerPool::new(3, 10, |_: u32| {}).unwrap();
        pool.shutdown();
        assert_eq!(pool.threads(), 0);
        // A second shutdown (and the one in Drop) is a no-op.
        pool.shutdown();
    }
}
