//! Auto-scaling worker pools
//!
//! One pool per phase (download, upload). Jobs queue in memory only as a
//! burst-smoothing cache; durability lives in the external queue, so a lost
//! process loses nothing that will not be redelivered.
//!
//! Scaling controller: grow by one worker when the queue depth stays over
//! the threshold for more than `grow_after` while under `max`; a worker
//! retires itself after `idle_shrink` without work, bounded by `min`.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub name: &'static str,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Queue depth that triggers growth
    pub depth_threshold: usize,
    /// Depth must stay over the threshold this long before growing
    pub grow_after: Duration,
    /// Idle time before a surplus worker retires
    pub idle_shrink: Duration,
}

impl WorkerPoolConfig {
    pub fn download() -> Self {
        Self {
            name: "download",
            min_workers: 1,
            max_workers: 4,
            depth_threshold: 3,
            grow_after: Duration::from_secs(5),
            idle_shrink: Duration::from_secs(30),
        }
    }

    pub fn upload() -> Self {
        Self {
            name: "upload",
            min_workers: 1,
            max_workers: 3,
            depth_threshold: 3,
            grow_after: Duration::from_secs(5),
            idle_shrink: Duration::from_secs(30),
        }
    }
}

type Handler<T> = dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync;

struct PoolInner<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    active: AtomicUsize,
    busy: AtomicUsize,
    handler: Box<Handler<T>>,
    config: WorkerPoolConfig,
}

/// MPMC job pool with an auto-scaling worker set.
pub struct WorkerPool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Clone for WorkerPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<F, Fut>(config: WorkerPoolConfig, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(PoolInner {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                active: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                handler: Box::new(move |job| Box::pin(handler(job))),
                config,
            }),
        }
    }

    /// Spawn the minimum worker set and the scaling controller.
    pub fn start(&self) {
        for _ in 0..self.inner.config.min_workers {
            Self::spawn_worker(Arc::clone(&self.inner));
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Self::controller(inner).await;
        });
    }

    /// Enqueue a job; a waiting worker picks it up.
    pub fn submit(&self, job: T) {
        self.inner.queue.lock().push_back(job);
        self.inner.notify.notify_one();
    }

    /// Remove queued jobs matching the predicate (cancellation path).
    /// Returns how many were removed.
    pub fn remove_where<P: FnMut(&T) -> bool>(&self, mut predicate: P) -> usize {
        let mut queue = self.inner.queue.lock();
        let before = queue.len();
        queue.retain(|job| !predicate(job));
        before - queue.len()
    }

    pub fn depth(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn busy_workers(&self) -> usize {
        self.inner.busy.load(Ordering::SeqCst)
    }

    fn spawn_worker(inner: Arc<PoolInner<T>>) {
        inner.active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            loop {
                let job = {
                    let mut queue = inner.queue.lock();
                    queue.pop_front()
                };

                match job {
                    Some(job) => {
                        inner.busy.fetch_add(1, Ordering::SeqCst);
                        (inner.handler)(job).await;
                        inner.busy.fetch_sub(1, Ordering::SeqCst);
                    }
                    None => {
                        let idle_deadline =
                            tokio::time::sleep(inner.config.idle_shrink);
                        tokio::pin!(idle_deadline);
                        tokio::select! {
                            _ = inner.notify.notified() => {}
                            _ = &mut idle_deadline => {
                                // Retire if we are surplus.
                                let active = inner.active.load(Ordering::SeqCst);
                                if active > inner.config.min_workers {
                                    inner.active.fetch_sub(1, Ordering::SeqCst);
                                    tracing::debug!(
                                        pool = inner.config.name,
                                        remaining = active - 1,
                                        "idle worker retired"
                                    );
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    async fn controller(inner: Arc<PoolInner<T>>) {
        let mut over_since: Option<Instant> = None;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let depth = inner.queue.lock().len();
            let active = inner.active.load(Ordering::SeqCst);

            if depth > inner.config.depth_threshold && active < inner.config.max_workers {
                let since = *over_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= inner.config.grow_after {
                    tracing::info!(
                        pool = inner.config.name,
                        depth,
                        workers = active + 1,
                        "scaling worker pool up"
                    );
                    Self::spawn_worker(Arc::clone(&inner));
                    over_since = None;
                }
            } else {
                over_since = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn test_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            name: "test",
            min_workers: 1,
            max_workers: 3,
            depth_threshold: 2,
            grow_after: Duration::from_millis(50),
            idle_shrink: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn jobs_are_processed() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_in = counter.clone();
        let pool = WorkerPool::new(test_config(), move |n: u32| {
            let counter = counter_in.clone();
            async move {
                counter.fetch_add(n, Ordering::SeqCst);
            }
        });
        pool.start();

        for _ in 0..5 {
            pool.submit(1);
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while counter.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all jobs processed");
    }

    #[tokio::test]
    async fn remove_where_drops_queued_jobs() {
        // No workers started: jobs stay queued.
        let pool = WorkerPool::new(test_config(), |_n: u32| async {});
        pool.submit(1);
        pool.submit(2);
        pool.submit(3);

        assert_eq!(pool.remove_where(|n| *n == 2), 1);
        assert_eq!(pool.depth(), 2);
    }

    #[tokio::test]
    async fn pool_scales_up_under_sustained_depth() {
        let gate = Arc::new(Notify::new());
        let gate_in = gate.clone();
        let pool = WorkerPool::new(test_config(), move |_n: u32| {
            let gate = gate_in.clone();
            async move {
                gate.notified().await;
            }
        });
        pool.start();

        // Saturate the single worker and build a backlog.
        for _ in 0..8 {
            pool.submit(1);
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.active_workers() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("pool grew");

        // Release the workers so the runtime can wind down.
        for _ in 0..16 {
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
