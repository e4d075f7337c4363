// src/dispatch/pool.rs

//! Bounded worker pool.
//!
//! Each listener owns one pool. Receipt (push callback or pull loop)
//! submits units of work; workers execute them concurrently. The pool
//! behaves like a classic bounded executor:
//!
//! - `core_workers` workers start with the pool and live until shutdown.
//! - Work is queued while the queue has room.
//! - When the queue is full, extra workers are started up to
//!   `max_workers`; an extra worker exits after idling for `keep_alive`.
//! - When the queue is full and the pool is at `max_workers`, the
//!   [`SaturationPolicy`] decides: `Block` waits for queue space, `Reject`
//!   hands the work back to the submitter.
//!
//! Work is never dropped: rejected or abandoned work is returned through
//! [`Work::abandon`] so its message can be disposed of.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::config::{PoolSettings, SaturationPolicy};
use crate::{lock_ignore_poison, log_debug, ListenerError};

/// One unit of work.
#[async_trait::async_trait]
pub(crate) trait Work: Send + 'static {
    /// Execute the work.
    async fn run(self);

    /// Dispose of work that will not be executed.
    async fn abandon(self);
}

/// How queued work is treated at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainMode {
    /// Execute everything already queued before stopping.
    #[default]
    Complete,

    /// Negatively acknowledge queued work so the broker redelivers it.
    /// Handlers already running still finish.
    NakPending,
}

/// Why a submission did not enter the pool. Carries the work back.
pub(crate) enum SubmitError<J> {
    Saturated(J),
    Closed(J),
}

impl<J> SubmitError<J> {
    // ---
    /// Split into the returned work and the error describing the refusal.
    pub fn into_parts(self, listener: &str) -> (J, ListenerError) {
        match self {
            Self::Saturated(job) => (
                job,
                ListenerError::PoolSaturated {
                    listener: listener.to_string(),
                },
            ),
            Self::Closed(job) => (job, ListenerError::PoolClosed),
        }
    }
}

struct Shared<J> {
    // ---
    name: Arc<str>,
    keep_alive: Duration,
    rx: tokio::sync::Mutex<mpsc::Receiver<J>>,
    workers: AtomicUsize,
    busy: AtomicUsize,
    draining: AtomicBool,
}

impl<J: Work> Shared<J> {
    // ---
    async fn next(&self) -> Option<J> {
        self.rx.lock().await.recv().await
    }

    async fn execute(&self, job: J) {
        // ---
        if self.draining.load(Ordering::Acquire) {
            job.abandon().await;
            return;
        }

        self.busy.fetch_add(1, Ordering::AcqRel);
        job.run().await;
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct WorkerPool<J: Work> {
    // ---
    shared: Arc<Shared<J>>,
    tx: Mutex<Option<mpsc::Sender<J>>>,
    settings: PoolSettings,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<J: Work> WorkerPool<J> {
    // ---
    /// Create the pool and start its core workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(name: &str, settings: PoolSettings) -> Self {
        // ---
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));

        let shared = Arc::new(Shared {
            name: Arc::from(name),
            keep_alive: settings.keep_alive,
            rx: tokio::sync::Mutex::new(rx),
            workers: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        });

        let pool = Self {
            shared,
            tx: Mutex::new(Some(tx)),
            settings,
            tasks: Mutex::new(Vec::new()),
        };

        for _ in 0..pool.settings.core_workers.max(1) {
            pool.shared.workers.fetch_add(1, Ordering::AcqRel);
            pool.spawn_worker(None, false);
        }

        pool
    }

    /// Submit work, applying the saturation policy when the queue is full.
    pub async fn submit(&self, job: J) -> Result<(), SubmitError<J>> {
        // ---
        let Some(tx) = lock_ignore_poison(&self.tx).clone() else {
            return Err(SubmitError::Closed(job));
        };

        let job = match tx.try_send(job) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(job)) => return Err(SubmitError::Closed(job)),
            Err(TrySendError::Full(job)) => job,
        };

        if self.try_reserve_worker() {
            log_debug!("pool {}: queue full, starting extra worker", self.shared.name);
            self.spawn_worker(Some(job), true);
            return Ok(());
        }

        match self.settings.saturation {
            SaturationPolicy::Block => tx.send(job).await.map_err(|e| SubmitError::Closed(e.0)),
            SaturationPolicy::Reject => Err(SubmitError::Saturated(job)),
        }
    }

    /// Workers currently alive.
    pub fn workers(&self) -> usize {
        self.shared.workers.load(Ordering::Acquire)
    }

    /// Workers currently executing work.
    pub fn busy(&self) -> usize {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Stop accepting work and wait for every worker to exit.
    ///
    /// Submitters blocked on a full queue keep the queue open until their
    /// work is enqueued, so callers stop receipt before shutting down.
    pub async fn shutdown(&self, mode: DrainMode) {
        // ---
        if mode == DrainMode::NakPending {
            self.shared.draining.store(true, Ordering::Release);
        }
        lock_ignore_poison(&self.tx).take();

        let tasks = std::mem::take(&mut *lock_ignore_poison(&self.tasks));
        for task in tasks {
            let _ = task.await;
        }
        log_debug!("pool {}: all workers stopped", self.shared.name);
    }

    fn try_reserve_worker(&self) -> bool {
        // ---
        let max = self.settings.max_workers.max(1);
        self.shared
            .workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    fn spawn_worker(&self, first: Option<J>, surplus: bool) {
        // ---
        let shared = self.shared.clone();
        let task = tokio::spawn(worker_loop(shared, first, surplus));

        let mut tasks = lock_ignore_poison(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

async fn worker_loop<J: Work>(shared: Arc<Shared<J>>, first: Option<J>, surplus: bool) {
    // ---
    if let Some(job) = first {
        shared.execute(job).await;
    }

    loop {
        let next = if surplus {
            match tokio::time::timeout(shared.keep_alive, shared.next()).await {
                Ok(next) => next,
                Err(_) => {
                    log_debug!("pool {}: extra worker idle, exiting", shared.name);
                    break;
                }
            }
        } else {
            shared.next().await
        };

        match next {
            Some(job) => shared.execute(job).await,
            None => break,
        }
    }

    shared.workers.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Semaphore;

    struct Job {
        id: u32,
        gate: Arc<Semaphore>,
        log: Arc<Mutex<Vec<String>>>,
        ran: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl Work for Job {
        async fn run(self) {
            let _permit = self.gate.acquire().await.unwrap();
            self.ran.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("ran {}", self.id));
        }

        async fn abandon(self) {
            self.log.lock().unwrap().push(format!("abandoned {}", self.id));
        }
    }

    struct Fixture {
        gate: Arc<Semaphore>,
        log: Arc<Mutex<Vec<String>>>,
        ran: Arc<AtomicU32>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                gate: Arc::new(Semaphore::new(0)),
                log: Arc::new(Mutex::new(Vec::new())),
                ran: Arc::new(AtomicU32::new(0)),
            }
        }

        fn job(&self, id: u32) -> Job {
            Job {
                id,
                gate: self.gate.clone(),
                log: self.log.clone(),
                ran: self.ran.clone(),
            }
        }
    }

    fn settings(core: usize, max: usize, queue: usize, saturation: SaturationPolicy) -> PoolSettings {
        PoolSettings {
            core_workers: core,
            max_workers: max,
            queue_capacity: queue,
            keep_alive: Duration::from_millis(50),
            saturation,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn reject_policy_hands_work_back_when_full() {
        // ---
        let fx = Fixture::new();
        let pool = WorkerPool::new("t", settings(1, 1, 1, SaturationPolicy::Reject));

        // first job occupies the only worker, second fills the queue
        assert!(pool.submit(fx.job(1)).await.is_ok());
        settle().await;
        assert!(pool.submit(fx.job(2)).await.is_ok());

        match pool.submit(fx.job(3)).await {
            Err(refused @ SubmitError::Saturated(_)) => {
                let (job, err) = refused.into_parts("billing");
                assert_eq!(job.id, 3);
                assert!(matches!(
                    err,
                    ListenerError::PoolSaturated { listener } if listener == "billing"
                ));
            }
            _ => panic!("expected saturation"),
        }

        fx.gate.add_permits(10);
        pool.shutdown(DrainMode::Complete).await;
        assert_eq!(fx.ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn full_queue_grows_pool_up_to_max() {
        // ---
        let fx = Fixture::new();
        let pool = WorkerPool::new("t", settings(1, 3, 1, SaturationPolicy::Reject));
        assert_eq!(pool.workers(), 1);

        for id in 0..4 {
            assert!(pool.submit(fx.job(id)).await.is_ok(), "job {id}");
            settle().await;
        }
        assert_eq!(pool.workers(), 3);
        assert_eq!(pool.busy(), 3);

        assert!(matches!(
            pool.submit(fx.job(9)).await,
            Err(SubmitError::Saturated(_))
        ));

        fx.gate.add_permits(10);
        pool.shutdown(DrainMode::Complete).await;
        assert_eq!(fx.ran.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn block_policy_waits_for_queue_space() {
        // ---
        let fx = Fixture::new();
        let pool = Arc::new(WorkerPool::new("t", settings(1, 1, 1, SaturationPolicy::Block)));

        pool.submit(fx.job(1)).await.ok();
        settle().await;
        pool.submit(fx.job(2)).await.ok();

        let blocked = {
            let pool = pool.clone();
            let job = fx.job(3);
            tokio::spawn(async move { pool.submit(job).await.is_ok() })
        };
        settle().await;
        assert!(!blocked.is_finished());

        fx.gate.add_permits(10);
        assert!(blocked.await.unwrap());

        pool.shutdown(DrainMode::Complete).await;
        assert_eq!(fx.ran.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn nak_pending_abandons_queued_work() {
        // ---
        let fx = Fixture::new();
        let pool = WorkerPool::new("t", settings(1, 1, 4, SaturationPolicy::Block));

        pool.submit(fx.job(1)).await.ok();
        settle().await;
        pool.submit(fx.job(2)).await.ok();
        pool.submit(fx.job(3)).await.ok();

        let shutdown = pool.shutdown(DrainMode::NakPending);
        let release = async {
            settle().await;
            fx.gate.add_permits(10);
        };
        tokio::join!(shutdown, release);

        let log = fx.log.lock().unwrap().clone();
        assert_eq!(log, vec!["ran 1", "abandoned 2", "abandoned 3"]);
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_closed() {
        // ---
        let fx = Fixture::new();
        let pool = WorkerPool::new("t", settings(1, 1, 1, SaturationPolicy::Block));
        pool.shutdown(DrainMode::Complete).await;

        let Err(refused @ SubmitError::Closed(_)) = pool.submit(fx.job(1)).await else {
            panic!("expected a closed pool");
        };
        let (job, err) = refused.into_parts("t");
        assert_eq!(job.id, 1);
        assert!(matches!(err, ListenerError::PoolClosed));
        assert_eq!(pool.workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn extra_workers_exit_after_keep_alive() {
        // ---
        let fx = Fixture::new();
        let pool = WorkerPool::new("t", settings(1, 2, 1, SaturationPolicy::Reject));

        for id in 0..3 {
            pool.submit(fx.job(id)).await.ok();
            settle().await;
        }
        assert_eq!(pool.workers(), 2);

        fx.gate.add_permits(10);
        settle().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        settle().await;

        assert_eq!(pool.workers(), 1);
        pool.shutdown(DrainMode::Complete).await;
    }
}
