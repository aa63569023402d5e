use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::RwLock;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, MissedTickBehavior};

type ExecutorFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
type Executor = Arc<dyn Fn() -> ExecutorFuture + Send + Sync>;

/// Interval trigger for reconciliation passes.
///
/// Passes never overlap: a tick or manual trigger that arrives while a pass
/// is running is coalesced into at most one follow-up pass.
#[derive(Clone)]
pub struct PassScheduler {
    interval: Duration,
    notify: Arc<Notify>,
    executor: Arc<RwLock<Option<Executor>>>,
    pass_lock: Arc<Mutex<()>>,
    pending: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    completed_passes: Arc<AtomicU64>,
    failed_passes: Arc<AtomicU64>,
}

impl PassScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            notify: Arc::new(Notify::new()),
            executor: Arc::new(RwLock::new(None)),
            pass_lock: Arc::new(Mutex::new(())),
            pending: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            completed_passes: Arc::new(AtomicU64::new(0)),
            failed_passes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The executor returns `true` when the pass failed.
    pub fn set_executor(&self, executor: Executor) {
        if let Ok(mut writer) = self.executor.write() {
            *writer = Some(executor);
        }
    }

    pub fn trigger_now(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn completed_passes(&self) -> u64 {
        self.completed_passes.load(Ordering::SeqCst)
    }

    pub fn failed_passes(&self) -> u64 {
        self.failed_passes.load(Ordering::SeqCst)
    }

    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.pending.store(true, Ordering::SeqCst);
                }
                _ = self.notify.notified() => {}
            }
            if self.shutdown.load(Ordering::SeqCst) {
                tracing::info!("scheduler stopped");
                break;
            }
            while self.pending.swap(false, Ordering::SeqCst) {
                self.execute().await;
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }

    /// Runs one pass unless another is already in progress, in which case
    /// the request is left pending for the running loop to pick up.
    pub async fn execute(&self) -> bool {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            self.pending.store(true, Ordering::SeqCst);
            tracing::debug!("pass already running; request coalesced");
            return false;
        };

        let executor = self.executor.read().ok().and_then(|reader| reader.clone());
        let Some(executor) = executor else {
            tracing::error!("scheduler has no executor configured");
            return true;
        };

        let failed = executor().await;
        self.completed_passes.fetch_add(1, Ordering::SeqCst);
        if failed {
            self.failed_passes.fetch_add(1, Ordering::SeqCst);
            tracing::warn!("scheduled pass finished in failed state");
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::PassScheduler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Duration;

    fn counting_executor(scheduler: &PassScheduler, delay: Duration) -> Arc<AtomicUsize> {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        scheduler.set_executor(Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                counter.fetch_add(1, Ordering::SeqCst);
                false
            })
        }));
        runs
    }

    #[tokio::test]
    async fn overlapping_execute_is_coalesced() {
        let scheduler = PassScheduler::new(Duration::from_secs(3600));
        let runs = counting_executor(&scheduler, Duration::from_millis(50));

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.execute().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!scheduler.execute().await);
        first.await.expect("first pass");

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(scheduler.pending.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn loop_runs_first_tick_then_manual_trigger() {
        let scheduler = PassScheduler::new(Duration::from_secs(3600));
        let runs = counting_executor(&scheduler, Duration::from_millis(1));
        let handle = scheduler.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        scheduler.trigger_now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        scheduler.shutdown();
        handle.await.expect("loop exits");
        assert_eq!(scheduler.completed_passes(), 2);
        assert_eq!(scheduler.failed_passes(), 0);
    }

    #[tokio::test]
    async fn missing_executor_reports_failure() {
        let scheduler = PassScheduler::new(Duration::from_secs(60));
        assert!(scheduler.execute().await);
    }
}
