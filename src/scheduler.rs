use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Context provided to background tasks during execution.
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// How often to run this task.
    fn interval(&self) -> Duration;

    /// Execute the task.
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Scheduler manages background tasks with graceful shutdown.
pub struct Scheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic background task.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks.lock().push(handle);
        self
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "task execution failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Graceful shutdown: signal every task and join them.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.await
                .map_err(|e| Error::Io(format!("task join error: {e}")))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestTask {
        interval: Duration,
        counter: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for TestTask {
        fn name(&self) -> &'static str {
            "test-task"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_scheduler_basic() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(TestTask {
            interval: Duration::from_millis(10),
            counter: counter.clone(),
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(counter.load(Ordering::SeqCst) > 0);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_scheduler_graceful_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(TestTask {
            interval: Duration::from_millis(10),
            counter: counter.clone(),
        }));

        tokio::time::sleep(Duration::from_millis(25)).await;
        scheduler.shutdown().await?;

        let after_shutdown = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(after_shutdown, counter.load(Ordering::SeqCst));

        Ok(())
    }
}
