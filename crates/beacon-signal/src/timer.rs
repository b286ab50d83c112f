//! Supervised periodic tasks
//!
//! A `PeriodicTask` runs a job on a fixed interval until it is cancelled.
//! Each run is failure-contained: an `Err` or a panic is logged and the
//! next run happens on schedule.
//!
//! # Example
//!
//! ```rust,ignore
//! let handle = PeriodicTask::start("reap-rooms", Duration::from_secs(30), move || {
//!     let reaper = reaper.clone();
//!     async move { reaper.reap_rooms(Utc::now()).await.map(|_| ()) }
//! });
//! // later
//! handle.shutdown().await;
//! ```

use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error};

/// Entry point for starting supervised periodic jobs
pub struct PeriodicTask;

impl PeriodicTask {
    /// Run `job` every `period`, first one `period` after start
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F, Fut, E>(name: impl Into<String>, period: Duration, mut job: F) -> TaskHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let name = name.into();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let task_name = name.clone();

        let join = tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    // Err means every handle was dropped
                    _ = cancel_rx.changed() => break,
                    _ = tick.tick() => {}
                }

                if *cancel_rx.borrow() {
                    break;
                }

                run_once(&task_name, &mut job).await;
            }

            debug!(task = %task_name, "Periodic task stopped");
        });

        debug!(task = %name, period_ms = period.as_millis() as u64, "Periodic task started");

        TaskHandle {
            name,
            cancel: cancel_tx,
            join,
        }
    }
}

/// Run the job once, containing errors and panics
async fn run_once<F, Fut, E>(name: &str, job: &mut F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    match AssertUnwindSafe(async { job().await }).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(task = %name, error = %e, "Periodic task failed"),
        Err(panic) => error!(
            task = %name,
            panic = %panic_message(panic.as_ref()),
            "Periodic task panicked"
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Handle to a running periodic task
///
/// Dropping the handle cancels the task the same way `cancel` does.
pub struct TaskHandle {
    name: String,
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop scheduling new runs. A run already in progress finishes.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Whether the scheduling loop has exited
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel and wait for the loop (and any in-flight run) to finish
    pub async fn shutdown(self) {
        self.cancel();
        if let Err(e) = self.join.await {
            error!(task = %self.name, error = %e, "Periodic task aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_job(
        counter: Arc<AtomicUsize>,
    ) -> impl FnMut() -> futures::future::Ready<Result<(), String>> + Send + 'static {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = PeriodicTask::start("count", Duration::from_secs(10), counting_job(counter.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(handle.name(), "count");

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_do_not_stop_schedule() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let handle = PeriodicTask::start("failing", Duration::from_secs(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Err::<(), _>("store unavailable"))
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!handle.is_finished());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panics_do_not_stop_schedule() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let handle = PeriodicTask::start("panicky", Duration::from_secs(10), move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run blows up");
                }
                Ok::<(), String>(())
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_future_runs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = PeriodicTask::start("cancel", Duration::from_secs(10), counting_job(counter.clone()));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_lets_in_flight_run_finish() {
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (s, f) = (started.clone(), finished.clone());

        let handle = PeriodicTask::start("slow", Duration::from_secs(10), move || {
            let (s, f) = (s.clone(), f.clone());
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                f.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        });

        // Mid-way through the first run
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        handle.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = PeriodicTask::start("dropped", Duration::from_secs(10), counting_job(counter.clone()));

        tokio::time::sleep(Duration::from_secs(15)).await;
        drop(handle);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
