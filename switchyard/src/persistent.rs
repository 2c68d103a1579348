//! A task that keeps itself alive: re-runs on failure, re-runs on demand.
//!
//! The reconciler is the one consumer: its pass either succeeds (then the
//! task parks until a directory watch pokes it) or fails transiently (then
//! the task retries after a timeout, or sooner if poked). At most one pass
//! is ever in flight.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle to a self-rescheduling background task.
pub struct PersistentTask {
    trigger_tx: mpsc::UnboundedSender<()>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentTask {
    /// Spawn the task and run one pass immediately.
    ///
    /// Each pass receives a trigger handle it can hand to watches; firing
    /// it schedules another pass. `work` returns true when the pass
    /// succeeded. A failed pass is retried after `retry_timeout`; a
    /// successful one waits for the next trigger. Triggers arriving
    /// mid-pass are coalesced into exactly one follow-up pass.
    pub fn spawn<F, Fut>(name: &'static str, retry_timeout: Duration, mut work: F) -> Self
    where
        F: FnMut(mpsc::UnboundedSender<()>) -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<()>();

        let task_running = Arc::clone(&running);
        let work_trigger = trigger_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                if !task_running.load(Ordering::Acquire) {
                    break;
                }

                // coalesce anything queued before this pass; fires arriving
                // *during* the pass stay queued and force a follow-up
                while trigger_rx.try_recv().is_ok() {}

                let succeeded = work(work_trigger.clone()).await;

                if !task_running.load(Ordering::Acquire) {
                    break;
                }

                if succeeded {
                    if trigger_rx.recv().await.is_none() {
                        break;
                    }
                } else {
                    tracing::debug!(task = name, "pass failed, will retry");
                    tokio::select! {
                        _ = trigger_rx.recv() => {}
                        _ = tokio::time::sleep(retry_timeout) => {}
                    }
                }
            }
            tracing::debug!(task = name, "persistent task exited");
        });

        Self {
            trigger_tx,
            running,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// A sender that schedules another pass; safe to hand to watches.
    pub fn trigger(&self) -> mpsc::UnboundedSender<()> {
        self.trigger_tx.clone()
    }

    /// Schedule another pass now.
    pub fn poke(&self) {
        let _ = self.trigger_tx.send(());
    }

    /// Stop the task and wait for the in-flight pass, if any, to finish.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.trigger_tx.send(());
        let handle = self.handle.lock().expect("persistent task lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[tokio::test]
    async fn test_runs_immediately_then_parks() {
        let runs = Arc::new(AtomicU32::new(0));
        let task_runs = Arc::clone(&runs);
        let task = PersistentTask::spawn("test", Duration::from_secs(60), move |_trigger| {
            let runs = Arc::clone(&task_runs);
            async move {
                runs.fetch_add(1, Ordering::AcqRel);
                true
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::Acquire), 1);

        task.poke();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::Acquire), 2);

        task.stop().await;
    }

    #[tokio::test]
    async fn test_failure_retries_on_timer() {
        let runs = Arc::new(AtomicU32::new(0));
        let task_runs = Arc::clone(&runs);
        let task = PersistentTask::spawn("retry", Duration::from_millis(20), move |_trigger| {
            let runs = Arc::clone(&task_runs);
            async move {
                runs.fetch_add(1, Ordering::AcqRel);
                false
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(
            runs.load(Ordering::Acquire) >= 3,
            "failing pass should keep retrying"
        );

        task.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_prompt() {
        let task = PersistentTask::spawn("stoppable", Duration::from_secs(60), |_trigger| async {
            true
        });
        tokio::time::timeout(Duration::from_secs(1), task.stop())
            .await
            .expect("stop should not hang");
    }

    #[tokio::test]
    async fn test_triggers_coalesce() {
        let runs = Arc::new(AtomicU32::new(0));
        let task_runs = Arc::clone(&runs);
        let task = PersistentTask::spawn("coalesce", Duration::from_secs(60), move |_trigger| {
            let runs = Arc::clone(&task_runs);
            async move {
                runs.fetch_add(1, Ordering::AcqRel);
                tokio::time::sleep(Duration::from_millis(30)).await;
                true
            }
        });

        // burst of pokes while the first pass sleeps
        for _ in 0..10 {
            task.poke();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        let total = runs.load(Ordering::Acquire);
        assert!(
            (2..=3).contains(&total),
            "burst should coalesce into one follow-up pass, saw {total}"
        );

        task.stop().await;
    }
}
