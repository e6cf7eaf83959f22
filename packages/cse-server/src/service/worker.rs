//! Single-task background workers.
//!
//! A [`BackgroundWorker`] owns one tokio task that feeds queued items to a
//! [`BackgroundRunnable`] one at a time and calls its tick hook on a fixed
//! interval. The event dispatcher and the expiration sweeper both run this
//! way. Items still queued when the worker is stopped are processed before
//! the runnable's `shutdown` hook, so no event published before a stop is
//! lost.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const QUEUE_CAPACITY: usize = 256;

#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    async fn run(&mut self, task: Self::Task);

    async fn on_tick(&mut self) {}

    async fn shutdown(&mut self) {}
}

pub struct BackgroundWorker<R: BackgroundRunnable> {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    _runnable: std::marker::PhantomData<fn() -> R>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Starts a worker whose queue has no outside producers; only the tick
    /// drives it.
    pub fn start(runnable: R, tick_interval_ms: u64) -> Self {
        let (tx, rx) = Self::channel();
        Self::start_with_channel(runnable, tx, rx, tick_interval_ms)
    }

    /// The worker's queue, created before the worker so producers can be
    /// wired first.
    #[must_use]
    pub fn channel() -> (mpsc::Sender<R::Task>, mpsc::Receiver<R::Task>) {
        mpsc::channel(QUEUE_CAPACITY)
    }

    /// Starts the worker on a queue from [`Self::channel`]. `tx` is dropped
    /// here; producers keep their own clones.
    pub fn start_with_channel(
        runnable: R,
        tx: mpsc::Sender<R::Task>,
        rx: mpsc::Receiver<R::Task>,
        tick_interval_ms: u64,
    ) -> Self {
        drop(tx);
        let (stop_tx, stop_rx) = oneshot::channel();
        let tick = Duration::from_millis(tick_interval_ms.max(1));
        let handle = tokio::spawn(drive(runnable, rx, stop_rx, tick));
        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            _runnable: std::marker::PhantomData,
        }
    }

    /// Stops the worker after it has drained its queue. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "background worker panicked");
            }
        }
    }
}

async fn drive<R: BackgroundRunnable>(
    mut runnable: R,
    mut rx: mpsc::Receiver<R::Task>,
    mut stop_rx: oneshot::Receiver<()>,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut producers_gone = false;
    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            task = rx.recv(), if !producers_gone => match task {
                Some(task) => runnable.run(task).await,
                None => producers_gone = true,
            },
            _ = ticker.tick() => runnable.on_tick().await,
        }
    }

    rx.close();
    while let Ok(task) = rx.try_recv() {
        runnable.run(task).await;
    }
    runnable.shutdown().await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<String>>,
    }

    struct Scribe(Arc<Journal>);

    #[async_trait]
    impl BackgroundRunnable for Scribe {
        type Task = u32;

        async fn run(&mut self, task: u32) {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.0.entries.lock().push(format!("run:{task}"));
        }

        async fn on_tick(&mut self) {
            self.0.entries.lock().push("tick".into());
        }

        async fn shutdown(&mut self) {
            self.0.entries.lock().push("shutdown".into());
        }
    }

    fn runs(journal: &Journal) -> Vec<String> {
        journal
            .entries
            .lock()
            .iter()
            .filter(|e| e.starts_with("run:"))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn stop_drains_the_queue_before_shutdown() {
        let journal = Arc::new(Journal::default());
        let (tx, rx) = BackgroundWorker::<Scribe>::channel();
        for n in 0..5 {
            tx.send(n).await.unwrap();
        }
        let mut worker = BackgroundWorker::start_with_channel(Scribe(journal.clone()), tx.clone(), rx, 60_000);
        worker.stop().await;

        assert_eq!(runs(&journal), vec!["run:0", "run:1", "run:2", "run:3", "run:4"]);
        assert_eq!(journal.entries.lock().last().map(String::as_str), Some("shutdown"));
        assert!(tx.send(9).await.is_err());
    }

    #[tokio::test]
    async fn producerless_workers_keep_ticking() {
        let journal = Arc::new(Journal::default());
        let mut worker = BackgroundWorker::start(Scribe(journal.clone()), 10);
        tokio::time::sleep(Duration::from_millis(80)).await;
        worker.stop().await;
        worker.stop().await;

        let entries = journal.entries.lock().clone();
        assert!(entries.iter().filter(|e| *e == "tick").count() >= 2, "{entries:?}");
        assert_eq!(entries.iter().filter(|e| *e == "shutdown").count(), 1);
    }
}
