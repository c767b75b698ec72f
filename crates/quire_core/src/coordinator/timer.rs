//! Cancellable, restartable one-shot timer.

use std::time::Duration;

use tokio::task::JoinHandle;

/// One-shot timer that runs a callback after a delay.
///
/// Triggering again cancels the pending run and starts over, which is what
/// gives debounce semantics. Dropping the timer cancels it. Must be used from
/// within a tokio runtime.
#[derive(Debug, Default)]
pub struct DebounceTimer {
    task: Option<JoinHandle<()>>,
}

impl DebounceTimer {
    /// Create an idle timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending run and schedule `on_elapsed` after `delay`.
    pub fn trigger<F>(&mut self, delay: Duration, on_elapsed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_elapsed();
        }));
    }

    /// Cancel a pending run. No-op if the timer is idle or already fired.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether a run is scheduled and hasn't happened yet.
    pub fn is_pending(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let make = {
            let count = count.clone();
            move || {
                let count = count.clone();
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }) as Box<dyn FnOnce() + Send>
            }
        };
        (count, make)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let (count, make) = counter();
        let mut timer = DebounceTimer::new();
        timer.trigger(Duration::from_millis(100), make());
        assert!(timer.is_pending());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrigger_restarts_the_delay() {
        let (count, make) = counter();
        let mut timer = DebounceTimer::new();

        for _ in 0..5 {
            timer.trigger(Duration::from_millis(100), make());
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_drop() {
        let (count, make) = counter();

        let mut timer = DebounceTimer::new();
        timer.trigger(Duration::from_millis(10), make());
        timer.cancel();
        assert!(!timer.is_pending());

        let mut dropped = DebounceTimer::new();
        dropped.trigger(Duration::from_millis(10), make());
        drop(dropped);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Cancelling an idle or spent timer is harmless
        timer.cancel();
    }
}
