use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

#[derive(Default)]
struct TimerState {
    handle: Option<JoinHandle<()>>,
    started_at: Option<Instant>,
}

/// One-shot restart timer
///
/// Starting the timer cancels any run in progress. `elapsed()` reports the
/// time since the last start while the timer is armed.
#[derive(Default)]
pub(crate) struct StaleTimer {
    state: Mutex<TimerState>,
}

impl StaleTimer {
    pub(crate) fn start<F>(&self, duration: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        state.started_at = Some(Instant::now());
        state.handle = Some(tokio::spawn(async move {
            sleep(duration).await;
            callback();
        }));
    }

    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock();
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        state.started_at = None;
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.state
            .lock()
            .started_at
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state
            .lock()
            .handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once() {
        let timer = StaleTimer::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timer.start(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_running());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(timer.elapsed(), Duration::from_secs(2));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let timer = StaleTimer::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timer.start(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timer.is_running());
        assert_eq!(timer.elapsed(), Duration::ZERO);
    }
}
