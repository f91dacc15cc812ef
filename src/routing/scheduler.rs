//! Periodic action with short-delay coalescing
//!
//! Drives the link-state broadcast cadence: a regular interval keeps state
//! refreshed, and a short-delay trigger folds a burst of topology changes
//! into a single early fire. After any fire the regular interval re-arms, so
//! fires never overlap and never starve.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::trace;

/// Schedules one repeated action with two cadences.
///
/// `trigger_short` arms an early fire if and only if none is pending and the
/// early deadline precedes the regular one; that early fire replaces the
/// regular fire rather than adding to it.
///
/// Dropping the executor stops the schedule.
pub struct RepeatedExecutor {
    trigger_tx: mpsc::UnboundedSender<()>,
}

impl RepeatedExecutor {
    /// Spawn the schedule with the given cadences. `action` runs on a
    /// dedicated task, once per fire.
    pub fn spawn<F>(regular: Duration, short: Duration, mut action: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            let mut next_regular = Instant::now() + regular;
            let mut short_deadline: Option<Instant> = None;
            loop {
                let deadline = short_deadline.unwrap_or(next_regular);
                tokio::select! {
                    _ = time::sleep_until(deadline) => {
                        action();
                        short_deadline = None;
                        next_regular = Instant::now() + regular;
                    }
                    msg = trigger_rx.recv() => match msg {
                        Some(()) => {
                            if short_deadline.is_none() {
                                let candidate = Instant::now() + short;
                                if candidate < next_regular {
                                    trace!("arming short-delay fire");
                                    short_deadline = Some(candidate);
                                }
                            }
                        }
                        // All handles dropped: stop the schedule.
                        None => break,
                    }
                }
            }
        });

        Self { trigger_tx }
    }

    /// Request an early fire to coalesce a burst of external events.
    pub fn trigger_short(&self) {
        let _ = self.trigger_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn burst_of_triggers_coalesces_to_one_fire() {
        let (count, action) = counter();
        let executor =
            RepeatedExecutor::spawn(Duration::from_secs(5), Duration::from_millis(30), action);

        for _ in 0..10 {
            executor.trigger_short();
        }
        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn regular_cadence_fires_without_triggers() {
        let (count, action) = counter();
        let _executor =
            RepeatedExecutor::spawn(Duration::from_millis(40), Duration::from_millis(5), action);

        time::sleep(Duration::from_millis(220)).await;
        let fires = count.load(Ordering::SeqCst);
        assert!((3..=6).contains(&fires), "got {} fires", fires);
    }

    #[tokio::test]
    async fn short_fire_replaces_the_regular_fire() {
        let (count, action) = counter();
        let executor =
            RepeatedExecutor::spawn(Duration::from_millis(120), Duration::from_millis(10), action);

        executor.trigger_short();
        time::sleep(Duration::from_millis(60)).await;
        // The short fire happened and re-armed the regular timer from its
        // fire time, so no second fire yet.
        assert_eq!(count.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_millis(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn trigger_after_fire_arms_again() {
        let (count, action) = counter();
        let executor =
            RepeatedExecutor::spawn(Duration::from_secs(5), Duration::from_millis(20), action);

        executor.trigger_short();
        time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        executor.trigger_short();
        time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropping_the_executor_stops_the_schedule() {
        let (count, action) = counter();
        let executor =
            RepeatedExecutor::spawn(Duration::from_millis(30), Duration::from_millis(5), action);
        drop(executor);

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
