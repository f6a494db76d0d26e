//! Pod batching: collect a burst of pending pods into one scheduling pass.
//!
//! The first trigger opens a window. The window closes after a quiet period
//! with no further triggers, or unconditionally at the maximum duration.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Batches triggers into windows.
pub struct Batcher {
    tx: mpsc::UnboundedSender<()>,
    rx: Mutex<mpsc::UnboundedReceiver<()>>,
    idle: Duration,
    max: Duration,
}

impl Batcher {
    /// Create a batcher with the given idle gap and window cap.
    pub fn new(idle: Duration, max: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Mutex::new(rx), idle, max }
    }

    /// Record an event (e.g. a pending pod was observed). Never blocks.
    pub fn trigger(&self) {
        // A full batch is still a batch; send failures cannot happen with
        // an unbounded channel unless the receiver is gone at shutdown.
        let _ = self.tx.send(());
    }

    /// Wait for the next window: blocks for the first trigger, then absorbs
    /// further triggers until the idle gap or the window cap. Returns the
    /// number of triggers absorbed.
    pub async fn wait(&self) -> usize {
        let mut rx = self.rx.lock().await;
        if rx.recv().await.is_none() {
            return 0;
        }
        let mut count = 1;

        let window_closes = Instant::now() + self.max;
        loop {
            let idle_closes = Instant::now() + self.idle;
            let deadline = idle_closes.min(window_closes);
            tokio::select! {
                received = rx.recv() => match received {
                    Some(()) => count += 1,
                    None => return count,
                },
                _ = sleep_until(deadline) => return count,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batcher() -> Batcher {
        Batcher::new(Duration::from_secs(1), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_closes_the_window() {
        let b = batcher();
        b.trigger();
        b.trigger();
        let count = b.wait().await;
        assert_eq!(count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_triggers_keep_the_window_open_until_the_cap() {
        let b = std::sync::Arc::new(batcher());
        b.trigger();

        let feeder = {
            let b = b.clone();
            tokio::spawn(async move {
                // One trigger every 500ms keeps beating the 1s idle gap.
                for _ in 0..60 {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    b.trigger();
                }
            })
        };

        let started = tokio::time::Instant::now();
        let count = b.wait().await;
        let elapsed = started.elapsed();

        // The 10s cap closed the window despite continuous triggers.
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(11));
        assert!(count >= 19);
        feeder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_the_first_trigger() {
        let b = std::sync::Arc::new(batcher());
        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.wait().await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        b.trigger();
        let count = waiter.await.unwrap();
        assert_eq!(count, 1);
    }
}
