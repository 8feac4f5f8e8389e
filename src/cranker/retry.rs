//! Retry scheduler.
//!
//! One detached task per pipeline waits for either a fresh period ring or a
//! timeout, then asks the decision core to re-evaluate that pipeline. The
//! core never blocks on a pipeline's timer.

use crate::feed::{PeriodRing, StateFeed, Subscription};
use rand::Rng;
use solana_pubkey::Pubkey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    /// `delay` plus a random share of `jitter`
    pub fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.delay;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        self.delay + Duration::from_millis(extra)
    }
}

/// Spawn the waiting task for `pipeline`
pub fn spawn_retry(
    feed: Arc<dyn StateFeed>,
    pipeline: Pubkey,
    policy: RetryPolicy,
    retry_tx: mpsc::Sender<Pubkey>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let subscription = match feed.subscribe_period(Some(pipeline), cancel.clone()).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                log::debug!("Retry for {} falls back to timer only: {}", pipeline, e);
                None
            }
        };
        let delay = policy.next_delay();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = next_period(subscription) => {
                log::debug!("🔁 Fresh period for {}, retrying", pipeline);
            }
            _ = tokio::time::sleep(delay) => {
                log::debug!("🔁 Retry delay {:?} elapsed for {}", delay, pipeline);
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = retry_tx.send(pipeline) => {}
        }
    })
}

/// Resolves on the next ring event; a missing or failed subscription never resolves
async fn next_period(subscription: Option<Subscription<PeriodRing>>) {
    if let Some(mut sub) = subscription {
        if sub.next().await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeed;

    fn key(n: u8) -> Pubkey {
        Pubkey::new_from_array([n; 32])
    }

    fn policy(delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_millis(delay_ms),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            delay: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
        };
        for _ in 0..100 {
            let d = policy.next_delay();
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_timer_fires_retry() {
        let feed = Arc::new(MemoryFeed::new());
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        spawn_retry(feed, key(1), policy(10), tx, cancel);

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some(key(1)));
    }

    #[tokio::test]
    async fn test_period_event_fires_before_timer() {
        let feed = Arc::new(MemoryFeed::new());
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        spawn_retry(feed.clone(), key(1), policy(60_000), tx, cancel);

        // Wait for the task to subscribe
        while feed.period_subscribers(&key(1)).await == 0 {
            tokio::task::yield_now().await;
        }
        feed.publish_period(PeriodRing::with_capacity(key(2), 1)).await;
        feed.publish_period(PeriodRing::with_capacity(key(1), 1)).await;

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got, Some(key(1)));
    }

    #[tokio::test]
    async fn test_cancellation_releases_subscription() {
        let feed = Arc::new(MemoryFeed::new());
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let handle = spawn_retry(feed.clone(), key(1), policy(60_000), tx, cancel.clone());
        while feed.period_subscribers(&key(1)).await == 0 {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(feed.period_subscribers(&key(1)).await, 0);
        assert!(rx.recv().await.is_none());
    }
}
