//! State feed contract consumed by the cranker.
//!
//! The wire-level client that turns account bytes into these events lives
//! outside this crate. Anything implementing [`StateFeed`] can drive the
//! agent; [`MemoryFeed`] is the in-process implementation used by the
//! simulator and the tests.

pub mod memory;
pub mod types;

use crate::error::FeedError;
use async_trait::async_trait;
use solana_pubkey::Pubkey;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use memory::MemoryFeed;
pub use types::{BidSummary, Period, PeriodRing, PeriodWithPayout, PipelineData, PipelineHandle};

/// A lazy event stream. An `Err` item or the sender going away terminates it.
#[derive(Debug)]
pub struct Subscription<T> {
    name: &'static str,
    rx: mpsc::Receiver<Result<T, FeedError>>,
}

impl<T> Subscription<T> {
    pub fn new(name: &'static str, rx: mpsc::Receiver<Result<T, FeedError>>) -> Self {
        Self { name, rx }
    }

    /// Paired sender/subscription with the given buffer
    pub fn channel(
        name: &'static str,
        buffer: usize,
    ) -> (mpsc::Sender<Result<T, FeedError>>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self::new(name, rx))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Next event; a closed stream is reported as [`FeedError::Closed`].
    pub async fn next(&mut self) -> Result<T, FeedError> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Err(FeedError::Closed(self.name)),
        }
    }
}

/// Source of chain state for the decision core.
///
/// Every subscription receives the agent's cancellation token; providers
/// should stop delivering once it fires.
#[async_trait]
pub trait StateFeed: Send + Sync {
    async fn subscribe_slot(
        &self,
        cancel: CancellationToken,
    ) -> Result<Subscription<u64>, FeedError>;

    /// Period ring updates for one pipeline, or all of them when `filter` is `None`.
    async fn subscribe_period(
        &self,
        filter: Option<Pubkey>,
        cancel: CancellationToken,
    ) -> Result<Subscription<PeriodRing>, FeedError>;

    async fn subscribe_bid_summary(
        &self,
        cancel: CancellationToken,
    ) -> Result<Subscription<BidSummary>, FeedError>;

    /// Lamport balance updates for `account`
    async fn subscribe_balance(
        &self,
        account: Pubkey,
        cancel: CancellationToken,
    ) -> Result<Subscription<u64>, FeedError>;

    /// Every pipeline known at startup
    async fn list_all_pipelines(&self) -> Result<Vec<PipelineHandle>, FeedError>;

    async fn pipeline_by_id(&self, id: Pubkey) -> Result<PipelineHandle, FeedError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_reports_closed_stream() {
        let (tx, mut sub) = Subscription::<u64>::channel("slot", 4);
        tx.send(Ok(7)).await.unwrap();
        drop(tx);

        assert_eq!(sub.next().await, Ok(7));
        assert_eq!(sub.next().await, Err(FeedError::Closed("slot")));
    }

    #[tokio::test]
    async fn test_subscription_forwards_stream_errors() {
        let (tx, mut sub) = Subscription::<u64>::channel("balance", 4);
        let err = FeedError::Stream {
            feed: "balance",
            message: "rpc dropped".to_string(),
        };
        tx.send(Err(err.clone())).await.unwrap();

        assert_eq!(sub.next().await, Err(err));
    }
}
