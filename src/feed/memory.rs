//! In-process state feed.
//!
//! Holds a pipeline registry and fans published events out to every live
//! subscriber. Subscribers whose receiver was dropped or whose cancellation
//! token fired are pruned on the next publish.

use super::{BidSummary, PeriodRing, PipelineHandle, StateFeed, Subscription};
use crate::error::FeedError;
use async_trait::async_trait;
use solana_pubkey::Pubkey;
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub const SLOT_FEED: &str = "slot";
pub const PERIOD_FEED: &str = "period";
pub const BID_FEED: &str = "bid_summary";
pub const BALANCE_FEED: &str = "balance";

const DEFAULT_BUFFER: usize = 256;

struct Sink<T> {
    filter: Option<Pubkey>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<T, FeedError>>,
}

impl<T> Sink<T> {
    fn is_live(&self) -> bool {
        !self.tx.is_closed() && !self.cancel.is_cancelled()
    }

    fn matches(&self, key: &Pubkey) -> bool {
        self.filter.map_or(true, |f| f == *key)
    }
}

#[derive(Default)]
struct Inner {
    slots: Vec<Sink<u64>>,
    periods: Vec<Sink<PeriodRing>>,
    bids: Vec<Sink<BidSummary>>,
    balances: Vec<Sink<u64>>,
    pipelines: HashMap<Pubkey, PipelineHandle>,
    refused: HashSet<&'static str>,
}

pub struct MemoryFeed {
    buffer: usize,
    inner: Mutex<Inner>,
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    /// Feed whose subscriptions buffer at most `buffer` undelivered events
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register or replace a pipeline in the registry
    pub async fn insert_pipeline(&self, handle: PipelineHandle) {
        self.inner.lock().await.pipelines.insert(handle.id, handle);
    }

    /// Make future subscriptions to `feed` fail
    pub async fn refuse_subscriptions(&self, feed: &'static str) {
        self.inner.lock().await.refused.insert(feed);
    }

    /// Live period subscribers interested in `pipeline`
    pub async fn period_subscribers(&self, pipeline: &Pubkey) -> usize {
        let mut inner = self.inner.lock().await;
        inner.periods.retain(Sink::is_live);
        inner.periods.iter().filter(|s| s.matches(pipeline)).count()
    }

    pub async fn publish_slot(&self, slot: u64) {
        let targets = {
            let mut inner = self.inner.lock().await;
            collect_targets(&mut inner.slots, None)
        };
        deliver(targets, Ok(slot)).await;
    }

    /// Publish a ring update; the registry copy is refreshed as well
    pub async fn publish_period(&self, ring: PeriodRing) {
        let targets = {
            let mut inner = self.inner.lock().await;
            if let Some(handle) = inner.pipelines.get_mut(&ring.pipeline) {
                handle.periods = Some(ring.clone());
            }
            collect_targets(&mut inner.periods, Some(&ring.pipeline))
        };
        deliver(targets, Ok(ring)).await;
    }

    pub async fn publish_bid_summary(&self, summary: BidSummary) {
        let targets = {
            let mut inner = self.inner.lock().await;
            if let Some(handle) = inner.pipelines.get_mut(&summary.pipeline) {
                handle.bids = Some(summary);
            }
            collect_targets(&mut inner.bids, None)
        };
        deliver(targets, Ok(summary)).await;
    }

    pub async fn publish_balance(&self, account: Pubkey, lamports: u64) {
        let targets = {
            let mut inner = self.inner.lock().await;
            collect_targets(&mut inner.balances, Some(&account))
        };
        deliver(targets, Ok(lamports)).await;
    }

    /// Terminate every subscription of `feed` with a stream error
    pub async fn fail_feed(&self, feed: &'static str, message: &str) {
        let err = FeedError::Stream {
            feed,
            message: message.to_string(),
        };
        let mut inner = self.inner.lock().await;
        match feed {
            SLOT_FEED => fail_all(&mut inner.slots, &err),
            PERIOD_FEED => fail_all(&mut inner.periods, &err),
            BID_FEED => fail_all(&mut inner.bids, &err),
            BALANCE_FEED => fail_all(&mut inner.balances, &err),
            other => log::warn!("⚠️  fail_feed called for unknown feed '{}'", other),
        }
    }

    async fn subscribe<T>(
        &self,
        feed: &'static str,
        filter: Option<Pubkey>,
        cancel: CancellationToken,
        select: impl FnOnce(&mut Inner) -> &mut Vec<Sink<T>>,
    ) -> Result<Subscription<T>, FeedError> {
        let mut inner = self.inner.lock().await;
        if inner.refused.contains(feed) {
            return Err(FeedError::Subscribe {
                feed,
                message: "subscription refused".to_string(),
            });
        }
        let (tx, sub) = Subscription::channel(feed, self.buffer);
        select(&mut *inner).push(Sink { filter, cancel, tx });
        log::debug!("📡 New {} subscription (filter: {:?})", feed, filter);
        Ok(sub)
    }
}

fn collect_targets<T>(
    sinks: &mut Vec<Sink<T>>,
    key: Option<&Pubkey>,
) -> Vec<mpsc::Sender<Result<T, FeedError>>> {
    sinks.retain(Sink::is_live);
    sinks
        .iter()
        .filter(|s| key.map_or(true, |k| s.matches(k)))
        .map(|s| s.tx.clone())
        .collect()
}

async fn deliver<T: Clone>(
    targets: Vec<mpsc::Sender<Result<T, FeedError>>>,
    item: Result<T, FeedError>,
) {
    for tx in targets {
        // A subscriber that went away mid-publish is pruned next time
        let _ = tx.send(item.clone()).await;
    }
}

fn fail_all<T>(sinks: &mut Vec<Sink<T>>, err: &FeedError) {
    for sink in sinks.drain(..) {
        let _ = sink.tx.try_send(Err(err.clone()));
    }
}

#[async_trait]
impl StateFeed for MemoryFeed {
    async fn subscribe_slot(
        &self,
        cancel: CancellationToken,
    ) -> Result<Subscription<u64>, FeedError> {
        self.subscribe(SLOT_FEED, None, cancel, |i| &mut i.slots).await
    }

    async fn subscribe_period(
        &self,
        filter: Option<Pubkey>,
        cancel: CancellationToken,
    ) -> Result<Subscription<PeriodRing>, FeedError> {
        self.subscribe(PERIOD_FEED, filter, cancel, |i| &mut i.periods).await
    }

    async fn subscribe_bid_summary(
        &self,
        cancel: CancellationToken,
    ) -> Result<Subscription<BidSummary>, FeedError> {
        self.subscribe(BID_FEED, None, cancel, |i| &mut i.bids).await
    }

    async fn subscribe_balance(
        &self,
        account: Pubkey,
        cancel: CancellationToken,
    ) -> Result<Subscription<u64>, FeedError> {
        self.subscribe(BALANCE_FEED, Some(account), cancel, |i| &mut i.balances).await
    }

    async fn list_all_pipelines(&self) -> Result<Vec<PipelineHandle>, FeedError> {
        Ok(self.inner.lock().await.pipelines.values().cloned().collect())
    }

    async fn pipeline_by_id(&self, id: Pubkey) -> Result<PipelineHandle, FeedError> {
        self.inner
            .lock()
            .await
            .pipelines
            .get(&id)
            .cloned()
            .ok_or(FeedError::UnknownPipeline(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{Period, PeriodWithPayout, PipelineData};

    fn key(n: u8) -> Pubkey {
        Pubkey::new_from_array([n; 32])
    }

    fn handle(n: u8) -> PipelineHandle {
        PipelineHandle {
            id: key(n),
            data: PipelineData {
                controller: key(100),
                vault: key(101),
                fee_vault: key(102),
            },
            periods: None,
            bids: None,
        }
    }

    #[tokio::test]
    async fn test_period_filter_only_delivers_matching_pipeline() {
        let feed = MemoryFeed::new();
        let cancel = CancellationToken::new();
        let mut only_one = feed.subscribe_period(Some(key(1)), cancel.clone()).await.unwrap();
        let mut all = feed.subscribe_period(None, cancel.clone()).await.unwrap();

        let other = PeriodRing::with_capacity(key(2), 2);
        let mine = PeriodRing::from_periods(
            key(1),
            2,
            &[PeriodWithPayout {
                period: Period::new(0, 10),
                payout: key(3),
            }],
        );
        feed.publish_period(other.clone()).await;
        feed.publish_period(mine.clone()).await;

        assert_eq!(only_one.next().await.unwrap(), mine);
        assert_eq!(all.next().await.unwrap(), other);
        assert_eq!(all.next().await.unwrap(), mine);
    }

    #[tokio::test]
    async fn test_cancelled_and_dropped_subscribers_are_pruned() {
        let feed = MemoryFeed::new();
        let cancel = CancellationToken::new();
        let sub = feed.subscribe_period(Some(key(1)), cancel.clone()).await.unwrap();
        let _kept = feed.subscribe_period(None, CancellationToken::new()).await.unwrap();
        assert_eq!(feed.period_subscribers(&key(1)).await, 2);

        drop(sub);
        assert_eq!(feed.period_subscribers(&key(1)).await, 1);

        let _other = feed.subscribe_period(Some(key(1)), cancel.clone()).await.unwrap();
        cancel.cancel();
        assert_eq!(feed.period_subscribers(&key(1)).await, 1);
    }

    #[tokio::test]
    async fn test_refused_subscription_and_failed_feed() {
        let feed = MemoryFeed::new();
        let cancel = CancellationToken::new();
        let mut slots = feed.subscribe_slot(cancel.clone()).await.unwrap();

        feed.refuse_subscriptions(BALANCE_FEED).await;
        assert!(matches!(
            feed.subscribe_balance(key(1), cancel.clone()).await,
            Err(FeedError::Subscribe { feed: "balance", .. })
        ));

        feed.fail_feed(SLOT_FEED, "socket reset").await;
        assert!(matches!(slots.next().await, Err(FeedError::Stream { feed: "slot", .. })));
    }

    #[tokio::test]
    async fn test_registry_tracks_latest_bids() {
        let feed = MemoryFeed::new();
        feed.insert_pipeline(handle(1)).await;
        feed.publish_bid_summary(BidSummary {
            pipeline: key(1),
            last_period_start: 40,
        })
        .await;

        let fetched = feed.pipeline_by_id(key(1)).await.unwrap();
        assert_eq!(fetched.bids.map(|b| b.last_period_start), Some(40));
        assert_eq!(
            feed.pipeline_by_id(key(2)).await,
            Err(FeedError::UnknownPipeline(key(2)))
        );
        assert_eq!(feed.list_all_pipelines().await.unwrap().len(), 1);
    }
}
