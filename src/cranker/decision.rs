//! Decision core.
//!
//! A single task owns every piece of scheduling state: the current slot, the
//! wallet balance and the per-pipeline status table. Feed events, worker
//! responses, retry signals, lookup results and control commands are merged
//! into one `select!` loop and applied in arrival order, so no locks are
//! needed. Other tasks only ever send messages naming a pipeline.
//!
//! ```text
//!   slot ─┐
//! period ─┤                         ┌──────────────┐
//!   bids ─┼─► DecisionCore::run ───►│ request (1)  │──► WorkerPool
//! balance ┤        ▲   ▲   ▲        └──────────────┘        │
//! commands┘        │   │   └──────── responses ◄────────────┘
//!                  │   └──────────── retry signals ◄── spawn_retry
//!                  └──────────────── lookups ◄──────── pipeline_by_id
//! ```

use super::retry::{spawn_retry, RetryPolicy};
use super::status::{PipelineStatus, StatusView};
use super::worker::{CrankRequest, CrankResponse};
use crate::config::CrankerConfig;
use crate::error::{AgentError, CrankError, FeedError, WorkerError};
use crate::feed::{BidSummary, PeriodRing, PipelineHandle, StateFeed, Subscription};
use solana_pubkey::Pubkey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const INTERNAL_BUFFER: usize = 64;

/// Control messages applied synchronously inside the core loop
#[derive(Debug)]
pub enum Command {
    /// Deliver the terminal result to this sender exactly once
    RegisterCloseWaiter(oneshot::Sender<Result<(), AgentError>>),
    Status {
        pipeline: Pubkey,
        reply: oneshot::Sender<Option<StatusView>>,
    },
    Statuses(oneshot::Sender<Vec<StatusView>>),
    /// Start tracking a pipeline or refresh its accounts
    Track(PipelineHandle),
}

#[derive(Debug, Clone, Copy)]
pub struct CoreSettings {
    pub balance_threshold: u64,
    pub cooldown: u64,
    pub retry: RetryPolicy,
    pub retry_on_failure: bool,
    pub halt_on_depleted: bool,
}

impl From<&CrankerConfig> for CoreSettings {
    fn from(config: &CrankerConfig) -> Self {
        Self {
            balance_threshold: config.balance_threshold,
            cooldown: config.retry_cooldown_slots,
            retry: RetryPolicy {
                delay: config.retry_delay(),
                jitter: config.retry_jitter(),
            },
            retry_on_failure: config.retry_on_failure,
            halt_on_depleted: config.halt_on_depleted,
        }
    }
}

/// The four state feeds
pub struct Feeds {
    pub slot: Subscription<u64>,
    pub period: Subscription<PeriodRing>,
    pub bids: Subscription<BidSummary>,
    pub balance: Subscription<u64>,
}

/// Inputs owned by whoever drives the core
pub struct CoreInputs {
    pub feeds: Feeds,
    pub commands: mpsc::Receiver<Command>,
    pub responses: mpsc::UnboundedReceiver<CrankResponse>,
    pub fatal: mpsc::Receiver<WorkerError>,
}

type LookupResult = Result<PipelineHandle, (Pubkey, FeedError)>;

/// Receivers for messages the core's own helper tasks send back
pub struct Mailboxes {
    retries: mpsc::Receiver<Pubkey>,
    lookups: mpsc::Receiver<LookupResult>,
}

pub struct DecisionCore {
    settings: CoreSettings,
    slot: u64,
    balance: u64,
    statuses: HashMap<Pubkey, PipelineStatus>,
    waiters: Vec<oneshot::Sender<Result<(), AgentError>>>,
    feed: Arc<dyn StateFeed>,
    crank_tx: mpsc::Sender<CrankRequest>,
    retry_tx: mpsc::Sender<Pubkey>,
    lookup_tx: mpsc::Sender<LookupResult>,
    cancel: CancellationToken,
}

impl DecisionCore {
    pub fn new(
        settings: CoreSettings,
        feed: Arc<dyn StateFeed>,
        crank_tx: mpsc::Sender<CrankRequest>,
        cancel: CancellationToken,
    ) -> (Self, Mailboxes) {
        let (retry_tx, retries) = mpsc::channel(INTERNAL_BUFFER);
        let (lookup_tx, lookups) = mpsc::channel(INTERNAL_BUFFER);
        let core = Self {
            settings,
            slot: 0,
            balance: 0,
            statuses: HashMap::new(),
            waiters: Vec::new(),
            feed,
            crank_tx,
            retry_tx,
            lookup_tx,
            cancel,
        };
        (core, Mailboxes { retries, lookups })
    }

    /// Seed statuses from the startup snapshot
    pub fn seed(&mut self, pipelines: Vec<PipelineHandle>) {
        let slot = self.slot;
        for handle in pipelines {
            match self.statuses.get_mut(&handle.id) {
                Some(status) => status.apply_handle(handle, slot),
                None => {
                    self.statuses.insert(handle.id, PipelineStatus::from_handle(handle, slot));
                }
            }
        }
        log::info!("🌱 Seeded {} pipeline(s)", self.statuses.len());
    }

    #[cfg(test)]
    pub fn status(&self, pipeline: &Pubkey) -> Option<&PipelineStatus> {
        self.statuses.get(pipeline)
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.statuses.len()
    }

    /// Run until cancellation or a fatal error. `Ok(())` means graceful.
    pub async fn run(
        &mut self,
        inputs: &mut CoreInputs,
        mut mailboxes: Mailboxes,
    ) -> Result<(), AgentError> {
        log::info!("▶️  Decision core running ({} pipelines)", self.statuses.len());

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    log::info!("🛑 Decision core received cancellation");
                    return Ok(());
                }

                Some(command) = inputs.commands.recv() => self.on_command(command),

                Some(fatal) = inputs.fatal.recv() => {
                    log::error!("❌ Worker failure is fatal: {}", fatal);
                    return Err(fatal.into());
                }

                Some(response) = inputs.responses.recv() => self.on_response(response),

                Some(lookup) = mailboxes.lookups.recv() => self.on_lookup(lookup),

                Some(pipeline) = mailboxes.retries.recv() => self.on_retry(pipeline).await?,

                slot = inputs.feeds.slot.next() => self.on_slot(slot?).await?,

                ring = inputs.feeds.period.next() => self.on_period(ring?),

                bids = inputs.feeds.bids.next() => self.on_bid_summary(bids?),

                balance = inputs.feeds.balance.next() => self.on_balance(balance?),
            }
        }
    }

    /// Closing: refuse further commands, hand the terminal result to every
    /// registered waiter (including ones still queued) and return it.
    pub fn close(
        &mut self,
        result: Result<(), AgentError>,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Result<(), AgentError> {
        commands.close();
        while let Ok(command) = commands.try_recv() {
            // Replies of other queued commands are dropped and resolve as canceled
            if let Command::RegisterCloseWaiter(waiter) = command {
                self.waiters.push(waiter);
            }
        }

        match &result {
            Ok(()) => log::info!("✅ Decision core closed gracefully"),
            Err(e) => log::error!("❌ Decision core closed with {} error: {}", e.as_label(), e),
        }

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
        result
    }

    pub fn on_command(&mut self, command: Command) {
        match command {
            Command::RegisterCloseWaiter(waiter) => self.waiters.push(waiter),
            Command::Status { pipeline, reply } => {
                let _ = reply.send(self.statuses.get(&pipeline).map(PipelineStatus::view));
            }
            Command::Statuses(reply) => {
                let mut views: Vec<StatusView> =
                    self.statuses.values().map(PipelineStatus::view).collect();
                views.sort_by(|a, b| a.pipeline.cmp(&b.pipeline));
                let _ = reply.send(views);
            }
            Command::Track(handle) => {
                log::info!("➕ Tracking pipeline {}", handle.id);
                self.install(handle);
            }
        }
    }

    /// Advance the slot and try every tracked pipeline
    pub async fn on_slot(&mut self, slot: u64) -> Result<(), AgentError> {
        if slot < self.slot {
            log::debug!("Ignoring slot {} behind current {}", slot, self.slot);
            return Ok(());
        }
        self.slot = slot;

        for status in self.statuses.values_mut() {
            status.refresh_next_crank(slot);
        }

        let ids: Vec<Pubkey> = self.statuses.keys().copied().collect();
        for id in ids {
            if self.cancel.is_cancelled() {
                break;
            }
            self.evaluate(id).await?;
        }
        Ok(())
    }

    pub fn on_period(&mut self, ring: PeriodRing) {
        let slot = self.slot;
        let status = self.ensure_tracked(ring.pipeline);
        status.on_period(ring, slot);
        log::trace!("Period ring for {} next_crank={:?}", status.pipeline, status.next_crank);
    }

    pub fn on_bid_summary(&mut self, bids: BidSummary) {
        self.ensure_tracked(bids.pipeline)
            .on_bid_summary(bids.last_period_start);
    }

    pub fn on_balance(&mut self, lamports: u64) {
        let threshold = self.settings.balance_threshold;
        if lamports <= threshold && self.balance > threshold {
            log::warn!(
                "⚠️  Wallet balance {} dropped to threshold {}; cranking paused",
                lamports,
                self.settings.balance_threshold
            );
        }
        self.balance = lamports;
    }

    pub fn on_response(&mut self, response: CrankResponse) {
        let pipeline = response.request.pipeline;
        let Some(status) = self.statuses.get_mut(&pipeline) else {
            return;
        };

        match response.result {
            Ok(signature) => {
                log::info!(
                    "✅ Cranked {} period_start={} (worker {}, slot {}, attempts {}): {}",
                    pipeline,
                    response.request.period.period.start,
                    response.worker,
                    response.request.slot,
                    response.attempts,
                    signature
                );
            }
            Err(e) => {
                status.crank_failures += 1;
                log::warn!(
                    "⚠️  Crank failed for {} period_start={} after {} attempt(s): {}",
                    pipeline,
                    response.request.period.period.start,
                    response.attempts,
                    e
                );
                if self.settings.retry_on_failure && !status.retry_pending {
                    status.retry_pending = true;
                    spawn_retry(
                        self.feed.clone(),
                        pipeline,
                        self.settings.retry,
                        self.retry_tx.clone(),
                        self.cancel.clone(),
                    );
                }
            }
        }
    }

    pub async fn on_retry(&mut self, pipeline: Pubkey) -> Result<(), AgentError> {
        match self.statuses.get_mut(&pipeline) {
            Some(status) => status.retry_pending = false,
            None => return Ok(()),
        }
        log::debug!("🔁 Retry signal for {}", pipeline);
        self.evaluate(pipeline).await
    }

    fn on_lookup(&mut self, lookup: LookupResult) {
        match lookup {
            Ok(handle) => {
                log::info!("🔎 Loaded pipeline {}", handle.id);
                self.install(handle);
            }
            Err((pipeline, e)) => {
                log::warn!("⚠️  Lookup of pipeline {} failed: {}", pipeline, e);
                if let Some(status) = self.statuses.get_mut(&pipeline) {
                    status.lookup_pending = false;
                }
            }
        }
    }

    fn install(&mut self, handle: PipelineHandle) {
        let id = handle.id;
        let slot = self.slot;
        self.statuses
            .entry(id)
            .or_insert_with(|| PipelineStatus::unknown(id))
            .apply_handle(handle, slot);
    }

    /// Apply the crank policy to one pipeline. Only fatal outcomes are errors.
    async fn evaluate(&mut self, pipeline: Pubkey) -> Result<(), AgentError> {
        match self.try_crank(pipeline).await {
            Ok(_) | Err(CrankError::Canceled) => Ok(()),
            Err(e @ CrankError::DepletedFunds { .. }) => {
                log::warn!("⚠️  Skipping crank of {}: {}", pipeline, e);
                if self.settings.halt_on_depleted {
                    return Err(e.into());
                }
                Ok(())
            }
            Err(e @ CrankError::WorkerUnavailable) => Err(e.into()),
        }
    }

    /// Crank decision for one pipeline.
    ///
    /// Returns `Ok(true)` when a request was handed to the worker queue.
    pub async fn try_crank(&mut self, pipeline: Pubkey) -> Result<bool, CrankError> {
        let request = {
            let Some(status) = self.statuses.get_mut(&pipeline) else {
                return Ok(false);
            };
            if !status.is_due(self.slot, self.settings.cooldown) {
                return Ok(false);
            }
            status.last_attempted_crank = self.slot;

            if self.balance <= self.settings.balance_threshold {
                return Err(CrankError::DepletedFunds {
                    balance: self.balance,
                    threshold: self.settings.balance_threshold,
                });
            }

            let Some(data) = status.data else {
                log::debug!("Pipeline {} has no account data yet", pipeline);
                return Ok(false);
            };
            let Some(period) = status.next_unsettled() else {
                log::trace!("Nothing to crank for {}", pipeline);
                return Ok(false);
            };

            CrankRequest {
                pipeline,
                data,
                period,
                slot: self.slot,
            }
        };

        log::debug!(
            "📤 Queueing crank for {} period_start={} at slot {}",
            pipeline,
            request.period.period.start,
            request.slot
        );
        self.dispatch(request).await?;

        if let Some(status) = self.statuses.get_mut(&pipeline) {
            status.cranks_sent += 1;
        }
        Ok(true)
    }

    /// Blocks until the worker queue accepts the request or cancellation fires
    async fn dispatch(&self, request: CrankRequest) -> Result<(), CrankError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CrankError::Canceled),
            sent = self.crank_tx.send(request) => sent.map_err(|_| CrankError::WorkerUnavailable),
        }
    }

    /// Status for `pipeline`, created on first reference. Unknown pipelines
    /// get a background lookup for their account data.
    fn ensure_tracked(&mut self, pipeline: Pubkey) -> &mut PipelineStatus {
        let status = self
            .statuses
            .entry(pipeline)
            .or_insert_with(|| PipelineStatus::unknown(pipeline));

        if status.data.is_none() && !status.lookup_pending {
            status.lookup_pending = true;
            spawn_lookup(
                self.feed.clone(),
                pipeline,
                self.lookup_tx.clone(),
                self.cancel.clone(),
            );
        }
        status
    }
}

fn spawn_lookup(
    feed: Arc<dyn StateFeed>,
    pipeline: Pubkey,
    tx: mpsc::Sender<LookupResult>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = feed.pipeline_by_id(pipeline) => result.map_err(|e| (pipeline, e)),
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = tx.send(result) => {}
        }
    });
}
