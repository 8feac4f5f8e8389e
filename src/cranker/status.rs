//! Per-pipeline scheduling state.
//!
//! Owned by the decision core and mutated only from its loop. The rules here
//! are pure so they hold regardless of how the feeds interleave.

use crate::feed::{PeriodRing, PeriodWithPayout, PipelineData, PipelineHandle};
use serde::{Deserialize, Serialize};
use solana_pubkey::Pubkey;

#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub pipeline: Pubkey,
    /// `None` until a lookup delivered the pipeline's accounts
    pub data: Option<PipelineData>,
    pub ring: Option<PeriodRing>,
    pub last_period_start: u64,
    pub last_attempted_crank: u64,
    /// `None` means no crank has been scheduled yet
    pub next_crank: Option<u64>,
    pub retry_pending: bool,
    pub lookup_pending: bool,
    pub cranks_sent: u64,
    pub crank_failures: u64,
}

impl PipelineStatus {
    /// Status created on first reference, before the pipeline's data is known
    pub fn unknown(pipeline: Pubkey) -> Self {
        Self {
            pipeline,
            data: None,
            ring: None,
            last_period_start: 0,
            last_attempted_crank: 0,
            next_crank: None,
            retry_pending: false,
            lookup_pending: false,
            cranks_sent: 0,
            crank_failures: 0,
        }
    }

    /// Status seeded from a snapshot
    pub fn from_handle(handle: PipelineHandle, slot: u64) -> Self {
        let mut status = Self::unknown(handle.id);
        status.apply_handle(handle, slot);
        status
    }

    /// Install the pipeline's accounts; ring and bids only fill gaps so a
    /// stale snapshot never overwrites fresher feed data.
    pub fn apply_handle(&mut self, handle: PipelineHandle, slot: u64) {
        self.data = Some(handle.data);
        self.lookup_pending = false;
        if self.ring.is_none() {
            if let Some(ring) = handle.periods {
                self.on_period(ring, slot);
            }
        }
        if let Some(bids) = handle.bids {
            self.on_bid_summary(bids.last_period_start);
        }
    }

    /// Replace the ring and re-derive `next_crank` from it.
    ///
    /// The earliest elapsed period (ring order) becomes the next crank slot;
    /// if none has elapsed yet the previous value is kept.
    pub fn on_period(&mut self, ring: PeriodRing, slot: u64) {
        if let Some(due) = ring.earliest_elapsed(slot) {
            self.next_crank = Some(due.period.start);
        }
        self.ring = Some(ring);
    }

    /// Derive `next_crank` from the stored ring if it is still unset
    pub fn refresh_next_crank(&mut self, slot: u64) {
        if self.next_crank.is_some() {
            return;
        }
        if let Some(due) = self.ring.as_ref().and_then(|r| r.earliest_elapsed(slot)) {
            self.next_crank = Some(due.period.start);
        }
    }

    /// Max-merge: a stale summary never moves the cursor backwards
    pub fn on_bid_summary(&mut self, last_period_start: u64) {
        if last_period_start < self.last_period_start {
            log::debug!(
                "Ignoring stale bid summary for {}: {} < {}",
                self.pipeline,
                last_period_start,
                self.last_period_start
            );
            return;
        }
        self.last_period_start = last_period_start;
    }

    /// Due and out of cooldown at `slot`
    pub fn is_due(&self, slot: u64, cooldown: u64) -> bool {
        match self.next_crank {
            Some(next) => {
                next <= slot && self.last_attempted_crank.saturating_add(cooldown) < slot
            }
            None => false,
        }
    }

    /// Earliest period not yet known to be finalized
    pub fn next_unsettled(&self) -> Option<PeriodWithPayout> {
        self.ring
            .as_ref()
            .and_then(|r| r.next_after(self.last_period_start))
    }

    pub fn view(&self) -> StatusView {
        StatusView {
            pipeline: self.pipeline.to_string(),
            has_data: self.data.is_some(),
            ring_len: self.ring.as_ref().map_or(0, |r| r.iter().count()),
            last_period_start: self.last_period_start,
            last_attempted_crank: self.last_attempted_crank,
            next_crank: self.next_crank,
            retry_pending: self.retry_pending,
            cranks_sent: self.cranks_sent,
            crank_failures: self.crank_failures,
            observed_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Read-only copy of a status handed out through the control surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    pub pipeline: String,
    pub has_data: bool,
    pub ring_len: usize,
    pub last_period_start: u64,
    pub last_attempted_crank: u64,
    pub next_crank: Option<u64>,
    pub retry_pending: bool,
    pub cranks_sent: u64,
    pub crank_failures: u64,
    pub observed_at: i64,
}
