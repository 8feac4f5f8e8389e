use serde::{Deserialize, Serialize};
use solana_pubkey::Pubkey;

/// A time window `[start, start + length)` measured in slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: u64,
    pub length: u64,
}

impl Period {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// First slot after the period
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    /// True once `slot` has reached the end of the period
    pub fn has_elapsed(&self, slot: u64) -> bool {
        self.end() <= slot
    }
}

/// A populated ring entry: the period plus the account its bids pay out to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodWithPayout {
    pub period: Period,
    pub payout: Pubkey,
}

/// Fixed-capacity circular buffer of a pipeline's recent and upcoming periods.
///
/// `head` is the logical start of the ring and `len` the number of entries in
/// use; both wrap modulo the capacity. Entries may be blank (`None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRing {
    pub pipeline: Pubkey,
    pub slots: Vec<Option<PeriodWithPayout>>,
    pub head: usize,
    pub len: usize,
}

impl PeriodRing {
    /// Empty ring with `capacity` blank entries
    pub fn with_capacity(pipeline: Pubkey, capacity: usize) -> Self {
        Self {
            pipeline,
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    /// Build a ring whose head is at index 0 and holds `periods` in order
    pub fn from_periods(pipeline: Pubkey, capacity: usize, periods: &[PeriodWithPayout]) -> Self {
        let mut ring = Self::with_capacity(pipeline, capacity.max(periods.len()));
        for p in periods {
            ring.push(*p);
        }
        ring
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Append at the tail; once full the oldest entry is overwritten and the
    /// head moves forward.
    pub fn push(&mut self, entry: PeriodWithPayout) {
        let cap = self.capacity();
        if cap == 0 {
            return;
        }
        let tail = (self.head + self.len) % cap;
        self.slots[tail] = Some(entry);
        if self.len < cap {
            self.len += 1;
        } else {
            self.head = (self.head + 1) % cap;
        }
    }

    /// Populated entries in ring order, starting at the head and visiting
    /// exactly `len` positions.
    pub fn iter(&self) -> impl Iterator<Item = &PeriodWithPayout> + '_ {
        let cap = self.capacity();
        let len = if cap == 0 { 0 } else { self.len.min(cap) };
        (0..len).filter_map(move |i| self.slots[(self.head + i) % cap].as_ref())
    }

    /// Populated entries sorted by start slot
    pub fn in_time_order(&self) -> Vec<PeriodWithPayout> {
        let mut out: Vec<PeriodWithPayout> = self.iter().copied().collect();
        out.sort_by_key(|p| p.period.start);
        out
    }

    /// The first entry (ring order) that has already elapsed at `slot`
    pub fn earliest_elapsed(&self, slot: u64) -> Option<&PeriodWithPayout> {
        self.iter().find(|p| p.period.has_elapsed(slot))
    }

    /// The period with the smallest start strictly after `last_period_start`
    pub fn next_after(&self, last_period_start: u64) -> Option<PeriodWithPayout> {
        self.in_time_order()
            .into_iter()
            .find(|p| p.period.start > last_period_start)
    }
}

/// Aggregate confirmation that a pipeline's bids up to a period are final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidSummary {
    pub pipeline: Pubkey,
    pub last_period_start: u64,
}

/// Accounts needed to build a crank transaction for a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineData {
    pub controller: Pubkey,
    pub vault: Pubkey,
    pub fee_vault: Pubkey,
}

/// One-shot view of a pipeline as returned by the feed's lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineHandle {
    pub id: Pubkey,
    pub data: PipelineData,
    pub periods: Option<PeriodRing>,
    pub bids: Option<BidSummary>,
}
