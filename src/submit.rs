//! Transaction collaborator contract.
//!
//! Building, signing, sending and confirming the settlement transaction is
//! someone else's job; the execution worker only hands over [`CrankParams`].

use crate::error::SubmitError;
use crate::feed::PeriodWithPayout;
use async_trait::async_trait;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use std::sync::atomic::{AtomicU64, Ordering};

/// Everything needed to build one crank transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrankParams {
    /// Fee payer and signer of the transaction
    pub payer: Pubkey,
    pub pipeline: Pubkey,
    pub controller: Pubkey,
    pub vault: Pubkey,
    pub fee_vault: Pubkey,
    pub period: PeriodWithPayout,
}

#[async_trait]
pub trait CrankSubmitter: Send + Sync {
    /// Build, sign, submit and confirm the crank. Returns the confirmed signature.
    async fn crank(&self, params: &CrankParams) -> Result<Signature, SubmitError>;

    fn name(&self) -> &'static str;
}

/// Submitter that only logs what it would send
#[derive(Debug, Default)]
pub struct DryRunSubmitter {
    sent: AtomicU64,
}

impl DryRunSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cranks "sent" so far
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CrankSubmitter for DryRunSubmitter {
    async fn crank(&self, params: &CrankParams) -> Result<Signature, SubmitError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "🧪 [dry-run] crank pipeline={} period_start={} payout={} payer={}",
            params.pipeline,
            params.period.period.start,
            params.period.payout,
            params.payer
        );
        Ok(Signature::default())
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}
