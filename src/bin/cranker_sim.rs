//! Cranker Simulator
//!
//! Runs the cranker agent against an in-process feed:
//! - A synthetic slot clock publishes slots at a fixed pace
//! - Each pipeline's period ring rolls forward as periods elapse
//! - Successful cranks are confirmed by publishing a bid summary
//! - A share of cranks fails at random to exercise the retry path
//!
//! Usage:
//!   cargo run --release --bin cranker_sim
//!
//! Environment variables (plus every `CrankerConfig` variable):
//!   SIM_PIPELINES - Number of simulated pipelines (default: 3)
//!   SIM_SLOT_MS - Milliseconds per slot (default: 400)
//!   SIM_PERIOD_SLOTS - Period length in slots (default: 20)
//!   SIM_RING_CAPACITY - Periods kept per ring (default: 4)
//!   SIM_FAILURE_RATE - Probability a crank fails, 0.0-1.0 (default: 0.1)
//!   SIM_BALANCE_LAMPORTS - Starting wallet balance (default: 1000000000)
//!   SIM_CRANK_FEE_LAMPORTS - Balance spent per crank (default: 5000)
//!   CRANKER_SNAPSHOT_PATH - Report the previous run's statuses from this file
//!     and autosave to it
//!   CRANKER_SNAPSHOT_INTERVAL_SECS - Autosave interval (default: 60)

use async_trait::async_trait;
use cranker::config::ConfigError;
use cranker::cranker::Agent;
use cranker::feed::{
    BidSummary, MemoryFeed, Period, PeriodRing, PeriodWithPayout, PipelineData, PipelineHandle,
};
use cranker::snapshot::{autosave_task, load_statuses, SnapshotConfig};
use cranker::submit::{CrankParams, CrankSubmitter, DryRunSubmitter};
use cranker::{CrankerConfig, SubmitError};
use dotenv::dotenv;
use log::{error, info, warn};
use rand::Rng;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FIRST_SLOT: u64 = 1_000;

struct SimConfig {
    pipelines: usize,
    slot_ms: u64,
    period_slots: u64,
    ring_capacity: usize,
    failure_rate: f64,
    balance: u64,
    crank_fee: u64,
    snapshot: Option<SnapshotConfig>,
}

impl SimConfig {
    fn from_env() -> Self {
        let snapshot = env::var("CRANKER_SNAPSHOT_PATH").ok().map(|path| SnapshotConfig {
            file_path: PathBuf::from(path),
            autosave_interval: Duration::from_secs(env_or("CRANKER_SNAPSHOT_INTERVAL_SECS", 60)),
        });

        Self {
            pipelines: env_or("SIM_PIPELINES", 3),
            slot_ms: env_or("SIM_SLOT_MS", 400),
            period_slots: env_or::<u64>("SIM_PERIOD_SLOTS", 20).max(1),
            ring_capacity: env_or::<usize>("SIM_RING_CAPACITY", 4).max(1),
            failure_rate: env_or("SIM_FAILURE_RATE", 0.1_f64).clamp(0.0, 1.0),
            balance: env_or("SIM_BALANCE_LAMPORTS", 1_000_000_000),
            crank_fee: env_or("SIM_CRANK_FEE_LAMPORTS", 5_000),
            snapshot,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn random_key() -> Pubkey {
    Pubkey::new_from_array(rand::thread_rng().gen())
}

/// Dry-run submitter that fails at random and confirms successful cranks on the feed
struct SimSubmitter {
    inner: DryRunSubmitter,
    feed: Arc<MemoryFeed>,
    wallet: Pubkey,
    balance: AtomicU64,
    crank_fee: u64,
    failure_rate: f64,
}

#[async_trait]
impl CrankSubmitter for SimSubmitter {
    async fn crank(&self, params: &CrankParams) -> Result<Signature, SubmitError> {
        let roll: f64 = rand::thread_rng().gen();
        if roll < self.failure_rate {
            return Err(SubmitError::Network("simulated RPC timeout".to_string()));
        }

        let signature = self.inner.crank(params).await?;

        let fee = self.crank_fee;
        let remaining = self
            .balance
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| Some(b.saturating_sub(fee)))
            .map_or(0, |prev| prev.saturating_sub(fee));
        self.feed.publish_balance(self.wallet, remaining).await;
        self.feed
            .publish_bid_summary(BidSummary {
                pipeline: params.pipeline,
                last_period_start: params.period.period.start,
            })
            .await;

        Ok(signature)
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}

/// Seed the feed's registry with `count` pipelines, one open period each
fn seed_pipelines(count: usize, sim: &SimConfig) -> Vec<PipelineHandle> {
    (0..count)
        .map(|i| {
            let id = random_key();
            // Stagger the pipelines so their periods do not all end together
            let start = FIRST_SLOT + i as u64 * (sim.period_slots / count.max(1) as u64);
            let ring = PeriodRing::from_periods(
                id,
                sim.ring_capacity,
                &[PeriodWithPayout {
                    period: Period::new(start, sim.period_slots),
                    payout: random_key(),
                }],
            );
            PipelineHandle {
                id,
                data: PipelineData {
                    controller: random_key(),
                    vault: random_key(),
                    fee_vault: random_key(),
                },
                periods: Some(ring),
                bids: None,
            }
        })
        .collect()
}

/// Publish one slot per tick and roll rings forward as their last period elapses
async fn slot_clock(
    feed: Arc<MemoryFeed>,
    mut rings: Vec<PeriodRing>,
    slot_ms: u64,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(slot_ms.max(1)));
    let mut slot = FIRST_SLOT;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for ring in rings.iter_mut() {
            let Some(latest) = ring.in_time_order().last().copied() else {
                continue;
            };
            if latest.period.has_elapsed(slot) {
                ring.push(PeriodWithPayout {
                    period: Period::new(latest.period.end(), latest.period.length),
                    payout: random_key(),
                });
                feed.publish_period(ring.clone()).await;
            }
        }

        feed.publish_slot(slot).await;
        if slot % 100 == 0 {
            log::debug!("⏱️  Slot {}", slot);
        }
        slot += 1;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let (config, generated_wallet) = match CrankerConfig::from_env() {
        Ok(config) => (config, false),
        Err(ConfigError::MissingVariable(_)) => (CrankerConfig::new(random_key()), true),
        Err(e) => return Err(e.into()),
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.rust_log))
        .target(env_logger::Target::Stderr)
        .init();

    let sim = SimConfig::from_env();

    info!("🚀 Cranker Simulator");
    if generated_wallet {
        warn!("⚠️  CRANKER_WALLET not set, using generated wallet");
    }
    info!("   ├─ Wallet: {}", config.wallet);
    info!("   ├─ Pipelines: {}", sim.pipelines);
    info!("   ├─ Slot pace: {}ms", sim.slot_ms);
    info!("   ├─ Period length: {} slots", sim.period_slots);
    info!("   ├─ Failure rate: {:.0}%", sim.failure_rate * 100.0);
    info!("   └─ Workers: {}", config.worker_count);

    // Pipelines are generated fresh each run, so the previous snapshot is only reported
    if let Some(snapshot) = &sim.snapshot {
        match load_statuses(&snapshot.file_path) {
            Ok(previous) => {
                for view in &previous {
                    info!(
                        "   📜 {} last_period_start={} sent={} failed={}",
                        view.pipeline, view.last_period_start, view.cranks_sent, view.crank_failures
                    );
                }
            }
            Err(e) => warn!("⚠️  Previous snapshot unreadable: {}", e),
        }
    }

    let feed = Arc::new(MemoryFeed::new());
    let handles = seed_pipelines(sim.pipelines, &sim);
    let rings: Vec<PeriodRing> = handles.iter().filter_map(|h| h.periods.clone()).collect();
    for handle in handles {
        feed.insert_pipeline(handle).await;
    }

    let submitter = Arc::new(SimSubmitter {
        inner: DryRunSubmitter::new(),
        feed: feed.clone(),
        wallet: config.wallet,
        balance: AtomicU64::new(sim.balance),
        crank_fee: sim.crank_fee,
        failure_rate: sim.failure_rate,
    });

    let wallet = config.wallet;
    let agent = Arc::new(Agent::create(config, feed.clone(), submitter.clone()).await?);
    info!("✅ Agent running");

    feed.publish_balance(wallet, sim.balance).await;

    let cancel = agent.cancellation_token();
    tokio::spawn(slot_clock(feed.clone(), rings, sim.slot_ms, cancel));

    if let Some(snapshot) = sim.snapshot {
        info!("💾 Autosaving statuses to {}", snapshot.file_path.display());
        tokio::spawn(autosave_task(agent.clone(), snapshot));
    }

    info!("🔄 Press CTRL+C to shutdown gracefully");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
            Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
        },
        result = agent.close_signal() => {
            if let Err(e) = result {
                error!("❌ Agent stopped: {}", e);
            }
        }
    }

    match agent.statuses().await {
        Ok(views) => println!("{}", serde_json::to_string_pretty(&views)?),
        Err(e) => warn!("⚠️  Statuses unavailable: {}", e),
    }

    let result = agent.close().await;
    info!("📊 Cranks sent: {}", submitter.inner.sent());
    match result {
        Ok(()) => {
            info!("✅ Cranker simulator stopped");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
