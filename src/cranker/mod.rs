//! # Cranker agent
//!
//! Keeps auction pipelines moving by settling ("cranking") every period once
//! it has elapsed.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──► Running ──► Closing ──► Closed
//!    │                       ▲
//!    └── startup error ──────┘ (reported by Agent::create)
//! ```
//!
//! - **Created**: subscribe to the four feeds and load the pipeline snapshot.
//!   Any failure is returned from [`Agent::create`].
//! - **Running**: the [`DecisionCore`] loop.
//! - **Closing**: triggered by [`Agent::close`], by a shared feed error or by
//!   a worker whose submitter panicked. A failed crank only touches its own
//!   pipeline and never closes the agent. Workers are joined and each
//!   registered close-waiter receives the terminal result exactly once.
//! - **Closed**: commands fail with [`AgentError::Closed`].
//!
//! ## Modules
//!
//! - `decision` - the single-task decision loop and crank policy
//! - `status` - per-pipeline scheduling state
//! - `worker` - execution worker pool
//! - `retry` - retry scheduler
//! - `backoff` - pacing of in-request crank retries

pub mod backoff;
pub mod decision;
pub mod retry;
pub mod status;
pub mod worker;

pub use decision::{Command, CoreSettings, DecisionCore};
pub use status::{PipelineStatus, StatusView};
pub use worker::{CrankRequest, CrankResponse, WorkerPool, WorkerSettings};

use decision::{CoreInputs, Feeds};
use crate::config::CrankerConfig;
use crate::error::{AgentError, FeedError};
use crate::feed::{PipelineHandle, StateFeed};
use crate::submit::CrankSubmitter;
use solana_pubkey::Pubkey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Closing,
    Closed,
}

type Terminal = Option<Result<(), AgentError>>;

/// Handle to a running cranker.
///
/// All interaction with the decision core goes through its command mailbox;
/// every send races the agent's cancellation token.
pub struct Agent {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    lifecycle: watch::Receiver<Lifecycle>,
    terminal: watch::Receiver<Terminal>,
}

impl Agent {
    /// Start the agent. Returns once the feeds are subscribed and the
    /// pipeline snapshot is loaded, or with the error that prevented it.
    pub async fn create(
        config: CrankerConfig,
        feed: Arc<dyn StateFeed>,
        submitter: Arc<dyn CrankSubmitter>,
    ) -> Result<Self, AgentError> {
        config
            .validate()
            .map_err(|e| AgentError::Config(e.to_string()))?;

        let cancel = CancellationToken::new();
        let (commands, command_rx) = mpsc::channel(config.command_buffer);
        let (lifecycle_tx, lifecycle) = watch::channel(Lifecycle::Created);
        let (terminal_tx, terminal) = watch::channel(None);
        let (ready_tx, ready_rx) = oneshot::channel();

        let runtime = AgentRuntime {
            config,
            feed,
            submitter,
            cancel: cancel.clone(),
            lifecycle: lifecycle_tx,
            terminal: terminal_tx,
        };
        tokio::spawn(runtime.run(command_rx, ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                commands,
                cancel,
                lifecycle,
                terminal,
            }),
            Ok(Err(e)) => {
                cancel.cancel();
                Err(e)
            }
            Err(_) => {
                cancel.cancel();
                Err(AgentError::Canceled)
            }
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Token cancelled when the agent starts closing
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Resolve with the terminal result without triggering shutdown.
    ///
    /// `Ok(())` after a graceful close, otherwise the first fatal error.
    pub async fn close_signal(&self) -> Result<(), AgentError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::RegisterCloseWaiter(tx)).await.is_ok() {
            if let Ok(result) = rx.await {
                return result;
            }
        }
        self.wait_terminal().await
    }

    /// Register for the terminal result, trigger shutdown and wait for it
    pub async fn close(&self) -> Result<(), AgentError> {
        let (tx, rx) = oneshot::channel();
        let registered = self.send(Command::RegisterCloseWaiter(tx)).await.is_ok();
        self.cancel.cancel();

        if registered {
            if let Ok(result) = rx.await {
                return result;
            }
        }
        self.wait_terminal().await
    }

    /// Scheduling state of one pipeline
    pub async fn pipeline_status(
        &self,
        pipeline: Pubkey,
    ) -> Result<Option<StatusView>, AgentError> {
        self.request(|reply| Command::Status { pipeline, reply }).await
    }

    /// Scheduling state of every tracked pipeline, ordered by pipeline id
    pub async fn statuses(&self) -> Result<Vec<StatusView>, AgentError> {
        self.request(Command::Statuses).await
    }

    /// Start tracking `handle` (or refresh its accounts)
    pub async fn track(&self, handle: PipelineHandle) -> Result<(), AgentError> {
        self.send(Command::Track(handle)).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| AgentError::Canceled)
    }

    async fn send(&self, command: Command) -> Result<(), AgentError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AgentError::Closed),
            sent = self.commands.send(command) => sent.map_err(|_| AgentError::Closed),
        }
    }

    async fn wait_terminal(&self) -> Result<(), AgentError> {
        let mut terminal = self.terminal.clone();
        let _ = terminal.wait_for(Option::is_some).await;
        let result = terminal.borrow().clone();
        result.unwrap_or(Err(AgentError::Canceled))
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        // Nobody is left to close the agent
        self.cancel.cancel();
    }
}

/// State moved into the agent's task
struct AgentRuntime {
    config: CrankerConfig,
    feed: Arc<dyn StateFeed>,
    submitter: Arc<dyn CrankSubmitter>,
    cancel: CancellationToken,
    lifecycle: watch::Sender<Lifecycle>,
    terminal: watch::Sender<Terminal>,
}

impl AgentRuntime {
    async fn run(
        self,
        command_rx: mpsc::Receiver<Command>,
        ready: oneshot::Sender<Result<(), AgentError>>,
    ) {
        log::info!("🚀 Starting cranker for wallet {}", self.config.wallet);

        let (feeds, pipelines) = match self.startup().await {
            Ok(started) => started,
            Err(e) => {
                log::error!("❌ Cranker startup failed: {}", e);
                let err = AgentError::from(e);
                self.cancel.cancel();
                self.lifecycle.send_replace(Lifecycle::Closed);
                self.terminal.send_replace(Some(Err(err.clone())));
                let _ = ready.send(Err(err));
                return;
            }
        };

        let (crank_tx, crank_rx) = mpsc::channel(worker::REQUEST_QUEUE_CAPACITY);
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = mpsc::channel(self.config.worker_count.max(1));

        let (mut core, mailboxes) = DecisionCore::new(
            CoreSettings::from(&self.config),
            self.feed.clone(),
            crank_tx,
            self.cancel.clone(),
        );
        core.seed(pipelines);

        let workers = WorkerPool::spawn(
            self.config.worker_count,
            WorkerSettings {
                payer: self.config.wallet,
                backoff_initial: Duration::from_millis(self.config.worker_backoff_initial_ms),
                backoff_max: Duration::from_millis(self.config.worker_backoff_max_ms),
                max_retries: self.config.worker_max_retries,
            },
            self.submitter.clone(),
            crank_rx,
            response_tx,
            fatal_tx,
            self.cancel.clone(),
        );

        self.lifecycle.send_replace(Lifecycle::Running);
        if ready.send(Ok(())).is_err() {
            // Creator went away before startup finished
            self.cancel.cancel();
        }

        let mut inputs = CoreInputs {
            feeds,
            commands: command_rx,
            responses: response_rx,
            fatal: fatal_rx,
        };
        let result = core.run(&mut inputs, mailboxes).await;

        self.lifecycle.send_replace(Lifecycle::Closing);
        self.cancel.cancel();
        workers.join().await;

        let result = core.close(result, &mut inputs.commands);
        self.terminal.send_replace(Some(result));
        self.lifecycle.send_replace(Lifecycle::Closed);
        log::info!("👋 Cranker stopped");
    }

    async fn startup(&self) -> Result<(Feeds, Vec<PipelineHandle>), FeedError> {
        let feed = self.feed.as_ref();
        let feeds = Feeds {
            slot: feed.subscribe_slot(self.cancel.clone()).await?,
            period: feed.subscribe_period(None, self.cancel.clone()).await?,
            bids: feed.subscribe_bid_summary(self.cancel.clone()).await?,
            balance: feed
                .subscribe_balance(self.config.wallet, self.cancel.clone())
                .await?,
        };
        let pipelines = feed.list_all_pipelines().await?;
        log::info!("📡 Feeds subscribed, {} pipeline(s) known", pipelines.len());
        Ok((feeds, pipelines))
    }
}
