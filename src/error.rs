//! Error types shared by the feed, worker and decision core.
//!
//! Feed and worker errors are agent-fatal. Crank and submit errors are local
//! to a single pipeline evaluation and never stop the agent on their own.

use solana_pubkey::Pubkey;
use thiserror::Error;

/// Errors raised by a state feed subscription or lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The stream ended; the feed can no longer be trusted.
    #[error("{0} feed closed")]
    Closed(&'static str),

    /// The stream delivered an error and terminated.
    #[error("{feed} feed error: {message}")]
    Stream {
        feed: &'static str,
        message: String,
    },

    /// Subscription could not be established.
    #[error("failed to subscribe to {feed}: {message}")]
    Subscribe {
        feed: &'static str,
        message: String,
    },

    #[error("unknown pipeline {0}")]
    UnknownPipeline(Pubkey),
}

/// Errors returned by the transaction collaborator.
///
/// The worker does not branch on the variant; they exist for logging.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("transaction validation failed: {0}")]
    Validation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("transaction rejected on-chain: {0}")]
    Rejected(String),
}

/// Errors from a single crank evaluation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrankError {
    #[error("wallet balance {balance} is at or below threshold {threshold}")]
    DepletedFunds { balance: u64, threshold: u64 },

    /// Cancellation arrived while waiting for the worker queue.
    #[error("crank canceled")]
    Canceled,

    /// Every worker has exited.
    #[error("no execution worker is accepting requests")]
    WorkerUnavailable,
}

/// Errors reported on the worker fatal channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The submitter panicked, so the request it held cannot be answered.
    #[error("worker {worker} lost its submitter while cranking {pipeline}")]
    SubmitterPanicked { worker: usize, pipeline: Pubkey },
}

/// Terminal and control-surface errors of the agent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Crank(#[from] CrankError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A reply was dropped because shutdown began first.
    #[error("agent canceled")]
    Canceled,

    /// The agent no longer accepts commands.
    #[error("agent closed")]
    Closed,
}

impl AgentError {
    /// Short stable label for log lines.
    pub fn as_label(&self) -> &'static str {
        match self {
            AgentError::Feed(_) => "feed",
            AgentError::Worker(_) => "worker",
            AgentError::Crank(_) => "crank",
            AgentError::Config(_) => "config",
            AgentError::Canceled => "canceled",
            AgentError::Closed => "closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CrankError::DepletedFunds {
            balance: 1,
            threshold: 5,
        };
        assert_eq!(
            err.to_string(),
            "wallet balance 1 is at or below threshold 5"
        );

        let err = AgentError::from(FeedError::Closed("slot"));
        assert_eq!(err.to_string(), "slot feed closed");
        assert_eq!(err.as_label(), "feed");
    }

    #[test]
    fn test_worker_error_names_the_pipeline() {
        let pipeline = Pubkey::new_from_array([7; 32]);
        let err = AgentError::from(WorkerError::SubmitterPanicked {
            worker: 2,
            pipeline,
        });
        assert!(err.to_string().starts_with("worker 2 lost its submitter"));
        assert!(err.to_string().ends_with(&pipeline.to_string()));
        assert_eq!(err.as_label(), "worker");
    }
}
