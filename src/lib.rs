pub mod config;
pub mod cranker;
pub mod error;
pub mod feed;
pub mod snapshot;
pub mod submit;

pub use config::{ConfigError, CrankerConfig};
pub use cranker::{Agent, Lifecycle, StatusView};
pub use error::{AgentError, CrankError, FeedError, SubmitError, WorkerError};
pub use feed::{MemoryFeed, StateFeed};
pub use submit::{CrankParams, CrankSubmitter, DryRunSubmitter};
