use {
    crate::cranker::{Agent, StatusView},
    serde::{Deserialize, Serialize},
    std::{fs, io, path::{Path, PathBuf}, sync::Arc, time::Duration},
    thiserror::Error,
    tokio::time::interval,
};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Autosave configuration
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub file_path: PathBuf,
    pub autosave_interval: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            file_path: PathBuf::from("cranker_status.json"),
            autosave_interval: Duration::from_secs(60),
        }
    }
}

/// Statuses of every tracked pipeline at one point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub statuses: Vec<StatusView>,
    pub timestamp: i64,
}

/// Save status views to a JSON file
pub fn save_statuses(views: &[StatusView], path: &Path) -> Result<(), SnapshotError> {
    let snapshot = StatusSnapshot {
        statuses: views.to_vec(),
        timestamp: chrono::Utc::now().timestamp(),
    };

    let json = serde_json::to_string_pretty(&snapshot)?;
    fs::write(path, json)?;

    log::debug!("Saved {} pipeline status(es) to {}", views.len(), path.display());
    Ok(())
}

/// Load status views from a JSON file; a missing file is an empty snapshot
pub fn load_statuses(path: &Path) -> Result<Vec<StatusView>, SnapshotError> {
    if !path.exists() {
        log::info!("No existing snapshot file found: {}", path.display());
        return Ok(Vec::new());
    }

    let json = fs::read_to_string(path)?;
    let snapshot: StatusSnapshot = serde_json::from_str(&json)?;

    log::info!(
        "Loaded {} pipeline status(es) from {}",
        snapshot.statuses.len(),
        path.display()
    );
    Ok(snapshot.statuses)
}

/// Periodically save the agent's statuses until it starts closing
pub async fn autosave_task(agent: Arc<Agent>, config: SnapshotConfig) {
    let cancel = agent.cancellation_token();
    let mut interval_timer = interval(config.autosave_interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval_timer.tick() => {}
        }

        let views = match agent.statuses().await {
            Ok(views) => views,
            Err(e) => {
                log::debug!("Snapshot autosave stopping: {}", e);
                break;
            }
        };

        if let Err(e) = save_statuses(&views, &config.file_path) {
            log::warn!("⚠️  Failed to save snapshot: {}", e);
        }
    }
}
