//! Pipeline orchestration.
//!
//! Runs the three stages in their required order — cache sync, then index
//! build, then attachment reconciliation — with each stage starting only
//! after its predecessor's output is durably visible. A lock marker under
//! the data directory guarantees at most one run at a time; a second
//! invocation refuses to start rather than racing the first.

use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::attachments::{self, ReconcileOutcome};
use crate::build::{self, IndexSyncOutcome};
use crate::cache;
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::progress::ProgressReporter;
use crate::remote::RemoteClient;
use crate::sync::{self, CacheSyncOutcome, CancelFlag};

/// Exclusive run marker. Removed on drop, so a failed run never wedges the
/// next one; a marker left behind by a killed process must be cleaned with
/// `bibm clean` or by hand.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(config: &Config) -> Result<Self> {
        let path = config.storage.lock_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(SyncError::RunLocked(path))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub cache: Option<CacheSyncOutcome>,
    pub index: Option<IndexSyncOutcome>,
    pub attachments: Option<ReconcileOutcome>,
}

/// The full pipeline: cache → index → attachments. Records the
/// last-successful-sync timestamp only when every stage completed.
pub async fn run_all(
    config: &Config,
    force_full: bool,
    progress: &dyn ProgressReporter,
    cancel: &CancelFlag,
) -> Result<PipelineOutcome> {
    let _lock = RunLock::acquire(config)?;

    let pool = cache::connect(config).await?;
    cache::run_migrations(&pool).await?;
    let client = RemoteClient::new(config)?;

    let cache_outcome = sync::run_cache_sync(config, &pool, &client, force_full, progress, cancel).await?;
    let index_outcome = build::run_index_sync(config, &pool, progress).await?;
    let attachment_outcome = attachments::run_attachment_sync(config, &client, progress).await?;

    cache::record_last_sync(&pool, Utc::now()).await?;
    pool.close().await;

    Ok(PipelineOutcome {
        cache: Some(cache_outcome),
        index: Some(index_outcome),
        attachments: Some(attachment_outcome),
    })
}

pub async fn run_cache_only(
    config: &Config,
    force_full: bool,
    progress: &dyn ProgressReporter,
    cancel: &CancelFlag,
) -> Result<CacheSyncOutcome> {
    let _lock = RunLock::acquire(config)?;
    let pool = cache::connect(config).await?;
    cache::run_migrations(&pool).await?;
    let client = RemoteClient::new(config)?;
    let outcome = sync::run_cache_sync(config, &pool, &client, force_full, progress, cancel).await;
    pool.close().await;
    outcome
}

pub async fn run_index_only(
    config: &Config,
    progress: &dyn ProgressReporter,
) -> Result<IndexSyncOutcome> {
    let _lock = RunLock::acquire(config)?;
    let pool = cache::connect(config).await?;
    cache::run_migrations(&pool).await?;
    let outcome = build::run_index_sync(config, &pool, progress).await;
    pool.close().await;
    outcome
}

pub async fn run_attachments_only(
    config: &Config,
    progress: &dyn ProgressReporter,
) -> Result<ReconcileOutcome> {
    let _lock = RunLock::acquire(config)?;
    let client = RemoteClient::new(config)?;
    attachments::run_attachment_sync(config, &client, progress).await
}

/// Timestamp of the last fully successful run, for the monitoring
/// endpoint. `None` when no run has ever completed (or no cache exists).
pub async fn last_sync_time(config: &Config) -> Result<Option<DateTime<Utc>>> {
    if !config.storage.cache_path().exists() {
        return Ok(None);
    }
    let pool = cache::connect(config).await?;
    cache::run_migrations(&pool).await?;
    let when = cache::get_last_sync(&pool).await?;
    pool.close().await;
    Ok(when)
}
