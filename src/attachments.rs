//! Attachment reconciler.
//!
//! Converges local file storage onto the attachment manifest of the live
//! index generation — never the cache directly, so what is on disk always
//! matches what is searchable. Files are compared by MD5 content hash;
//! mismatched or missing files are fetched through the remote client and
//! written atomically (temp file + rename). Local files no longer
//! referenced by the manifest are deleted. Individual fetch failures are
//! logged and skipped; the pass is idempotent and safe to re-run.

use md5::{Digest, Md5};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::index::IndexReader;
use crate::models::AttachmentEntry;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::remote::RemoteClient;

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub checked: u64,
    pub downloaded: u64,
    pub deleted: u64,
    pub failed: u64,
}

pub async fn run_attachment_sync(
    config: &Config,
    client: &RemoteClient,
    progress: &dyn ProgressReporter,
) -> Result<ReconcileOutcome> {
    let reader = match IndexReader::open_live(config).await? {
        Some(reader) => reader,
        None => {
            tracing::info!("no committed index generation, nothing to reconcile");
            return Ok(ReconcileOutcome::default());
        }
    };
    let manifest = reader.manifest().await?;
    reader.close().await;

    let dir = config.storage.attachments_dir();
    std::fs::create_dir_all(&dir)?;

    let mut outcome = ReconcileOutcome::default();
    let total = manifest.len() as u64;

    for entry in &manifest {
        outcome.checked += 1;
        progress.report(ProgressEvent::Reconciling {
            checked: outcome.checked,
            total,
        });

        match reconcile_one(client, &dir, entry).await {
            Ok(true) => outcome.downloaded += 1,
            Ok(false) => {}
            Err(e) => {
                // Per-file failures never abort the pass.
                tracing::warn!(key = %entry.key, error = %e, "attachment reconciliation failed");
                outcome.failed += 1;
            }
        }
    }

    outcome.deleted = delete_orphans(&dir, &manifest)?;

    tracing::info!(
        checked = outcome.checked,
        downloaded = outcome.downloaded,
        deleted = outcome.deleted,
        failed = outcome.failed,
        "attachment reconciliation finished"
    );
    Ok(outcome)
}

/// Returns `Ok(true)` when the file was (re-)downloaded, `Ok(false)` when
/// the local copy already matched.
async fn reconcile_one(
    client: &RemoteClient,
    dir: &Path,
    entry: &AttachmentEntry,
) -> Result<bool> {
    let target = attachment_path(dir, entry);

    if let Some(local_md5) = hash_file(&target)? {
        if local_md5 == entry.md5 {
            return Ok(false);
        }
    }

    let bytes = client.fetch_attachment(&entry.key).await.map_err(|e| {
        SyncError::AttachmentFetch {
            key: entry.key.clone(),
            message: e.to_string(),
        }
    })?;

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Temp + rename so readers never see a partially-written file.
    let tmp = target.with_file_name(format!("{}.part", entry.filename));
    std::fs::write(&tmp, &bytes)?;
    std::fs::rename(&tmp, &target)?;

    tracing::debug!(key = %entry.key, file = %entry.filename, bytes = bytes.len(), "attachment downloaded");
    Ok(true)
}

/// `<attachments>/<key>/<filename>`: keyed directories keep colliding
/// filenames from different items apart.
fn attachment_path(dir: &Path, entry: &AttachmentEntry) -> PathBuf {
    dir.join(&entry.key).join(&entry.filename)
}

/// MD5 of a local file, or `None` when it does not exist.
fn hash_file(path: &Path) -> Result<Option<String>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut hasher = Md5::new();
    hasher.update(&bytes);
    Ok(Some(format!("{:x}", hasher.finalize())))
}

/// Remove every keyed directory (and stray file inside a kept directory)
/// the manifest no longer references.
fn delete_orphans(dir: &Path, manifest: &[AttachmentEntry]) -> Result<u64> {
    use std::collections::{HashMap, HashSet};

    let mut wanted: HashMap<&str, HashSet<&str>> = HashMap::new();
    for entry in manifest {
        wanted
            .entry(entry.key.as_str())
            .or_default()
            .insert(entry.filename.as_str());
    }

    let mut deleted = 0u64;
    for dir_entry in std::fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let key = dir_entry.file_name().to_string_lossy().to_string();
        let path = dir_entry.path();

        if !path.is_dir() {
            // Stray loose file at the top level.
            std::fs::remove_file(&path)?;
            deleted += 1;
            continue;
        }

        match wanted.get(key.as_str()) {
            None => {
                std::fs::remove_dir_all(&path)?;
                deleted += 1;
            }
            Some(filenames) => {
                for file in std::fs::read_dir(&path)? {
                    let file = file?;
                    let name = file.file_name().to_string_lossy().to_string();
                    if !filenames.contains(name.as_str()) {
                        std::fs::remove_file(file.path())?;
                        deleted += 1;
                    }
                }
            }
        }
    }

    Ok(deleted)
}
