//! Cache synchronizer.
//!
//! Orchestrates the incremental pull from the remote API into the local
//! cache store: collections first, then items, then deletion
//! reconciliation. Each page of entities is committed in its own batch
//! transaction; the per-collection sync version only advances after every
//! batch of that stage has durably committed, so an abort at any point
//! resumes by re-fetching at most one delta (fetch-and-overwrite-by-key is
//! idempotent).
//!
//! Strategy selection: a collection that has never fully synced, or a run
//! with the forced-full flag, sweeps from version 0 and implicitly deletes
//! local entities absent from the sweep. Incremental runs rely exclusively
//! on explicit tombstones.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::SqlitePool;

use crate::cache;
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::extract::TagFilter;
use crate::models::{EntityKind, RemoteEntity, SyncState, TypedItem};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::remote::RemoteClient;

/// Cooperative cancellation flag, set from the ctrl-c handler. Checked
/// between entity batches, never mid-batch.
pub type CancelFlag = Arc<AtomicBool>;

#[derive(Debug, Default)]
pub struct CacheSyncOutcome {
    pub collections_fetched: u64,
    pub items_fetched: u64,
    pub children_dropped: u64,
    pub deleted: u64,
    pub full: bool,
}

pub async fn run_cache_sync(
    config: &Config,
    pool: &SqlitePool,
    client: &RemoteClient,
    force_full: bool,
    progress: &dyn ProgressReporter,
    cancel: &CancelFlag,
) -> Result<CacheSyncOutcome> {
    let cache_filter = TagFilter::from_patterns(
        &config.filters.cache_include_tags,
        &config.filters.cache_exclude_tags,
    )
    .map_err(|e| SyncError::Configuration(e.to_string()))?;

    let mut outcome = CacheSyncOutcome::default();

    // ── Collections ──────────────────────────────────────────────────
    let state = cache::get_sync_state(pool, "collections").await?;
    let full = force_full || !state.fully_synced;
    outcome.full = full;
    let since = if full { 0 } else { state.version };

    let (seen_collections, new_version, fetched) = fetch_stage(
        pool,
        client,
        EntityKind::Collection,
        since,
        None,
        progress,
        cancel,
        "collections",
    )
    .await?;
    outcome.collections_fetched = fetched;

    if full {
        outcome.deleted += implicit_delete(pool, EntityKind::Collection, &seen_collections).await?;
    }
    cache::set_sync_state(
        pool,
        "collections",
        &SyncState {
            version: new_version.max(state.version),
            fully_synced: true,
        },
    )
    .await?;

    // ── Items ────────────────────────────────────────────────────────
    let state = cache::get_sync_state(pool, "items").await?;
    let full = force_full || !state.fully_synced;
    let since = if full { 0 } else { state.version };

    let (seen_items, new_version, fetched) = fetch_stage(
        pool,
        client,
        EntityKind::Item,
        since,
        Some((&cache_filter, &mut outcome.children_dropped)),
        progress,
        cancel,
        "items",
    )
    .await?;
    outcome.items_fetched = fetched;

    if full {
        outcome.deleted += implicit_delete(pool, EntityKind::Item, &seen_items).await?;
    }
    cache::set_sync_state(
        pool,
        "items",
        &SyncState {
            version: new_version.max(state.version),
            fully_synced: true,
        },
    )
    .await?;

    // ── Deletions ────────────────────────────────────────────────────
    check_cancel(cancel)?;
    let state = cache::get_sync_state(pool, "deletions").await?;
    let (deleted_keys, deletions_version) = client.fetch_deleted_since(state.version).await?;

    outcome.deleted += cache::delete_entities(pool, EntityKind::Item, &deleted_keys.items).await?;
    outcome.deleted +=
        cache::delete_entities(pool, EntityKind::Collection, &deleted_keys.collections).await?;

    cache::set_sync_state(
        pool,
        "deletions",
        &SyncState {
            version: deletions_version.max(state.version),
            fully_synced: true,
        },
    )
    .await?;

    tracing::info!(
        collections = outcome.collections_fetched,
        items = outcome.items_fetched,
        dropped_children = outcome.children_dropped,
        deleted = outcome.deleted,
        full = outcome.full,
        "cache sync committed"
    );

    Ok(outcome)
}

/// Pull every page of one entity listing, committing each page as a batch.
/// Returns the set of keys seen (for implicit deletion on full sweeps), the
/// remote library version, and the fetch count.
#[allow(clippy::too_many_arguments)]
async fn fetch_stage(
    pool: &SqlitePool,
    client: &RemoteClient,
    kind: EntityKind,
    since: i64,
    mut child_filter: Option<(&TagFilter, &mut u64)>,
    progress: &dyn ProgressReporter,
    cancel: &CancelFlag,
    stage: &'static str,
) -> Result<(HashSet<String>, i64, u64)> {
    // Cheap change probe: an empty versions map means nothing to page
    // through. Only worthwhile on incremental runs.
    if since > 0 {
        let (versions, remote_version) = client.fetch_versions(kind, since).await?;
        if versions.is_empty() {
            return Ok((HashSet::new(), remote_version, 0));
        }
    }

    let mut seen = HashSet::new();
    let mut remote_version = 0i64;
    let mut fetched = 0u64;
    let mut start = 0u32;

    loop {
        check_cancel(cancel)?;

        let page = client.fetch_changed_since(kind, since, start).await?;
        remote_version = remote_version.max(page.remote_version);
        let page_len = page.entities.len() as u32;

        let mut accepted: Vec<RemoteEntity> = Vec::with_capacity(page.entities.len());
        let mut dropped_keys: Vec<String> = Vec::new();
        for entity in page.entities {
            let accept = match &mut child_filter {
                Some((filter, dropped)) if entity.parent_key.is_some() => {
                    if child_accepted(&entity, filter) {
                        true
                    } else {
                        **dropped += 1;
                        false
                    }
                }
                _ => true,
            };
            if accept {
                seen.insert(entity.key.clone());
                accepted.push(entity);
            } else {
                // A filtered-out child must not linger from an earlier run
                // with a laxer filter.
                dropped_keys.push(entity.key);
            }
        }

        fetched += accepted.len() as u64;
        cache::write_batch(pool, kind, &accepted).await?;
        if !dropped_keys.is_empty() {
            cache::delete_entities(pool, kind, &dropped_keys).await?;
        }
        progress.report(ProgressEvent::Fetching { stage, fetched });

        if !page.has_more || page_len == 0 {
            break;
        }
        start += page_len;
    }

    Ok((seen, remote_version, fetched))
}

/// Cache-side acceptance for child notes/attachments: the tag filter runs
/// against the child's own tag set. Children whose payload cannot even be
/// typed are kept; the transformer deals with them later.
fn child_accepted(entity: &RemoteEntity, filter: &TagFilter) -> bool {
    match TypedItem::parse(&entity.key, &entity.data) {
        Ok(typed) => filter.accepts(typed.tags()),
        Err(_) => true,
    }
}

/// A full sweep is authoritative: anything local the sweep did not mention
/// no longer exists remotely.
async fn implicit_delete(
    pool: &SqlitePool,
    kind: EntityKind,
    seen: &HashSet<String>,
) -> Result<u64> {
    let local = cache::all_keys(pool, kind).await?;
    let stale: Vec<String> = local.into_iter().filter(|k| !seen.contains(k)).collect();
    if stale.is_empty() {
        return Ok(0);
    }
    tracing::debug!(kind = kind.as_str(), count = stale.len(), "implicit deletion");
    Ok(cache::delete_entities(pool, kind, &stale).await?)
}

fn check_cancel(cancel: &CancelFlag) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        return Err(SyncError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note_entity(key: &str, parent: &str, tags: &[&str]) -> RemoteEntity {
        let tag_objs: Vec<_> = tags.iter().map(|t| json!({"tag": t})).collect();
        RemoteEntity {
            key: key.to_string(),
            version: 1,
            parent_key: Some(parent.to_string()),
            data: json!({"itemType": "note", "note": "<p>x</p>", "tags": tag_objs}),
        }
    }

    #[test]
    fn child_filter_drops_excluded_tags() {
        let filter = TagFilter::from_patterns(&[], &["^private$".to_string()]).unwrap();
        let keep = note_entity("A", "P", &["reading"]);
        let drop = note_entity("B", "P", &["private"]);
        assert!(child_accepted(&keep, &filter));
        assert!(!child_accepted(&drop, &filter));
    }

    #[test]
    fn child_filter_requires_inclusion_match() {
        let filter = TagFilter::from_patterns(&["^public".to_string()], &[]).unwrap();
        let keep = note_entity("A", "P", &["public-note"]);
        let drop = note_entity("B", "P", &["misc"]);
        assert!(child_accepted(&keep, &filter));
        assert!(!child_accepted(&drop, &filter));
    }

    #[test]
    fn unparseable_children_are_kept_for_the_transformer() {
        let filter = TagFilter::from_patterns(&["^public".to_string()], &[]).unwrap();
        let entity = RemoteEntity {
            key: "X".into(),
            version: 1,
            parent_key: Some("P".into()),
            data: json!({"no_item_type": true}),
        };
        assert!(child_accepted(&entity, &filter));
    }

    #[test]
    fn cancel_flag_aborts_between_batches() {
        let cancel: CancelFlag = Arc::new(AtomicBool::new(true));
        let err = check_cancel(&cancel).unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
