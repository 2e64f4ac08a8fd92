//! Index build orchestration.
//!
//! Re-derives the full document set from the cache and writes a fresh
//! generation. The build is deterministic and idempotent because every
//! extractor is a pure function of the cached subtree; it is skipped
//! entirely when the cache fingerprint and schema fingerprint both match
//! the live generation.
//!
//! Relation inversion is an explicit two-phase pass: phase 1 transforms
//! every document and accumulates the forward "cites" edge set; phase 2
//! finalizes each document's inbound "cited by" edges from that map before
//! anything is written, since a document cannot know its inbound edges
//! until all documents have been scanned.

use std::collections::HashMap;

use sqlx::SqlitePool;

use crate::cache;
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::extract::{self, CollectionPaths, TagFilter};
use crate::index::{schema_fingerprint, IndexBuilder, IndexReader};
use crate::models::{EntityKind, IndexDocument, RemoteEntity};
use crate::progress::{ProgressEvent, ProgressReporter};

#[derive(Debug, Default)]
pub struct IndexSyncOutcome {
    pub built: bool,
    pub documents: u64,
    pub skipped_documents: u64,
}

pub async fn run_index_sync(
    config: &Config,
    cache_pool: &SqlitePool,
    progress: &dyn ProgressReporter,
) -> Result<IndexSyncOutcome> {
    let cache_fp = cache::content_fingerprint(cache_pool).await?;
    let schema_fp = schema_fingerprint(config);

    if let Some(reader) = IndexReader::open_live(config).await? {
        let live_cache_fp = reader.meta("cache_fingerprint").await?.unwrap_or_default();
        let live_schema_fp = reader.meta("schema_fingerprint").await?.unwrap_or_default();
        reader.close().await;

        if live_cache_fp == cache_fp && live_schema_fp == schema_fp {
            tracing::info!("cache unchanged since last build, skipping index rebuild");
            return Ok(IndexSyncOutcome::default());
        }
        if live_schema_fp != schema_fp {
            // Recovered by rebuilding, never surfaced as a failure.
            let mismatch = SyncError::SchemaMismatch {
                live: live_schema_fp,
                configured: schema_fp.clone(),
            };
            tracing::warn!(error = %mismatch, "index schema changed, forcing full rebuild");
        }
    }

    let display_filter = TagFilter::from_patterns(
        &config.filters.display_include_tags,
        &config.filters.display_exclude_tags,
    )
    .map_err(|e| SyncError::Configuration(e.to_string()))?;
    let extractors = extract::default_extractors();

    let collections = cache::load_entities(cache_pool, EntityKind::Collection).await?;
    let collection_paths = CollectionPaths::from_entities(&collections);

    let items = cache::load_entities(cache_pool, EntityKind::Item).await?;
    let (parents, children_by_parent) = split_subtrees(items);

    // ── Phase 1: transform everything, collect forward edges ─────────
    let mut documents: Vec<IndexDocument> = Vec::with_capacity(parents.len());
    let mut skipped = 0u64;
    for item in &parents {
        let children = children_by_parent
            .get(&item.key)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        match extract::transform(
            config,
            &display_filter,
            &extractors,
            item,
            children,
            &collection_paths,
        ) {
            Ok(doc) => documents.push(doc),
            Err(e) if !e.is_fatal_to_run() => {
                tracing::warn!(key = %item.key, error = %e, "skipping untransformable entity");
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    let inbound = invert_relations(&mut documents);

    // ── Phase 2: finalize inbound edges, write the generation ────────
    let mut builder = IndexBuilder::begin(config).await?;
    let total = documents.len() as u64;
    let mut written = 0u64;

    for mut doc in documents {
        doc.cited_by = inbound.get(&doc.id).cloned().unwrap_or_default();
        if let Err(e) = builder.add_document(config, &doc).await {
            builder.abort().await;
            return Err(e);
        }
        written += 1;
        progress.report(ProgressEvent::Indexing { written, total });
    }

    builder.commit(&cache_fp).await?;

    Ok(IndexSyncOutcome {
        built: true,
        documents: written,
        skipped_documents: skipped,
    })
}

/// Partition cached items into top-level entities and child subtrees.
fn split_subtrees(
    items: Vec<RemoteEntity>,
) -> (Vec<RemoteEntity>, HashMap<String, Vec<RemoteEntity>>) {
    let mut parents = Vec::new();
    let mut children: HashMap<String, Vec<RemoteEntity>> = HashMap::new();
    for item in items {
        match item.parent_key.clone() {
            Some(parent_key) => children.entry(parent_key).or_default().push(item),
            None => parents.push(item),
        }
    }
    (parents, children)
}

/// Drop forward edges whose target is not in the document set, then invert
/// the remainder. Each inbound list is sorted and deduplicated, so a
/// one-directional edge never appears twice.
fn invert_relations(documents: &mut [IndexDocument]) -> HashMap<String, Vec<String>> {
    let known: std::collections::HashSet<String> =
        documents.iter().map(|d| d.id.clone()).collect();

    let mut inbound: HashMap<String, Vec<String>> = HashMap::new();
    for doc in documents.iter_mut() {
        let before = doc.cites.len();
        doc.cites.retain(|target| known.contains(target));
        if doc.cites.len() < before {
            tracing::debug!(id = %doc.id, dropped = before - doc.cites.len(), "unresolvable relation references");
        }
        for target in &doc.cites {
            inbound.entry(target.clone()).or_default().push(doc.id.clone());
        }
    }

    for sources in inbound.values_mut() {
        sources.sort();
        sources.dedup();
    }
    inbound
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_with_cites(id: &str, cites: &[&str]) -> IndexDocument {
        IndexDocument {
            id: id.to_string(),
            cites: cites.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn inversion_builds_inbound_edges() {
        let mut docs = vec![
            doc_with_cites("AAAA1111", &["BBBB2222"]),
            doc_with_cites("BBBB2222", &[]),
            doc_with_cites("CCCC3333", &["BBBB2222", "AAAA1111"]),
        ];
        let inbound = invert_relations(&mut docs);
        assert_eq!(
            inbound.get("BBBB2222").unwrap(),
            &vec!["AAAA1111".to_string(), "CCCC3333".to_string()]
        );
        assert_eq!(inbound.get("AAAA1111").unwrap(), &vec!["CCCC3333".to_string()]);
        assert!(inbound.get("CCCC3333").is_none());
    }

    #[test]
    fn inversion_drops_unresolvable_targets() {
        let mut docs = vec![doc_with_cites("AAAA1111", &["GONE9999"])];
        let inbound = invert_relations(&mut docs);
        assert!(docs[0].cites.is_empty());
        assert!(inbound.is_empty());
    }

    #[test]
    fn inversion_never_duplicates_an_edge() {
        // The same forward edge listed twice still inverts to one entry.
        let mut docs = vec![
            doc_with_cites("AAAA1111", &["BBBB2222", "BBBB2222"]),
            doc_with_cites("BBBB2222", &[]),
        ];
        let inbound = invert_relations(&mut docs);
        assert_eq!(inbound.get("BBBB2222").unwrap().len(), 1);
    }

    #[test]
    fn split_subtrees_groups_children() {
        let items = vec![
            RemoteEntity {
                key: "P1".into(),
                version: 1,
                parent_key: None,
                data: json!({}),
            },
            RemoteEntity {
                key: "C1".into(),
                version: 1,
                parent_key: Some("P1".into()),
                data: json!({}),
            },
            RemoteEntity {
                key: "C2".into(),
                version: 1,
                parent_key: Some("P1".into()),
                data: json!({}),
            },
        ];
        let (parents, children) = split_subtrees(items);
        assert_eq!(parents.len(), 1);
        assert_eq!(children.get("P1").unwrap().len(), 2);
    }
}
