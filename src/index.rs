//! Search index store.
//!
//! One SQLite file per generation under `<data>/index/`, with a `CURRENT`
//! pointer file naming the live one. A build always starts from an empty
//! generation; documents become visible only when [`IndexBuilder::commit`]
//! rewrites `CURRENT` via temp-file + rename. Readers resolve `CURRENT` at
//! open time, so they always observe either the previous or the next fully
//! committed generation, never a partial one. Superseded generation files
//! are pruned after the swap; an already-open reader keeps its file handle.
//!
//! Single-writer: a lock marker in the index directory refuses a second
//! concurrent build.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::analyze::tokenize;
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::models::{AttachmentEntry, IndexDocument};

/// Bumped whenever the generation layout or the indexed field set changes;
/// part of the schema fingerprint, so existing generations are rebuilt
/// rather than misread.
pub const SCHEMA_VERSION: u32 = 2;

/// Fields tokenized into the postings table.
pub const INDEXED_FIELDS: &[&str] = &[
    "title",
    "creators",
    "tags",
    "identifiers",
    "abstract",
    "fulltext",
];

const CURRENT_POINTER: &str = "CURRENT";
const BUILD_LOCK: &str = "build.lock";

/// Fingerprint of the configured index schema. A mismatch against the live
/// generation's recorded fingerprint forces a full rebuild.
pub fn schema_fingerprint(config: &Config) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SCHEMA_VERSION.to_le_bytes());
    for field in INDEXED_FIELDS {
        hasher.update(field.as_bytes());
        hasher.update(b"\0");
    }
    for facet in config.facets.enabled_names() {
        hasher.update(facet.as_bytes());
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

// ═══════════════════════════════════════════════════════════════════════
// Build lock
// ═══════════════════════════════════════════════════════════════════════

/// Exclusive writer marker. Dropped (and removed) when the builder commits
/// or is abandoned.
struct BuildLock {
    path: PathBuf,
}

impl BuildLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(BUILD_LOCK);
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

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════

pub struct IndexBuilder {
    pool: SqlitePool,
    dir: PathBuf,
    file_name: String,
    schema_fp: String,
    doc_count: u64,
    _lock: BuildLock,
}

impl IndexBuilder {
    /// Start a build into a fresh, empty generation. Fails with
    /// [`SyncError::RunLocked`] when another build is in progress.
    pub async fn begin(config: &Config) -> Result<Self> {
        let dir = config.storage.index_dir();
        std::fs::create_dir_all(&dir)?;
        let lock = BuildLock::acquire(&dir)?;

        let file_name = format!("{}.sqlite", uuid::Uuid::new_v4());
        let path = dir.join(&file_name);

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        create_generation_schema(&pool).await?;

        Ok(Self {
            pool,
            dir,
            file_name,
            schema_fp: schema_fingerprint(config),
            doc_count: 0,
            _lock: lock,
        })
    }

    /// Add one finalized document: stored JSON, postings, facet rows, and
    /// manifest entries, in a single transaction.
    pub async fn add_document(&mut self, config: &Config, doc: &IndexDocument) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let doc_json = serde_json::to_string(doc)?;
        let first_creator = doc.creators.first().cloned().unwrap_or_default();
        sqlx::query(
            r#"
            INSERT INTO documents (id, doc, title, date_sort, first_creator)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc_json)
        .bind(doc.title.to_lowercase())
        .bind(doc.date_sort)
        .bind(first_creator.to_lowercase())
        .execute(&mut *tx)
        .await?;

        for (field, text) in field_texts(doc) {
            let tokens = tokenize(&text);
            let length = tokens.len() as i64;
            if length == 0 {
                continue;
            }

            let mut freqs: HashMap<String, i64> = HashMap::new();
            for token in tokens {
                *freqs.entry(token).or_insert(0) += 1;
            }

            sqlx::query("INSERT INTO field_lengths (doc_id, field, len) VALUES (?, ?, ?)")
                .bind(&doc.id)
                .bind(field)
                .bind(length)
                .execute(&mut *tx)
                .await?;

            for (term, tf) in freqs {
                sqlx::query(
                    "INSERT INTO terms (term, field, doc_id, tf) VALUES (?, ?, ?, ?)",
                )
                .bind(&term)
                .bind(field)
                .bind(&doc.id)
                .bind(tf)
                .execute(&mut *tx)
                .await?;
            }
        }

        for (facet, value) in facet_values(config, doc) {
            sqlx::query(
                "INSERT OR IGNORE INTO facets (facet, value, doc_id) VALUES (?, ?, ?)",
            )
            .bind(facet)
            .bind(&value)
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;
        }

        for entry in &doc.attachments {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO attachments (key, doc_id, filename, md5, mtime)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.key)
            .bind(&doc.id)
            .bind(&entry.filename)
            .bind(&entry.md5)
            .bind(entry.mtime)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.doc_count += 1;
        Ok(())
    }

    pub fn doc_count(&self) -> u64 {
        self.doc_count
    }

    /// Seal the generation and atomically swap it live. The previous
    /// generation stays queryable until the pointer rename lands, then its
    /// file is pruned.
    pub async fn commit(self, cache_fingerprint: &str) -> Result<()> {
        let meta = [
            ("schema_fingerprint", self.schema_fp.clone()),
            ("cache_fingerprint", cache_fingerprint.to_string()),
            ("doc_count", self.doc_count.to_string()),
            ("created_at", chrono::Utc::now().to_rfc3339()),
        ];
        for (key, value) in &meta {
            sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await?;
        }

        self.pool.close().await;

        let pointer = self.dir.join(CURRENT_POINTER);
        let tmp = self.dir.join(format!("{}.tmp", CURRENT_POINTER));
        std::fs::write(&tmp, &self.file_name)?;
        std::fs::rename(&tmp, &pointer)?;

        prune_generations(&self.dir, &self.file_name)?;
        tracing::info!(generation = %self.file_name, docs = self.doc_count, "index generation committed");
        Ok(())
    }

    /// Abandon the build, removing the unfinished generation file.
    pub async fn abort(self) {
        self.pool.close().await;
        let path = self.dir.join(&self.file_name);
        let _ = std::fs::remove_file(&path);
        remove_sidecars(&path);
    }
}

async fn create_generation_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE documents (
            id TEXT PRIMARY KEY,
            doc TEXT NOT NULL,
            title TEXT NOT NULL,
            date_sort INTEGER NOT NULL,
            first_creator TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE terms (
            term TEXT NOT NULL,
            field TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            tf INTEGER NOT NULL,
            PRIMARY KEY (term, field, doc_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE field_lengths (
            doc_id TEXT NOT NULL,
            field TEXT NOT NULL,
            len INTEGER NOT NULL,
            PRIMARY KEY (doc_id, field)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE facets (
            facet TEXT NOT NULL,
            value TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            PRIMARY KEY (facet, value, doc_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE attachments (
            key TEXT PRIMARY KEY,
            doc_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            md5 TEXT NOT NULL,
            mtime INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX idx_terms_term ON terms(term)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX idx_facets_value ON facets(facet, value)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX idx_facets_doc ON facets(doc_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// (field, text) pairs fed to the tokenizer for one document.
fn field_texts(doc: &IndexDocument) -> Vec<(&'static str, String)> {
    vec![
        ("title", doc.title.clone()),
        ("creators", doc.creators.join(" ")),
        ("tags", doc.tags.join(" ")),
        ("identifiers", doc.identifiers.join(" ")),
        ("abstract", doc.abstract_text.clone()),
        ("fulltext", doc.fulltext.clone()),
    ]
}

/// Facet membership rows for one document, limited to enabled facets.
fn facet_values(config: &Config, doc: &IndexDocument) -> Vec<(&'static str, String)> {
    let mut values = Vec::new();
    let facets = &config.facets;

    if facets.item_type && !doc.item_type.is_empty() {
        values.push(("item_type", doc.item_type.clone()));
    }
    if facets.year {
        if let Some(year) = doc.year {
            values.push(("year", year.to_string()));
        }
    }
    if facets.tag {
        for tag in &doc.tags {
            values.push(("tag", tag.clone()));
        }
    }
    if facets.collection {
        for path in &doc.collections {
            values.push(("collection", path.clone()));
        }
    }
    if facets.link {
        let value = if doc.attachments.is_empty() { "no" } else { "yes" };
        values.push(("link", value.to_string()));
    }

    values
}

fn prune_generations(dir: &Path, keep: &str) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".sqlite") && name != keep {
            let path = entry.path();
            let _ = std::fs::remove_file(&path);
            remove_sidecars(&path);
        }
    }
    Ok(())
}

fn remove_sidecars(path: &Path) {
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(sidecar));
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Reader
// ═══════════════════════════════════════════════════════════════════════

/// Read handle on the live generation. Resolves `CURRENT` once at open
/// time, so an in-progress build never affects an open reader.
pub struct IndexReader {
    pool: SqlitePool,
    generation: String,
}

impl IndexReader {
    /// Open the live generation, or `None` when no build has ever
    /// committed.
    pub async fn open_live(config: &Config) -> Result<Option<IndexReader>> {
        let dir = config.storage.index_dir();
        let pointer = dir.join(CURRENT_POINTER);
        let file_name = match std::fs::read_to_string(&pointer) {
            Ok(name) => name.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let path = dir.join(&file_name);
        if !path.exists() {
            return Ok(None);
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Ok(Some(IndexReader {
            pool,
            generation: file_name,
        }))
    }

    pub fn generation(&self) -> &str {
        &self.generation
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn meta(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn doc_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<IndexDocument>> {
        let row: Option<String> = sqlx::query_scalar("SELECT doc FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|json| serde_json::from_str(&json).ok()))
    }

    /// The full attachment manifest of this generation, in key order.
    pub async fn manifest(&self) -> Result<Vec<AttachmentEntry>> {
        let rows = sqlx::query("SELECT key, filename, md5, mtime FROM attachments ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| AttachmentEntry {
                key: row.get("key"),
                filename: row.get("filename"),
                md5: row.get("md5"),
                mtime: row.get("mtime"),
            })
            .collect())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let config_path = dir.path().join("bibmirror.toml");
        std::fs::write(
            &config_path,
            format!(
                r#"
[storage]
data_dir = "{}"

[remote]
base_url = "http://127.0.0.1:1"
library_id = "1"

[server]
bind = "127.0.0.1:0"
"#,
                dir.path().join("data").display()
            ),
        )
        .unwrap();
        crate::config::load_config(&PathBuf::from(config_path)).unwrap()
    }

    fn doc(id: &str, title: &str) -> IndexDocument {
        IndexDocument {
            id: id.to_string(),
            title: title.to_string(),
            item_type: "book".to_string(),
            date_sort: 2020_12_31,
            year: Some(2020),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn build_commit_swap_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        assert!(IndexReader::open_live(&config).await.unwrap().is_none());

        let mut builder = IndexBuilder::begin(&config).await.unwrap();
        builder
            .add_document(&config, &doc("AAAA1111", "First Book"))
            .await
            .unwrap();
        builder.commit("fp-1").await.unwrap();

        let reader = IndexReader::open_live(&config).await.unwrap().unwrap();
        assert_eq!(reader.doc_count().await.unwrap(), 1);
        assert_eq!(
            reader.meta("cache_fingerprint").await.unwrap().as_deref(),
            Some("fp-1")
        );
        let loaded = reader.get_document("AAAA1111").await.unwrap().unwrap();
        assert_eq!(loaded.title, "First Book");
        reader.close().await;
    }

    #[tokio::test]
    async fn reader_isolation_across_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut builder = IndexBuilder::begin(&config).await.unwrap();
        builder
            .add_document(&config, &doc("AAAA1111", "Old Generation"))
            .await
            .unwrap();
        builder.commit("fp-1").await.unwrap();

        // A reader opened on the first generation keeps serving it while a
        // new build is in progress.
        let old_reader = IndexReader::open_live(&config).await.unwrap().unwrap();
        let old_generation = old_reader.generation().to_string();

        let mut builder = IndexBuilder::begin(&config).await.unwrap();
        builder
            .add_document(&config, &doc("BBBB2222", "New Generation"))
            .await
            .unwrap();

        // Mid-build, the live pointer is unchanged.
        let mid_reader = IndexReader::open_live(&config).await.unwrap().unwrap();
        assert_eq!(mid_reader.generation(), old_generation);
        assert!(mid_reader.get_document("BBBB2222").await.unwrap().is_none());
        mid_reader.close().await;

        builder.commit("fp-2").await.unwrap();

        let new_reader = IndexReader::open_live(&config).await.unwrap().unwrap();
        assert_ne!(new_reader.generation(), old_generation);
        assert!(new_reader.get_document("AAAA1111").await.unwrap().is_none());
        assert!(new_reader.get_document("BBBB2222").await.unwrap().is_some());
        new_reader.close().await;
        old_reader.close().await;
    }

    #[tokio::test]
    async fn single_writer_lock_refuses_second_build() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let builder = IndexBuilder::begin(&config).await.unwrap();
        let second = IndexBuilder::begin(&config).await;
        assert!(matches!(second, Err(SyncError::RunLocked(_))));
        builder.abort().await;

        // Lock released after abort.
        let third = IndexBuilder::begin(&config).await.unwrap();
        third.abort().await;
    }

    #[tokio::test]
    async fn commit_prunes_superseded_generations() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut builder = IndexBuilder::begin(&config).await.unwrap();
        builder
            .add_document(&config, &doc("AAAA1111", "One"))
            .await
            .unwrap();
        builder.commit("fp-1").await.unwrap();

        let mut builder = IndexBuilder::begin(&config).await.unwrap();
        builder
            .add_document(&config, &doc("AAAA1111", "One"))
            .await
            .unwrap();
        builder.commit("fp-2").await.unwrap();

        let generations: Vec<_> = std::fs::read_dir(config.storage.index_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.ends_with(".sqlite"))
            .collect();
        assert_eq!(generations.len(), 1);
    }

    #[tokio::test]
    async fn manifest_lists_attachments_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        let mut document = doc("AAAA1111", "With Files");
        document.attachments = vec![
            AttachmentEntry {
                key: "BBBB0002".into(),
                filename: "b.pdf".into(),
                md5: "b".repeat(32),
                mtime: 2,
            },
            AttachmentEntry {
                key: "AAAA0001".into(),
                filename: "a.pdf".into(),
                md5: "a".repeat(32),
                mtime: 1,
            },
        ];

        let mut builder = IndexBuilder::begin(&config).await.unwrap();
        builder.add_document(&config, &document).await.unwrap();
        builder.commit("fp").await.unwrap();

        let reader = IndexReader::open_live(&config).await.unwrap().unwrap();
        let manifest = reader.manifest().await.unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest[0].key, "AAAA0001");
        reader.close().await;
    }
}
