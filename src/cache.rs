//! Local cache store.
//!
//! Durable key-value storage of raw remote entities plus per-collection sync
//! state, in one SQLite database under the data directory. Entities are
//! written in page-sized batch transactions and upserted by key, which makes
//! re-fetching a batch after a crash idempotent. Sync-state versions only
//! advance after the batches they summarize have committed.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

use crate::config::Config;
use crate::models::{EntityKind, RemoteEntity, SyncState};

pub async fn connect(config: &Config) -> Result<SqlitePool, sqlx::Error> {
    let db_path = config.storage.cache_path();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| sqlx::Error::Io(e))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            kind TEXT NOT NULL,
            key TEXT NOT NULL,
            version INTEGER NOT NULL,
            parent_key TEXT,
            data TEXT NOT NULL,
            PRIMARY KEY (kind, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            kind TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            fully_synced INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS last_sync (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            completed_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_parent ON entities(parent_key)")
        .execute(pool)
        .await?;

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Entities
// ═══════════════════════════════════════════════════════════════════════

/// Write one page of entities inside a single transaction. Upsert-by-key:
/// re-running the same batch after a crash converges to the same rows.
pub async fn write_batch(
    pool: &SqlitePool,
    kind: EntityKind,
    entities: &[RemoteEntity],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for entity in entities {
        sqlx::query(
            r#"
            INSERT INTO entities (kind, key, version, parent_key, data)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(kind, key) DO UPDATE SET
                version = excluded.version,
                parent_key = excluded.parent_key,
                data = excluded.data
            "#,
        )
        .bind(kind.as_str())
        .bind(&entity.key)
        .bind(entity.version)
        .bind(&entity.parent_key)
        .bind(entity.data.to_string())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn delete_entities(
    pool: &SqlitePool,
    kind: EntityKind,
    keys: &[String],
) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut deleted = 0u64;

    for key in keys {
        let result = sqlx::query("DELETE FROM entities WHERE kind = ? AND key = ?")
            .bind(kind.as_str())
            .bind(key)
            .execute(&mut *tx)
            .await?;
        deleted += result.rows_affected();
    }

    tx.commit().await?;
    Ok(deleted)
}

pub async fn all_keys(pool: &SqlitePool, kind: EntityKind) -> Result<Vec<String>, sqlx::Error> {
    let rows = sqlx::query("SELECT key FROM entities WHERE kind = ? ORDER BY key")
        .bind(kind.as_str())
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get("key")).collect())
}

pub async fn load_entities(
    pool: &SqlitePool,
    kind: EntityKind,
) -> Result<Vec<RemoteEntity>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT key, version, parent_key, data FROM entities WHERE kind = ? ORDER BY key",
    )
    .bind(kind.as_str())
    .fetch_all(pool)
    .await?;

    let entities = rows
        .iter()
        .map(|row| {
            let data_text: String = row.get("data");
            RemoteEntity {
                key: row.get("key"),
                version: row.get("version"),
                parent_key: row.get("parent_key"),
                data: serde_json::from_str(&data_text).unwrap_or(serde_json::Value::Null),
            }
        })
        .collect();

    Ok(entities)
}

pub async fn count_entities(pool: &SqlitePool, kind: EntityKind) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM entities WHERE kind = ?")
        .bind(kind.as_str())
        .fetch_one(pool)
        .await
}

// ═══════════════════════════════════════════════════════════════════════
// Sync state
// ═══════════════════════════════════════════════════════════════════════

pub async fn get_sync_state(pool: &SqlitePool, kind: &str) -> Result<SyncState, sqlx::Error> {
    let row = sqlx::query("SELECT version, fully_synced FROM sync_state WHERE kind = ?")
        .bind(kind)
        .fetch_optional(pool)
        .await?;

    Ok(row
        .map(|r| SyncState {
            version: r.get("version"),
            fully_synced: r.get::<i64, _>("fully_synced") != 0,
        })
        .unwrap_or_default())
}

pub async fn set_sync_state(
    pool: &SqlitePool,
    kind: &str,
    state: &SyncState,
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO sync_state (kind, version, fully_synced, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(kind) DO UPDATE SET
            version = excluded.version,
            fully_synced = excluded.fully_synced,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(kind)
    .bind(state.version)
    .bind(state.fully_synced as i64)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn record_last_sync(
    pool: &SqlitePool,
    when: chrono::DateTime<chrono::Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO last_sync (id, completed_at) VALUES (1, ?)
        ON CONFLICT(id) DO UPDATE SET completed_at = excluded.completed_at
        "#,
    )
    .bind(when.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_last_sync(
    pool: &SqlitePool,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, sqlx::Error> {
    let row: Option<String> = sqlx::query_scalar("SELECT completed_at FROM last_sync WHERE id = 1")
        .fetch_optional(pool)
        .await?;

    Ok(row
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc)))
}

// ═══════════════════════════════════════════════════════════════════════
// Content fingerprint
// ═══════════════════════════════════════════════════════════════════════

/// Hash over every cached (kind, key, version) triple, in key order. Two
/// caches with the same fingerprint transform to the same document set, so
/// the index builder uses this to skip no-op rebuilds.
pub async fn content_fingerprint(pool: &SqlitePool) -> Result<String, sqlx::Error> {
    let rows = sqlx::query("SELECT kind, key, version FROM entities ORDER BY kind, key")
        .fetch_all(pool)
        .await?;

    let mut hasher = Sha256::new();
    for row in &rows {
        let kind: String = row.get("kind");
        let key: String = row.get("key");
        let version: i64 = row.get("version");
        hasher.update(kind.as_bytes());
        hasher.update(b"\0");
        hasher.update(key.as_bytes());
        hasher.update(b"\0");
        hasher.update(version.to_le_bytes());
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;
    use serde_json::json;
    use std::path::PathBuf;

    fn test_config(dir: &tempfile::TempDir) -> crate::config::Config {
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
        load_config(&PathBuf::from(config_path)).unwrap()
    }

    fn entity(key: &str, version: i64) -> RemoteEntity {
        RemoteEntity {
            key: key.to_string(),
            version,
            parent_key: None,
            data: json!({"itemType": "book", "title": key}),
        }
    }

    #[tokio::test]
    async fn batch_write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = connect(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let batch = vec![entity("AAAA1111", 3), entity("BBBB2222", 4)];
        write_batch(&pool, EntityKind::Item, &batch).await.unwrap();
        write_batch(&pool, EntityKind::Item, &batch).await.unwrap();

        assert_eq!(count_entities(&pool, EntityKind::Item).await.unwrap(), 2);

        // Overwrite-by-key picks up the newer version.
        write_batch(&pool, EntityKind::Item, &[entity("AAAA1111", 9)])
            .await
            .unwrap();
        let loaded = load_entities(&pool, EntityKind::Item).await.unwrap();
        assert_eq!(loaded[0].version, 9);
    }

    #[tokio::test]
    async fn sync_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = connect(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let initial = get_sync_state(&pool, "items").await.unwrap();
        assert_eq!(initial.version, 0);
        assert!(!initial.fully_synced);

        set_sync_state(
            &pool,
            "items",
            &SyncState {
                version: 42,
                fully_synced: true,
            },
        )
        .await
        .unwrap();

        let loaded = get_sync_state(&pool, "items").await.unwrap();
        assert_eq!(loaded.version, 42);
        assert!(loaded.fully_synced);
    }

    #[tokio::test]
    async fn fingerprint_tracks_entity_versions() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = connect(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let before = content_fingerprint(&pool).await.unwrap();
        write_batch(&pool, EntityKind::Item, &[entity("AAAA1111", 1)])
            .await
            .unwrap();
        let after = content_fingerprint(&pool).await.unwrap();
        assert_ne!(before, after);

        // Same content, same fingerprint.
        let again = content_fingerprint(&pool).await.unwrap();
        assert_eq!(after, again);
    }

    #[tokio::test]
    async fn deletion_removes_rows() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = connect(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();

        write_batch(
            &pool,
            EntityKind::Item,
            &[entity("AAAA1111", 1), entity("BBBB2222", 1)],
        )
        .await
        .unwrap();

        let deleted = delete_entities(&pool, EntityKind::Item, &["AAAA1111".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(
            all_keys(&pool, EntityKind::Item).await.unwrap(),
            vec!["BBBB2222"]
        );
    }

    #[tokio::test]
    async fn last_sync_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let pool = connect(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();

        assert!(get_last_sync(&pool).await.unwrap().is_none());

        let when = chrono::Utc::now();
        record_last_sync(&pool, when).await.unwrap();
        let loaded = get_last_sync(&pool).await.unwrap().unwrap();
        assert_eq!(loaded.timestamp(), when.timestamp());
    }
}
