//! Mirror statistics and health overview.
//!
//! Provides a quick summary of what's mirrored: cached entity counts, sync
//! versions, live index generation, and attachment storage. Used by
//! `bibm stats` to give confidence that sync runs are working as expected.

use anyhow::Result;

use crate::cache;
use crate::config::Config;
use crate::index::IndexReader;
use crate::models::EntityKind;

/// Run the stats command: inspect the data directory and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    println!("bibmirror — Mirror Stats");
    println!("========================");
    println!();
    println!("  Data dir:     {}", config.storage.data_dir.display());

    if config.storage.cache_path().exists() {
        let pool = cache::connect(config).await?;
        cache::run_migrations(&pool).await?;

        let collections = cache::count_entities(&pool, EntityKind::Collection).await?;
        let items = cache::count_entities(&pool, EntityKind::Item).await?;
        let cache_size = std::fs::metadata(config.storage.cache_path())
            .map(|m| m.len())
            .unwrap_or(0);

        println!();
        println!("  Cache:        {}", format_bytes(cache_size));
        println!("  Collections:  {}", collections);
        println!("  Items:        {}", items);

        for kind in ["collections", "items", "deletions"] {
            let state = cache::get_sync_state(&pool, kind).await?;
            println!(
                "  {:<13} version {} ({})",
                format!("{}:", kind),
                state.version,
                if state.fully_synced { "full" } else { "partial" }
            );
        }

        let last_sync = cache::get_last_sync(&pool).await?;
        let sync_display = match last_sync {
            Some(when) => format_ts_relative(when.timestamp()),
            None => "never".to_string(),
        };
        println!("  Last sync:    {}", sync_display);

        pool.close().await;
    } else {
        println!();
        println!("  Cache:        (not created)");
    }

    match IndexReader::open_live(config).await {
        Ok(Some(reader)) => {
            let docs = reader.doc_count().await?;
            let created = reader
                .meta("created_at")
                .await?
                .unwrap_or_else(|| "unknown".to_string());
            println!();
            println!("  Index:        {}", reader.generation());
            println!("  Documents:    {}", docs);
            println!("  Built:        {}", created);
            reader.close().await;
        }
        _ => {
            println!();
            println!("  Index:        (no committed generation)");
        }
    }

    let (files, bytes) = attachment_usage(config);
    println!();
    println!("  Attachments:  {} files, {}", files, format_bytes(bytes));
    println!();

    Ok(())
}

fn attachment_usage(config: &Config) -> (u64, u64) {
    let mut files = 0u64;
    let mut bytes = 0u64;
    let dir = config.storage.attachments_dir();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return (0, 0);
    };
    for entry in entries.flatten() {
        let Ok(inner) = std::fs::read_dir(entry.path()) else {
            continue;
        };
        for file in inner.flatten() {
            if let Ok(meta) = file.metadata() {
                if meta.is_file() {
                    files += 1;
                    bytes += meta.len();
                }
            }
        }
    }
    (files, bytes)
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_ranges() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
