//! Remote bibliographic API client.
//!
//! Read-only access is a hard invariant: this client only ever issues GET
//! requests. Entity listings are paginated at the configured batch size
//! (remote ceiling 100) and carry the library version in the
//! `Last-Modified-Version` response header.
//!
//! # Retry Strategy
//!
//! Transient failures (timeouts, 5xx, explicit rate-limit signals) are
//! retried up to `remote.max_retries` attempts with a fixed wait between
//! attempts. An explicit `Retry-After` header is honored in place of the
//! fixed interval. Exhausting the budget yields
//! [`SyncError::RemoteUnavailable`], which aborts the current stage without
//! touching previously committed state. Non-retryable client errors (4xx
//! other than 429) fail immediately.

use reqwest::StatusCode;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::Config;
use crate::error::SyncError;
use crate::models::{EntityKind, RemoteEntity};

/// One page of an entity listing.
#[derive(Debug)]
pub struct Page {
    pub entities: Vec<RemoteEntity>,
    /// Library version reported by the remote for this response.
    pub remote_version: i64,
    pub has_more: bool,
}

/// Keys tombstoned since a given version, per entity collection.
#[derive(Debug, Default)]
pub struct DeletedKeys {
    pub items: Vec<String>,
    pub collections: Vec<String>,
}

pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    library_prefix: String,
    api_key: Option<String>,
    batch_size: u32,
    max_retries: u32,
    retry_wait: Duration,
}

impl RemoteClient {
    pub fn new(config: &Config) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.remote.timeout_secs))
            .build()
            .map_err(|e| SyncError::Configuration(format!("http client: {}", e)))?;

        let kind_segment = match config.remote.library_kind.as_str() {
            "user" => "users",
            _ => "groups",
        };

        Ok(Self {
            http,
            base_url: config.remote.base_url.trim_end_matches('/').to_string(),
            library_prefix: format!("{}/{}", kind_segment, config.remote.library_id),
            api_key: config.remote.api_key.clone(),
            batch_size: config.remote.batch_size,
            max_retries: config.remote.max_retries.max(1),
            retry_wait: Duration::from_secs(config.remote.retry_wait_secs),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.library_prefix, path)
    }

    /// Issue a GET with the retry policy. All remote access funnels through
    /// here, which is what keeps the client read-only.
    async fn get_with_retry(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<reqwest::Response, SyncError> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            let mut request = self.http.get(url).query(query);
            if let Some(ref key) = self.api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        let wait = retry_after(&response).unwrap_or(self.retry_wait);
                        last_error = format!("HTTP {}", status.as_u16());
                        tracing::warn!(
                            url,
                            status = status.as_u16(),
                            attempt,
                            wait_secs = wait.as_secs(),
                            "remote request failed, retrying"
                        );
                        if attempt < self.max_retries {
                            tokio::time::sleep(wait).await;
                        }
                        continue;
                    }

                    // Other client errors will not improve with retries.
                    let body = response.text().await.unwrap_or_default();
                    return Err(SyncError::RemoteRejected {
                        status: status.as_u16(),
                        message: body.chars().take(200).collect(),
                    });
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(url, attempt, error = %e, "remote request failed, retrying");
                    if attempt < self.max_retries {
                        tokio::time::sleep(self.retry_wait).await;
                    }
                }
            }
        }

        Err(SyncError::RemoteUnavailable {
            attempts: self.max_retries,
            message: last_error,
        })
    }

    /// Fetch one page of entities changed since `since_version`.
    pub async fn fetch_changed_since(
        &self,
        kind: EntityKind,
        since_version: i64,
        start: u32,
    ) -> Result<Page, SyncError> {
        let path = match kind {
            EntityKind::Collection => "collections",
            EntityKind::Item => "items",
        };
        let url = self.url(path);
        let query = vec![
            ("format".to_string(), "json".to_string()),
            ("since".to_string(), since_version.to_string()),
            ("start".to_string(), start.to_string()),
            ("limit".to_string(), self.batch_size.to_string()),
        ];

        let response = self.get_with_retry(&url, &query).await?;
        let remote_version = header_i64(&response, "Last-Modified-Version").unwrap_or(0);
        let total_results = header_i64(&response, "Total-Results");

        let body: Vec<Value> = response.json().await.map_err(|e| SyncError::RemoteUnavailable {
            attempts: 1,
            message: format!("invalid listing body: {}", e),
        })?;

        let entities: Vec<RemoteEntity> = body
            .iter()
            .filter_map(|raw| parse_entity(raw))
            .collect();

        let fetched = start as i64 + body.len() as i64;
        let has_more = match total_results {
            Some(total) => fetched < total,
            None => body.len() as u32 == self.batch_size,
        };

        Ok(Page {
            entities,
            remote_version,
            has_more,
        })
    }

    /// Sparse `key → version` map of entities changed since a version.
    /// Cheap change detection: an empty map means no page fetch is needed.
    pub async fn fetch_versions(
        &self,
        kind: EntityKind,
        since_version: i64,
    ) -> Result<(HashMap<String, i64>, i64), SyncError> {
        let path = match kind {
            EntityKind::Collection => "collections",
            EntityKind::Item => "items",
        };
        let url = self.url(path);
        let query = vec![
            ("format".to_string(), "versions".to_string()),
            ("since".to_string(), since_version.to_string()),
        ];

        let response = self.get_with_retry(&url, &query).await?;
        let remote_version = header_i64(&response, "Last-Modified-Version").unwrap_or(0);
        let versions: HashMap<String, i64> =
            response.json().await.map_err(|e| SyncError::RemoteUnavailable {
                attempts: 1,
                message: format!("invalid versions body: {}", e),
            })?;

        Ok((versions, remote_version))
    }

    /// Keys tombstoned since a version.
    pub async fn fetch_deleted_since(
        &self,
        since_version: i64,
    ) -> Result<(DeletedKeys, i64), SyncError> {
        let url = self.url("deleted");
        let query = vec![("since".to_string(), since_version.to_string())];

        let response = self.get_with_retry(&url, &query).await?;
        let remote_version = header_i64(&response, "Last-Modified-Version").unwrap_or(0);
        let body: Value = response.json().await.map_err(|e| SyncError::RemoteUnavailable {
            attempts: 1,
            message: format!("invalid deleted body: {}", e),
        })?;

        let deleted = DeletedKeys {
            items: string_array(&body, "items"),
            collections: string_array(&body, "collections"),
        };

        Ok((deleted, remote_version))
    }

    /// Raw bytes of one attachment.
    pub async fn fetch_attachment(&self, key: &str) -> Result<Vec<u8>, SyncError> {
        let url = self.url(&format!("items/{}/file", key));
        let response = self.get_with_retry(&url, &[]).await?;
        let bytes = response.bytes().await.map_err(|e| SyncError::RemoteUnavailable {
            attempts: 1,
            message: format!("attachment body: {}", e),
        })?;
        Ok(bytes.to_vec())
    }
}

fn parse_entity(raw: &Value) -> Option<RemoteEntity> {
    let key = raw.get("key")?.as_str()?.to_string();
    let version = raw.get("version")?.as_i64()?;
    let data = raw.get("data").cloned().unwrap_or(Value::Null);
    let parent_key = data
        .get("parentItem")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(RemoteEntity {
        key,
        version,
        parent_key,
        data,
    })
}

fn header_i64(response: &reqwest::Response, name: &str) -> Option<i64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("Retry-After")
        .or_else(|| response.headers().get("Backoff"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn string_array(body: &Value, field: &str) -> Vec<String> {
    body.get(field)
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_entity_extracts_parent_from_data() {
        let raw = json!({
            "key": "CHLD1111",
            "version": 7,
            "data": {"itemType": "note", "parentItem": "ITEM1111", "note": "x"}
        });
        let entity = parse_entity(&raw).unwrap();
        assert_eq!(entity.key, "CHLD1111");
        assert_eq!(entity.version, 7);
        assert_eq!(entity.parent_key.as_deref(), Some("ITEM1111"));
    }

    #[test]
    fn parse_entity_rejects_missing_version() {
        let raw = json!({"key": "X", "data": {}});
        assert!(parse_entity(&raw).is_none());
    }

    #[test]
    fn string_array_tolerates_missing_fields() {
        let body = json!({"items": ["A", "B"]});
        assert_eq!(string_array(&body, "items"), vec!["A", "B"]);
        assert!(string_array(&body, "collections").is_empty());
    }
}
