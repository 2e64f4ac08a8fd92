//! Pipeline error taxonomy.
//!
//! Transient remote failures are retried inside the client; once the retry
//! budget is exhausted they surface as [`SyncError::RemoteUnavailable`] and
//! abort the current stage without touching previously committed state.
//! Per-document and per-file failures ([`SyncError::MalformedEntity`],
//! [`SyncError::AttachmentFetch`]) are isolated by their callers and never
//! abort a whole run.

use std::path::PathBuf;

/// Errors produced by the sync/index/attachment pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The remote API could not be reached after exhausting the retry budget.
    #[error("remote unavailable after {attempts} attempts: {message}")]
    RemoteUnavailable { attempts: u32, message: String },

    /// The remote rejected a request in a way retrying will not fix.
    #[error("remote request failed with status {status}: {message}")]
    RemoteRejected { status: u16, message: String },

    /// The configured index schema differs from the live generation's.
    /// Recovered by forcing a full rebuild, never surfaced to the operator.
    #[error("index schema fingerprint changed (live: {live}, configured: {configured})")]
    SchemaMismatch { live: String, configured: String },

    /// A cached entity cannot be transformed into an index document.
    #[error("malformed entity {key}: {message}")]
    MalformedEntity { key: String, message: String },

    /// A single attachment could not be fetched or written.
    #[error("attachment {key} fetch failed: {message}")]
    AttachmentFetch { key: String, message: String },

    /// Invalid or contradictory configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Another run holds the lock marker.
    #[error("another sync run is in progress (lock held at {0})")]
    RunLocked(PathBuf),

    /// Operator requested cancellation; observed between entity batches,
    /// never mid-batch.
    #[error("sync run cancelled by operator")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed JSON in cached entity: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether this error aborts the whole run, as opposed to a single
    /// document or file that the caller skips.
    pub fn is_fatal_to_run(&self) -> bool {
        !matches!(
            self,
            SyncError::MalformedEntity { .. } | SyncError::AttachmentFetch { .. }
        )
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_item_errors_are_not_fatal() {
        let e = SyncError::MalformedEntity {
            key: "ABCD2345".into(),
            message: "missing itemType".into(),
        };
        assert!(!e.is_fatal_to_run());

        let e = SyncError::AttachmentFetch {
            key: "ABCD2345".into(),
            message: "timeout".into(),
        };
        assert!(!e.is_fatal_to_run());
    }

    #[test]
    fn remote_unavailable_is_fatal() {
        let e = SyncError::RemoteUnavailable {
            attempts: 3,
            message: "connection refused".into(),
        };
        assert!(e.is_fatal_to_run());
        assert!(e.to_string().contains("3 attempts"));
    }
}
