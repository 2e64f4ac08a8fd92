//! Sync progress reporting.
//!
//! Reports observable progress during `bibm sync` so operators see which
//! pipeline stage is running and how many entities have been pulled.
//! Progress is emitted on **stderr** so stdout remains parseable for
//! scripts.

use std::io::Write;

/// A single progress event for a sync run.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// An entity listing stage pulled another page.
    Fetching {
        stage: &'static str,
        fetched: u64,
    },
    /// Index build: documents written so far.
    Indexing { written: u64, total: u64 },
    /// Attachment reconciliation: files checked so far.
    Reconciling { checked: u64, total: u64 },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress: "sync items  fetched 1,234".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Fetching { stage, fetched } => {
                format!("sync {}  fetched {}\n", stage, format_number(*fetched))
            }
            ProgressEvent::Indexing { written, total } => {
                format!(
                    "index  {} / {} documents\n",
                    format_number(*written),
                    format_number(*total)
                )
            }
            ProgressEvent::Reconciling { checked, total } => {
                format!(
                    "attachments  {} / {} checked\n",
                    format_number(*checked),
                    format_number(*total)
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Fetching { stage, fetched } => serde_json::json!({
                "event": "progress",
                "phase": "fetching",
                "stage": stage,
                "fetched": fetched
            }),
            ProgressEvent::Indexing { written, total } => serde_json::json!({
                "event": "progress",
                "phase": "indexing",
                "written": written,
                "total": total
            }),
            ProgressEvent::Reconciling { checked, total } => serde_json::json!({
                "event": "progress",
                "phase": "reconciling",
                "checked": checked,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
