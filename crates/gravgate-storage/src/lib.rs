//! Usage & Observability Store: a bounded, retained log of requests with
//! structured request/response snapshots and per-`project_id` sliding-window
//! counters, persisted to a single JSON file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use gravgate_common::{atomic_write, now_ms};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt log store at {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDetail {
    pub request: Value,
    pub response: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSummary {
    pub text: String,
    pub tool_calls: Option<Value>,
    pub thinking: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: i64,
    pub model: String,
    pub project_id: String,
    pub success: bool,
    pub status_code: u16,
    pub message: Option<String>,
    pub duration_ms: u64,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<LogDetail>,
}

impl LogEntry {
    /// Same entry without the (potentially large) detail snapshot, for
    /// `RecentLogs` list views.
    fn without_detail(&self) -> LogEntry {
        let mut entry = self.clone();
        entry.detail = None;
        entry
    }
}

/// A redacting snapshot of an HTTP request for storage in `LogDetail`.
/// Redacted headers keep their key with the value replaced, so a caller can
/// still see the header was present.
pub fn redact_headers(headers: &[(String, String)]) -> Value {
    let sanitized: BTreeMap<String, String> = headers
        .iter()
        .map(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            if lower == "authorization" || lower == "cookie" {
                (name.clone(), "[REDACTED]".to_string())
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect();
    serde_json::json!({ "headers": sanitized })
}

/// Concatenates stream event `content` fields and records the last
/// `tool_calls` event, matching the derived summary the spec requires for
/// stream detail storage.
pub fn summarize_stream_events(events: &[Value]) -> StreamSummary {
    let mut text = String::new();
    let mut thinking = String::new();
    let mut tool_calls = None;
    for event in events {
        if let Some(content) = event.get("content").and_then(Value::as_str) {
            text.push_str(content);
        }
        if let Some(reasoning) = event.get("thinking").and_then(Value::as_str) {
            thinking.push_str(reasoning);
        }
        if let Some(calls) = event.get("tool_calls") {
            tool_calls = Some(calls.clone());
        }
    }
    StreamSummary {
        text,
        tool_calls,
        thinking,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UsageTotals {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub last_used_at: i64,
    pub models: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedFile {
    logs: Vec<LogEntry>,
    max_items: usize,
    retention_days: u32,
}

struct Inner {
    logs: Vec<LogEntry>,
    next_id: u64,
}

pub struct LogStore {
    path: std::path::PathBuf,
    max_items: usize,
    retention_days: u32,
    inner: RwLock<Inner>,
}

impl LogStore {
    pub async fn load(
        path: impl Into<std::path::PathBuf>,
        max_items: usize,
        retention_days: u32,
    ) -> StorageResult<Self> {
        let path = path.into();
        let logs = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let parsed: PersistedFile =
                    serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt {
                        path: path.display().to_string(),
                        source,
                    })?;
                parsed.logs
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let next_id = logs.iter().map(|entry| entry.id).max().unwrap_or(0) + 1;
        let store = Self {
            path,
            max_items,
            retention_days,
            inner: RwLock::new(Inner { logs, next_id }),
        };
        store.enforce_retention().await;
        Ok(store)
    }

    async fn enforce_retention(&self) {
        let cutoff = now_ms() - (self.retention_days as i64) * 86_400_000;
        let mut guard = self.inner.write().await;
        guard.logs.retain(|entry| entry.timestamp >= cutoff);
        let overflow = guard.logs.len().saturating_sub(self.max_items);
        if overflow > 0 {
            guard.logs.drain(0..overflow);
        }
    }

    async fn persist(&self, guard: &Inner) -> StorageResult<()> {
        let payload = PersistedFile {
            logs: guard.logs.clone(),
            max_items: self.max_items,
            retention_days: self.retention_days,
        };
        let bytes = serde_json::to_vec_pretty(&payload).expect("LogEntry always serializes");
        atomic_write(&self.path, &bytes).await?;
        Ok(())
    }

    /// Assigns an id, appends, enforces capacity, and persists atomically.
    pub async fn append(&self, mut entry: LogEntry) -> StorageResult<u64> {
        let cutoff = now_ms() - (self.retention_days as i64) * 86_400_000;
        let mut guard = self.inner.write().await;
        entry.id = guard.next_id;
        guard.next_id += 1;
        let id = entry.id;
        guard.logs.push(entry);
        guard.logs.retain(|entry| entry.timestamp >= cutoff);
        let overflow = guard.logs.len().saturating_sub(self.max_items);
        if overflow > 0 {
            guard.logs.drain(0..overflow);
        }
        self.persist(&guard).await?;
        Ok(id)
    }

    pub async fn recent_logs(&self, limit: usize) -> Vec<LogEntry> {
        let guard = self.inner.read().await;
        guard
            .logs
            .iter()
            .rev()
            .take(limit)
            .map(LogEntry::without_detail)
            .collect()
    }

    pub async fn get_detail(&self, id: u64) -> Option<LogEntry> {
        let guard = self.inner.read().await;
        guard.logs.iter().find(|entry| entry.id == id).cloned()
    }

    pub async fn clear(&self) -> StorageResult<()> {
        let mut guard = self.inner.write().await;
        guard.logs.clear();
        self.persist(&guard).await
    }

    pub async fn usage_summary(&self) -> BTreeMap<String, UsageTotals> {
        let guard = self.inner.read().await;
        let mut totals: BTreeMap<String, UsageTotals> = BTreeMap::new();
        for entry in &guard.logs {
            let row = totals.entry(entry.project_id.clone()).or_default();
            row.total += 1;
            if entry.success {
                row.success += 1;
            } else {
                row.failed += 1;
            }
            row.last_used_at = row.last_used_at.max(entry.timestamp);
            if !row.models.contains(&entry.model) {
                row.models.push(entry.model.clone());
            }
        }
        totals
    }

    /// Per-`project_id` `(success_count, failed_count)` over the trailing
    /// `window_ms` milliseconds, used by the credential pool for selection.
    pub async fn usage_within_window(&self, window_ms: i64) -> BTreeMap<String, (u64, u64)> {
        let cutoff = now_ms() - window_ms;
        let guard = self.inner.read().await;
        let mut counts: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for entry in guard.logs.iter().filter(|entry| entry.timestamp >= cutoff) {
            let row = counts.entry(entry.project_id.clone()).or_default();
            if entry.success {
                row.0 += 1;
            } else {
                row.1 += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, project_id: &str, timestamp: i64, success: bool) -> LogEntry {
        LogEntry {
            id,
            timestamp,
            model: "gemini-3-pro".to_string(),
            project_id: project_id.to_string(),
            success,
            status_code: if success { 200 } else { 500 },
            message: None,
            duration_ms: 10,
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            detail: Some(LogDetail {
                request: serde_json::json!({"headers": {"authorization": "Bearer secret", "x-trace": "abc"}}),
                response: serde_json::json!({"text": "hi"}),
            }),
        }
    }

    #[tokio::test]
    async fn redacts_sensitive_headers() {
        let headers = vec![
            ("Authorization".to_string(), "Bearer xyz".to_string()),
            ("Cookie".to_string(), "session=1".to_string()),
            ("X-Trace-Id".to_string(), "abc".to_string()),
        ];
        let redacted = redact_headers(&headers);
        let obj = redacted["headers"].as_object().unwrap();
        assert_eq!(obj["Authorization"], "[REDACTED]");
        assert_eq!(obj["Cookie"], "[REDACTED]");
        assert_eq!(obj["X-Trace-Id"], "abc");
    }

    #[tokio::test]
    async fn caps_at_max_items_dropping_oldest() {
        let dir = tempfile_dir();
        let path = dir.join("logs.json");
        let store = LogStore::load(&path, 5, 30).await.unwrap();
        for i in 0..8 {
            store
                .append(entry(0, "proj-a", now_ms() + i, true))
                .await
                .unwrap();
        }
        let recent = store.recent_logs(100).await;
        assert_eq!(recent.len(), 5);
        // newest first; oldest three (ids 1..=3) must have been dropped.
        assert!(recent.iter().all(|e| e.id >= 4));
    }

    #[tokio::test]
    async fn usage_within_window_splits_success_and_failure() {
        let dir = tempfile_dir();
        let path = dir.join("logs.json");
        let store = LogStore::load(&path, 100, 30).await.unwrap();
        let now = now_ms();
        store.append(entry(0, "proj-a", now, true)).await.unwrap();
        store.append(entry(0, "proj-a", now, false)).await.unwrap();
        store
            .append(entry(0, "proj-a", now - 3_600_000 * 2, true))
            .await
            .unwrap();
        let window = store.usage_within_window(60 * 60 * 1000).await;
        let (success, failed) = window["proj-a"];
        assert_eq!(success, 1);
        assert_eq!(failed, 1);
    }

    fn tempfile_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("gravgate-storage-test-{}", uuid_like()));
        dir
    }

    fn uuid_like() -> u128 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    }
}
