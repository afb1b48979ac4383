use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::types::{Citation, ToolCall, ToolResult};

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Serialize with object keys sorted recursively, so hashes are independent
/// of key insertion order.
pub fn canonical_json_string(value: &Value) -> String {
    serde_json::to_string(&canonicalize(value)).unwrap_or_else(|_| "null".to_string())
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), canonicalize(v));
            }
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize).collect()),
        _ => value.clone(),
    }
}

/// 16-hex-character prefix of the SHA-256 over the canonical JSON form.
pub fn checksum16(value: &Value) -> String {
    let full = sha256_hex(canonical_json_string(value).as_bytes());
    full[..16].to_string()
}

/// The persisted form of the final answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub thread_id: String,
    pub workspace_id: String,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    pub created_at: String,
}

/// Append-only audit persistence. Every write is best-effort: callers log
/// failures and keep the response stream alive.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn insert_tool_call(&self, record: &ToolCall) -> anyhow::Result<()>;
    async fn insert_tool_result(&self, record: &ToolResult) -> anyhow::Result<()>;
    async fn insert_message(&self, record: &MessageRecord) -> anyhow::Result<()>;
}

/// JSONL-file store: one append-only file per record kind under a directory.
#[derive(Debug, Clone)]
pub struct JsonlEvidenceStore {
    dir: PathBuf,
}

impl JsonlEvidenceStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn append<T: Serialize>(&self, file: &str, record: &T) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(file);
        let mut out = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open evidence file {}", path.display()))?;
        let line = serde_json::to_string(record)?;
        writeln!(out, "{line}")?;
        Ok(())
    }

    pub fn tool_calls_path(&self) -> PathBuf {
        self.dir.join("tool_calls.jsonl")
    }

    pub fn tool_results_path(&self) -> PathBuf {
        self.dir.join("tool_results.jsonl")
    }

    pub fn messages_path(&self) -> PathBuf {
        self.dir.join("messages.jsonl")
    }
}

#[async_trait]
impl EvidenceStore for JsonlEvidenceStore {
    async fn insert_tool_call(&self, record: &ToolCall) -> anyhow::Result<()> {
        self.append("tool_calls.jsonl", record)
    }

    async fn insert_tool_result(&self, record: &ToolResult) -> anyhow::Result<()> {
        self.append("tool_results.jsonl", record)
    }

    async fn insert_message(&self, record: &MessageRecord) -> anyhow::Result<()> {
        self.append("messages.jsonl", record)
    }
}

/// Store that drops everything. Used when durability is not wanted.
#[derive(Debug, Clone, Default)]
pub struct NullEvidenceStore;

#[async_trait]
impl EvidenceStore for NullEvidenceStore {
    async fn insert_tool_call(&self, _record: &ToolCall) -> anyhow::Result<()> {
        Ok(())
    }

    async fn insert_tool_result(&self, _record: &ToolResult) -> anyhow::Result<()> {
        Ok(())
    }

    async fn insert_message(&self, _record: &MessageRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

pub fn jsonl_line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|c| c.lines().count())
        .unwrap_or(0)
}
