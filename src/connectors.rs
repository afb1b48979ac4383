//! Connector contracts for the two built-in tools, in-memory substitutes the
//! core's tests rely on, and the read-only session discipline for pooled SQL
//! connections.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::checksum16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlQueryRequest {
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlQueryResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Value>,
    pub row_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn query(&self, req: SqlQueryRequest) -> anyhow::Result<SqlQueryResponse>;
    async fn test_connection(&self) -> ConnectionHealth;
    async fn disconnect(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RagSearchRequest {
    pub query: String,
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RagChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSearchResponse {
    pub chunks: Vec<RagChunk>,
}

#[async_trait]
pub trait RagConnector: Send + Sync {
    async fn search(&self, req: RagSearchRequest) -> anyhow::Result<RagSearchResponse>;
}

/// Scripted SQL connector. Responses pop in order; errors are scripted as
/// strings so tests can assert on messages.
#[derive(Debug, Default)]
pub struct StaticSqlConnector {
    responses: Mutex<VecDeque<Result<SqlQueryResponse, String>>>,
}

impl StaticSqlConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, columns: &[&str], rows: Vec<Value>) -> Self {
        let row_count = rows.len() as i64;
        let checksum = checksum16(&Value::Array(rows.clone()));
        self.responses
            .lock()
            .expect("responses lock")
            .push_back(Ok(SqlQueryResponse {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
                row_count,
                checksum: Some(checksum),
                truncated: false,
            }));
        self
    }

    pub fn with_error(self, message: &str) -> Self {
        self.responses
            .lock()
            .expect("responses lock")
            .push_back(Err(message.to_string()));
        self
    }
}

#[async_trait]
impl SqlConnector for StaticSqlConnector {
    async fn query(&self, req: SqlQueryRequest) -> anyhow::Result<SqlQueryResponse> {
        let scripted = self
            .responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted response for: {}", req.sql))?;
        let mut response = scripted.map_err(|e| anyhow::anyhow!(e))?;
        if let Some(max_rows) = req.max_rows {
            let max = max_rows.max(0) as usize;
            if response.rows.len() > max {
                response.rows.truncate(max);
                response.row_count = max as i64;
                response.truncated = true;
            }
        }
        Ok(response)
    }

    async fn test_connection(&self) -> ConnectionHealth {
        ConnectionHealth {
            ok: true,
            error: None,
        }
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory document index; returns the best `top_k` of its fixed chunks.
#[derive(Debug, Clone, Default)]
pub struct StaticRagConnector {
    chunks: Vec<RagChunk>,
}

impl StaticRagConnector {
    pub fn new(chunks: Vec<RagChunk>) -> Self {
        Self { chunks }
    }
}

#[async_trait]
impl RagConnector for StaticRagConnector {
    async fn search(&self, req: RagSearchRequest) -> anyhow::Result<RagSearchResponse> {
        let top_k = req.top_k.unwrap_or(5);
        let mut chunks = self.chunks.clone();
        chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        chunks.truncate(top_k);
        Ok(RagSearchResponse { chunks })
    }
}

/// Raw connection handle as seen by the session guard.
#[async_trait]
pub trait RawSqlSession: Send {
    async fn execute(&mut self, sql: &str) -> anyhow::Result<()>;
}

/// Process-wide pool of raw connections.
#[async_trait]
pub trait RawSqlPool: Send + Sync {
    async fn acquire(&self) -> anyhow::Result<Box<dyn RawSqlSession>>;
}

/// Wraps a raw pool so every acquired connection is bounded and read-only,
/// and no connection returns to the pool with either setting still in place.
pub struct SqlSessionPool<P: RawSqlPool> {
    pool: P,
    statement_timeout_ms: u64,
}

impl<P: RawSqlPool> SqlSessionPool<P> {
    pub fn new(pool: P, statement_timeout_ms: u64) -> Self {
        Self {
            pool,
            statement_timeout_ms,
        }
    }

    pub async fn acquire(&self) -> anyhow::Result<GuardedSession> {
        let mut session = self.pool.acquire().await?;
        session
            .execute(&format!(
                "SET statement_timeout = {}",
                self.statement_timeout_ms
            ))
            .await?;
        session
            .execute("SET default_transaction_read_only = on")
            .await?;
        Ok(GuardedSession { session })
    }
}

pub struct GuardedSession {
    session: Box<dyn RawSqlSession>,
}

impl GuardedSession {
    pub async fn execute(&mut self, sql: &str) -> anyhow::Result<()> {
        self.session.execute(sql).await
    }

    /// Reset session state before the connection goes back to the pool.
    /// Reset failure is logged, never raised.
    pub async fn release(mut self) {
        for reset in [
            "RESET statement_timeout",
            "RESET default_transaction_read_only",
        ] {
            if let Err(e) = self.session.execute(reset).await {
                tracing::warn!("failed to reset sql session state: {e}");
            }
        }
    }
}
