//! Bounded tool execution. Actions run strictly in plan order so citation
//! indices stay stable; one failed action never aborts the sequence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::connectors::{RagConnector, RagSearchRequest, SqlConnector, SqlQueryRequest};
use crate::error::CoreError;
use crate::events::{emit_or_cancelled, EventSink, Stage, StreamEvent};
use crate::store::{checksum16, now_rfc3339, EvidenceStore};
use crate::types::{
    PolicyDecision, RunContext, ToolCall, ToolCallStatus, ToolExecutionResult, ToolResult,
    PREVIEW_ROW_COUNT,
};

/// What a connector hands back to the runtime: the opaque payload plus the
/// row view used for counting, truncation and previews.
#[derive(Debug, Clone)]
pub struct ConnectorOutput {
    pub data: Value,
    pub row_count: Option<i64>,
    pub rows: Vec<Value>,
}

/// Uniform dispatch surface over the typed connectors. The table is open;
/// anything registered under a tool name can be planned and executed.
#[async_trait]
pub trait ToolConnector: Send + Sync {
    async fn invoke(
        &self,
        args: &Map<String, Value>,
        ctx: &RunContext,
    ) -> anyhow::Result<ConnectorOutput>;
}

#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    map: HashMap<String, Arc<dyn ToolConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: &str, connector: Arc<dyn ToolConnector>) {
        self.map.insert(tool.to_string(), connector);
    }

    pub fn register_sql(&mut self, connector: Arc<dyn SqlConnector>, default_max_rows: i64) {
        self.register(
            crate::policy::SQL_TOOL,
            Arc::new(SqlToolConnector {
                connector,
                default_max_rows,
            }),
        );
    }

    pub fn register_rag(&mut self, connector: Arc<dyn RagConnector>) {
        self.register(crate::policy::RAG_TOOL, Arc::new(RagToolConnector { connector }));
    }

    fn get(&self, tool: &str) -> Option<Arc<dyn ToolConnector>> {
        self.map.get(tool).cloned()
    }
}

struct SqlToolConnector {
    connector: Arc<dyn SqlConnector>,
    default_max_rows: i64,
}

#[async_trait]
impl ToolConnector for SqlToolConnector {
    async fn invoke(
        &self,
        args: &Map<String, Value>,
        ctx: &RunContext,
    ) -> anyhow::Result<ConnectorOutput> {
        let sql = args
            .get("sql")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("sql.query requires a string 'sql' argument"))?;
        crate::sqlgate::ensure_dispatchable(sql)?;
        let source_id = args
            .get("sourceId")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if let Some(source_id) = &source_id {
            if !ctx.allowed_sources.is_empty() && !ctx.allowed_sources.contains(source_id) {
                return Err(CoreError::SourceNotFound {
                    source_id: source_id.clone(),
                }
                .into());
            }
        }
        let max_rows = args
            .get("maxRows")
            .and_then(|v| v.as_i64())
            .unwrap_or(self.default_max_rows);
        let response = self
            .connector
            .query(SqlQueryRequest {
                sql: sql.to_string(),
                source_id,
                workspace_id: ctx.workspace_id.clone(),
                max_rows: Some(max_rows),
            })
            .await?;
        let rows = response.rows.clone();
        let row_count = response.row_count;
        let data = json!({
            "columns": response.columns,
            "rows": response.rows,
            "rowCount": row_count,
            "truncated": response.truncated,
        });
        Ok(ConnectorOutput {
            data,
            row_count: Some(row_count),
            rows,
        })
    }
}

struct RagToolConnector {
    connector: Arc<dyn RagConnector>,
}

#[async_trait]
impl ToolConnector for RagToolConnector {
    async fn invoke(
        &self,
        args: &Map<String, Value>,
        ctx: &RunContext,
    ) -> anyhow::Result<ConnectorOutput> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("rag.search requires a string 'query' argument"))?;
        let source_ids = args.get("sourceIds").and_then(|v| v.as_array()).map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        });
        let top_k = args
            .get("topK")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize);
        let response = self
            .connector
            .search(RagSearchRequest {
                query: query.to_string(),
                workspace_id: ctx.workspace_id.clone(),
                source_ids,
                top_k,
            })
            .await?;
        let chunks = serde_json::to_value(&response.chunks)?;
        let rows = chunks.as_array().cloned().unwrap_or_default();
        let row_count = rows.len() as i64;
        Ok(ConnectorOutput {
            data: json!({"chunks": chunks}),
            row_count: Some(row_count),
            rows,
        })
    }
}

pub struct ToolRuntime {
    registry: ConnectorRegistry,
    store: Arc<dyn EvidenceStore>,
    tool_timeout: Duration,
    max_rows: i64,
}

impl ToolRuntime {
    pub fn new(
        registry: ConnectorRegistry,
        store: Arc<dyn EvidenceStore>,
        tool_timeout_ms: u64,
        max_rows: i64,
    ) -> Self {
        Self {
            registry,
            store,
            tool_timeout: Duration::from_millis(tool_timeout_ms),
            max_rows,
        }
    }

    /// Dispatch every approved decision in order, emitting one
    /// `tool_call_start`/`tool_call_end` pair per action. Only cancellation
    /// (or a dropped consumer) gets out of this loop early.
    pub async fn execute_actions(
        &self,
        decisions: &[PolicyDecision],
        ctx: &RunContext,
        cancel: &CancellationToken,
        sink: &mut dyn EventSink,
    ) -> Result<Vec<ToolExecutionResult>, CoreError> {
        let mut results = Vec::new();
        for decision in decisions.iter().filter(|d| d.approved) {
            let Some(args) = decision.sanitized_args.as_ref() else {
                continue;
            };
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let tool = decision.action.tool.clone();
            emit_or_cancelled(
                sink,
                StreamEvent::Status {
                    stage: Stage::ToolsRunning,
                },
            )
            .await?;
            emit_or_cancelled(
                sink,
                StreamEvent::ToolCallStart {
                    tool: tool.clone(),
                    args: Value::Object(args.clone()),
                },
            )
            .await?;

            let mut tool_call = ToolCall {
                id: uuid::Uuid::new_v4().to_string(),
                message_id: ctx.message_id.clone(),
                thread_id: ctx.thread_id.clone(),
                workspace_id: ctx.workspace_id.clone(),
                tool_name: tool.clone(),
                tool_args: Value::Object(args.clone()),
                status: ToolCallStatus::Running,
                started_at: now_rfc3339(),
                finished_at: None,
                duration_ms: None,
                error_message: None,
            };
            self.persist_call(&tool_call).await;

            let started = Instant::now();
            let invoked = self.invoke_with_deadline(&tool, args, ctx, cancel).await?;
            let duration_ms = started.elapsed().as_millis() as i64;
            tool_call.finished_at = Some(now_rfc3339());
            tool_call.duration_ms = Some(duration_ms);

            let result = match invoked {
                Ok(mut output) => {
                    self.truncate_rows(&mut output);
                    let preview: Vec<Value> =
                        output.rows.iter().take(PREVIEW_ROW_COUNT).cloned().collect();
                    let tool_result = ToolResult {
                        id: uuid::Uuid::new_v4().to_string(),
                        tool_call_id: tool_call.id.clone(),
                        thread_id: ctx.thread_id.clone(),
                        workspace_id: ctx.workspace_id.clone(),
                        checksum: Some(checksum16(&output.data)),
                        data: output.data,
                        row_count: output.row_count,
                        preview_rows: Some(preview),
                    };
                    tool_call.status = ToolCallStatus::Success;
                    self.persist_call(&tool_call).await;
                    if let Err(e) = self.store.insert_tool_result(&tool_result).await {
                        tracing::warn!("failed to persist tool result: {e}");
                    }
                    emit_or_cancelled(
                        sink,
                        StreamEvent::ToolCallEnd {
                            tool: tool.clone(),
                            status: ToolCallStatus::Success,
                            duration_ms,
                            row_count: tool_result.row_count,
                            error: None,
                        },
                    )
                    .await?;
                    ToolExecutionResult {
                        tool_call,
                        tool_result: Some(tool_result),
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    tool_call.status = ToolCallStatus::Error;
                    tool_call.error_message = Some(message.clone());
                    self.persist_call(&tool_call).await;
                    emit_or_cancelled(
                        sink,
                        StreamEvent::ToolCallEnd {
                            tool: tool.clone(),
                            status: ToolCallStatus::Error,
                            duration_ms,
                            row_count: None,
                            error: Some(message),
                        },
                    )
                    .await?;
                    ToolExecutionResult {
                        tool_call,
                        tool_result: None,
                    }
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Race the connector call against the per-call deadline and the run's
    /// cancellation signal. Timeouts are per-action errors; cancellation is
    /// the only early exit.
    async fn invoke_with_deadline(
        &self,
        tool: &str,
        args: &Map<String, Value>,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<anyhow::Result<ConnectorOutput>, CoreError> {
        let Some(connector) = self.registry.get(tool) else {
            return Ok(Err(CoreError::ToolExecution {
                reason: format!("unknown tool: {tool}"),
            }
            .into()));
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
            outcome = tokio::time::timeout(self.tool_timeout, connector.invoke(args, ctx)) => {
                Ok(match outcome {
                    Ok(inner) => inner,
                    Err(_) => Err(CoreError::ToolExecution {
                        reason: format!(
                            "tool timed out after {}ms",
                            self.tool_timeout.as_millis()
                        ),
                    }
                    .into()),
                })
            }
        }
    }

    /// Connectors already apply the row ceiling; this re-applies it on the
    /// way out so a misbehaving connector still cannot exceed it.
    fn truncate_rows(&self, output: &mut ConnectorOutput) {
        let max = self.max_rows.max(0) as usize;
        if output.rows.len() <= max {
            return;
        }
        output.rows.truncate(max);
        output.row_count = Some(max as i64);
        if let Some(object) = output.data.as_object_mut() {
            if let Some(rows) = object.get_mut("rows").and_then(|v| v.as_array_mut()) {
                rows.truncate(max);
            }
            object.insert("rowCount".to_string(), json!(max as i64));
            object.insert("truncated".to_string(), json!(true));
        }
    }

    async fn persist_call(&self, record: &ToolCall) {
        if let Err(e) = self.store.insert_tool_call(record).await {
            tracing::warn!("failed to persist tool call: {e}");
        }
    }
}

/// Audit record for an action the policy engine rejected. Never dispatched.
pub fn blocked_tool_call(decision: &PolicyDecision, ctx: &RunContext) -> ToolCall {
    ToolCall {
        id: uuid::Uuid::new_v4().to_string(),
        message_id: ctx.message_id.clone(),
        thread_id: ctx.thread_id.clone(),
        workspace_id: ctx.workspace_id.clone(),
        tool_name: decision.action.tool.clone(),
        tool_args: Value::Object(decision.action.args.clone()),
        status: ToolCallStatus::Blocked,
        started_at: now_rfc3339(),
        finished_at: None,
        duration_ms: None,
        error_message: Some(decision.errors.join("; ")),
    }
}
