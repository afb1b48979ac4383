use std::io::Write;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::types::{Answer, Plan, ToolCallStatus, VerifierReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Planning,
    Policy,
    ToolsRunning,
    Verifying,
    Answering,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Planning => "planning",
            Stage::Policy => "policy",
            Stage::ToolsRunning => "toolsRunning",
            Stage::Verifying => "verifying",
            Stage::Answering => "answering",
        }
    }
}

/// One tagged record in the ordered stream the core emits as it progresses.
/// The HTTP edge turns these into SSE frames via `to_sse`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Meta {
        thread_id: String,
        message_id: String,
    },
    Status {
        stage: Stage,
    },
    Plan(Plan),
    ToolCallStart {
        tool: String,
        args: Value,
    },
    ToolCallEnd {
        tool: String,
        status: ToolCallStatus,
        duration_ms: i64,
        row_count: Option<i64>,
        error: Option<String>,
    },
    Verification(VerifierReport),
    Token {
        token: String,
    },
    Answer(Answer),
    Error {
        message: String,
        stage: Option<Stage>,
        code: Option<String>,
    },
    Done,
}

impl StreamEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            StreamEvent::Meta { .. } => "meta",
            StreamEvent::Status { .. } => "status",
            StreamEvent::Plan(_) => "plan",
            StreamEvent::ToolCallStart { .. } => "tool_call_start",
            StreamEvent::ToolCallEnd { .. } => "tool_call_end",
            StreamEvent::Verification(_) => "verification",
            StreamEvent::Token { .. } => "token",
            StreamEvent::Answer(_) => "answer",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done => "done",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            StreamEvent::Meta {
                thread_id,
                message_id,
            } => json!({"threadId": thread_id, "messageId": message_id}),
            StreamEvent::Status { stage } => json!({"stage": stage.as_str()}),
            StreamEvent::Plan(plan) => serde_json::to_value(plan).unwrap_or(Value::Null),
            StreamEvent::ToolCallStart { tool, args } => json!({"tool": tool, "args": args}),
            StreamEvent::ToolCallEnd {
                tool,
                status,
                duration_ms,
                row_count,
                error,
            } => {
                let mut data = json!({
                    "tool": tool,
                    "status": status.as_str(),
                    "durationMs": duration_ms,
                    "rowCount": row_count,
                });
                if let Some(error) = error {
                    data["error"] = json!(error);
                }
                data
            }
            StreamEvent::Verification(report) => {
                serde_json::to_value(report).unwrap_or(Value::Null)
            }
            StreamEvent::Token { token } => json!({"token": token}),
            StreamEvent::Answer(answer) => serde_json::to_value(answer).unwrap_or(Value::Null),
            StreamEvent::Error {
                message,
                stage,
                code,
            } => {
                let mut data = json!({"message": message});
                if let Some(stage) = stage {
                    data["stage"] = json!(stage.as_str());
                }
                if let Some(code) = code {
                    data["code"] = json!(code);
                }
                data
            }
            StreamEvent::Done => json!({}),
        }
    }

    /// One SSE frame: `event: <tag>\n` then `data: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.tag(), self.data())
    }

    pub fn envelope(&self) -> Value {
        json!({"event": self.tag(), "data": self.data()})
    }
}

/// Consumer side of the event stream. Emission suspends on back-pressure, so
/// a slow consumer slows the pipeline instead of losing events.
#[async_trait]
pub trait EventSink: Send {
    async fn emit(&mut self, event: StreamEvent) -> anyhow::Result<()>;
}

/// A sink that cannot accept events means the consumer is gone; the producer
/// treats that exactly like a cancelled request.
pub async fn emit_or_cancelled(
    sink: &mut dyn EventSink,
    event: StreamEvent,
) -> Result<(), crate::error::CoreError> {
    sink.emit(event)
        .await
        .map_err(|_| crate::error::CoreError::Cancelled)
}

/// Feeds a bounded tokio channel; the receiver is the HTTP edge.
pub struct ChannelSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&mut self, event: StreamEvent) -> anyhow::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("event consumer dropped"))
    }
}

/// Records every event in memory. The test harness sink.
#[derive(Debug, Default)]
pub struct VecSink {
    pub events: Vec<StreamEvent>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tags(&self) -> Vec<&'static str> {
        self.events.iter().map(StreamEvent::tag).collect()
    }
}

#[async_trait]
impl EventSink for VecSink {
    async fn emit(&mut self, event: StreamEvent) -> anyhow::Result<()> {
        self.events.push(event);
        Ok(())
    }
}

/// Appends each event envelope as one JSONL line.
pub struct JsonlFileSink {
    file: std::fs::File,
}

impl JsonlFileSink {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        Ok(Self { file })
    }
}

#[async_trait]
impl EventSink for JsonlFileSink {
    async fn emit(&mut self, event: StreamEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(&event.envelope())?;
        writeln!(self.file, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{EventSink, JsonlFileSink, Stage, StreamEvent};

    #[test]
    fn sse_frame_has_tag_and_data_lines() {
        let ev = StreamEvent::Meta {
            thread_id: "t1".to_string(),
            message_id: "m1".to_string(),
        };
        let frame = ev.to_sse();
        assert!(frame.starts_with("event: meta\ndata: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"threadId\":\"t1\""));
    }

    #[test]
    fn status_stage_uses_camel_case_values() {
        let ev = StreamEvent::Status {
            stage: Stage::ToolsRunning,
        };
        assert_eq!(ev.data()["stage"], "toolsRunning");
    }

    #[test]
    fn tool_call_end_omits_absent_error() {
        let ev = StreamEvent::ToolCallEnd {
            tool: "sql.query".to_string(),
            status: crate::types::ToolCallStatus::Success,
            duration_ms: 12,
            row_count: Some(1),
            error: None,
        };
        let data = ev.data();
        assert!(data.get("error").is_none());
        assert_eq!(data["durationMs"], 12);
    }

    #[tokio::test]
    async fn jsonl_sink_appends_envelopes() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("events.jsonl");
        let mut sink = JsonlFileSink::new(&path).expect("sink");
        sink.emit(StreamEvent::Done).await.expect("emit1");
        sink.emit(StreamEvent::Done).await.expect("emit2");
        let content = std::fs::read_to_string(&path).expect("read");
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"event\":\"done\""));
    }
}
