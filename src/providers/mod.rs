pub mod mock;
pub mod openai_compat;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::types::{ToolResult, VerifierReport};

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub user_message: String,
    pub system_context: String,
    pub allowed_tools: Vec<String>,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub user_message: String,
    pub tool_results: Vec<ToolResult>,
    pub verifier_report: VerifierReport,
    pub system_context: String,
}

/// The language model behind the planner and the answer generator. Outputs
/// are untrusted JSON; the callers validate before anything leaves them.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn generate_plan(&self, req: PlanRequest) -> anyhow::Result<Value>;

    async fn generate_answer(&self, req: AnswerRequest) -> anyhow::Result<Value>;

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Lazy finite sequence of answer fragments. The structured answer still
    /// comes from `generate_answer`.
    fn stream_answer(&self, _req: AnswerRequest) -> BoxStream<'static, anyhow::Result<String>> {
        Box::pin(futures_util::stream::empty())
    }
}

/// Parse model output that should be JSON but may arrive fenced or wrapped
/// in prose.
pub(crate) fn parse_jsonish(raw: &str) -> anyhow::Result<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow::anyhow!("empty model output"));
    }
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Ok(v);
    }
    if let Some(candidate) = fenced_json_candidate(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(&candidate) {
            return Ok(v);
        }
    }
    if let Some((start, end)) = find_json_bounds(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
            return Ok(v);
        }
    }
    Err(anyhow::anyhow!(
        "model output must be valid JSON (plain or fenced ```json block)"
    ))
}

fn fenced_json_candidate(s: &str) -> Option<String> {
    if !s.starts_with("```") {
        return None;
    }
    let lines = s.lines().collect::<Vec<_>>();
    if lines.len() < 3 {
        return None;
    }
    if !lines.first()?.starts_with("```") || !lines.last()?.starts_with("```") {
        return None;
    }
    Some(lines[1..lines.len() - 1].join("\n"))
}

fn find_json_bounds(s: &str) -> Option<(usize, usize)> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end <= start {
        return None;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::parse_jsonish;

    #[test]
    fn plain_json_parses() {
        let v = parse_jsonish(r#"{"intent":"x"}"#).expect("parse");
        assert_eq!(v["intent"], "x");
    }

    #[test]
    fn fenced_json_parses() {
        let raw = "```json\n{\"intent\":\"x\"}\n```";
        let v = parse_jsonish(raw).expect("parse");
        assert_eq!(v["intent"], "x");
    }

    #[test]
    fn embedded_json_parses() {
        let raw = "Here is the plan: {\"intent\":\"x\"} as requested.";
        let v = parse_jsonish(raw).expect("parse");
        assert_eq!(v["intent"], "x");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_jsonish("not json at all").is_err());
        assert!(parse_jsonish("").is_err());
    }
}
