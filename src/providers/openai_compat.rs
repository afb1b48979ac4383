//! Adapter for OpenAI-compatible chat-completions endpoints (LM Studio,
//! llama.cpp server, vLLM, hosted gateways). Plan and answer outputs are
//! requested as JSON and still treated as untrusted by the callers.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_jsonish, AnswerRequest, LlmAdapter, PlanRequest};
use crate::types::ToolResult;

#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

impl OpenAiCompatConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            request_timeout: Duration::from_secs(120),
        }
    }
}

pub struct OpenAiCompatAdapter {
    client: Client,
    config: OpenAiCompatConfig,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OpenAiCompatAdapter {
    pub fn new(config: OpenAiCompatConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client, config })
    }

    async fn chat(&self, system: &str, user: &str, temperature: f32) -> anyhow::Result<String> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.config.model,
            "temperature": temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.context("chat request failed")?;
        let status = response.status();
        let text = response.text().await.context("chat response read failed")?;
        if !status.is_success() {
            anyhow::bail!(
                "chat endpoint returned {}: {}",
                status.as_u16(),
                truncate(&text, 200)
            );
        }
        let parsed: ChatResponse =
            serde_json::from_str(&text).context("chat response was not valid JSON")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("chat response had no content"))
    }
}

#[async_trait]
impl LlmAdapter for OpenAiCompatAdapter {
    async fn generate_plan(&self, req: PlanRequest) -> anyhow::Result<Value> {
        let system = plan_system_prompt(&req.allowed_tools, &req.system_context);
        let raw = self.chat(&system, &req.user_message, req.temperature).await?;
        parse_jsonish(&raw)
    }

    async fn generate_answer(&self, req: AnswerRequest) -> anyhow::Result<Value> {
        let system = answer_system_prompt(&req.system_context);
        let user = format!(
            "{}\n\nEVIDENCE:\n{}",
            req.user_message,
            evidence_digest(&req.tool_results, req.verifier_report.approved)
        );
        let raw = self.chat(&system, &user, 0.0).await?;
        parse_jsonish(&raw)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

fn plan_system_prompt(allowed_tools: &[String], system_context: &str) -> String {
    format!(
        "You plan tool calls to answer questions about the user's data.\n\
{system_context}\n\
Available tools: {}.\n\
Return JSON only:\n\
{{\n\
  \"intent\": \"one-line summary\",\n\
  \"actions\": [{{\"tool\": \"<name>\", \"args\": {{...}}, \"reason\": \"why\"}}],\n\
  \"needsClarification\": false,\n\
  \"clarificationQuestion\": null\n\
}}\n\
If the question is ambiguous, set needsClarification to true, fill \
clarificationQuestion, and leave actions empty.",
        allowed_tools.join(", ")
    )
}

fn answer_system_prompt(system_context: &str) -> String {
    format!(
        "You answer using ONLY the evidence provided. Never invent facts.\n\
{system_context}\n\
Cite every factual statement with [index] markers. Return JSON only:\n\
{{\n\
  \"content\": \"answer text with [1] markers\",\n\
  \"citations\": [{{\"index\": 1, \"evidenceId\": \"<tool result id>\", \"evidenceType\": \"tool_result\"}}],\n\
  \"followUps\": []\n\
}}\n\
If there is no evidence, say so plainly and cite nothing."
    )
}

/// Compact evidence block for the answer prompt: ids, counts and previews,
/// never full result payloads.
fn evidence_digest(results: &[ToolResult], approved: bool) -> String {
    let items: Vec<Value> = results
        .iter()
        .map(|r| {
            json!({
                "evidenceId": r.id,
                "rowCount": r.row_count,
                "checksum": r.checksum,
                "preview": r.preview_rows,
            })
        })
        .collect();
    let digest = json!({"verified": approved, "items": items});
    serde_json::to_string_pretty(&digest).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{evidence_digest, plan_system_prompt, ChatResponse};
    use crate::types::ToolResult;

    #[test]
    fn plan_prompt_names_the_allowed_tools() {
        let prompt = plan_system_prompt(
            &["sql.query".to_string(), "rag.search".to_string()],
            "workspace w1",
        );
        assert!(prompt.contains("sql.query, rag.search"));
        assert!(prompt.contains("needsClarification"));
    }

    #[test]
    fn evidence_digest_carries_ids_not_payloads() {
        let result = ToolResult {
            id: "tr1".to_string(),
            tool_call_id: "tc1".to_string(),
            thread_id: "t1".to_string(),
            workspace_id: "w1".to_string(),
            data: json!({"rows": [{"secret": "big blob"}]}),
            row_count: Some(1),
            checksum: Some("aabbccddeeff0011".to_string()),
            preview_rows: Some(vec![json!({"secret": "big blob"})]),
        };
        let digest = evidence_digest(&[result], true);
        assert!(digest.contains("tr1"));
        assert!(digest.contains("aabbccddeeff0011"));
    }

    #[test]
    fn chat_response_shape_parses() {
        let body = json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"content\":\"hi\"}"}}]
        });
        let parsed: ChatResponse =
            serde_json::from_value(body).expect("parse");
        assert_eq!(parsed.choices.len(), 1);
    }
}
