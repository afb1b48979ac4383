//! Scripted adapter used by the core's own tests and by local development
//! without a model endpoint.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

use super::{AnswerRequest, LlmAdapter, PlanRequest};

#[derive(Debug, Default)]
pub struct MockLlm {
    plans: Mutex<VecDeque<Value>>,
    answers: Mutex<VecDeque<Value>>,
    grounded_answer: Option<String>,
    fragments: Vec<String>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(self, plan: Value) -> Self {
        self.plans.lock().expect("plans lock").push_back(plan);
        self
    }

    pub fn with_answer(self, answer: Value) -> Self {
        self.answers.lock().expect("answers lock").push_back(answer);
        self
    }

    /// Honest-adapter mode: the answer cites exactly the evidence it was
    /// handed, one citation per tool result, in order.
    pub fn with_grounded_answer(mut self, content: &str) -> Self {
        self.grounded_answer = Some(content.to_string());
        self
    }

    pub fn with_stream(mut self, fragments: &[&str]) -> Self {
        self.fragments = fragments.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[async_trait]
impl LlmAdapter for MockLlm {
    async fn generate_plan(&self, _req: PlanRequest) -> anyhow::Result<Value> {
        self.plans
            .lock()
            .expect("plans lock")
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("mock adapter has no scripted plan"))
    }

    async fn generate_answer(&self, req: AnswerRequest) -> anyhow::Result<Value> {
        if let Some(answer) = self.answers.lock().expect("answers lock").pop_front() {
            return Ok(answer);
        }
        if let Some(content) = &self.grounded_answer {
            let citations: Vec<Value> = req
                .tool_results
                .iter()
                .enumerate()
                .map(|(i, result)| {
                    serde_json::json!({
                        "index": i + 1,
                        "evidenceId": result.id,
                        "evidenceType": "tool_result",
                    })
                })
                .collect();
            return Ok(serde_json::json!({
                "content": content,
                "citations": citations,
            }));
        }
        Err(anyhow::anyhow!("mock adapter has no scripted answer"))
    }

    fn supports_streaming(&self) -> bool {
        !self.fragments.is_empty()
    }

    fn stream_answer(&self, _req: AnswerRequest) -> BoxStream<'static, anyhow::Result<String>> {
        let fragments = self.fragments.clone();
        Box::pin(futures_util::stream::iter(fragments.into_iter().map(Ok)))
    }
}
