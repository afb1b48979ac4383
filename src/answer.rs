//! Turns verified evidence into a validated, fully cited Answer. The adapter
//! sees only tool results and the verifier report, never raw user data
//! sources, and its output does not leave this module unvalidated.

use std::collections::HashSet;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::events::{emit_or_cancelled, EventSink, StreamEvent};
use crate::providers::{AnswerRequest, LlmAdapter};
use crate::schema::validate_answer;
use crate::types::{Answer, RunContext, ToolCallStatus, ToolExecutionResult, VerifierReport};

/// Every evidence id a citation may legally reference in this run: the ids
/// of successful tool results plus the chunk ids inside rag payloads.
pub fn known_evidence_ids(results: &[ToolExecutionResult]) -> HashSet<String> {
    let mut ids = HashSet::new();
    for result in results {
        let Some(tool_result) = &result.tool_result else {
            continue;
        };
        ids.insert(tool_result.id.clone());
        if let Some(chunks) = tool_result.data.get("chunks").and_then(|v| v.as_array()) {
            for chunk in chunks {
                if let Some(chunk_id) = chunk.get("chunkId").and_then(|v| v.as_str()) {
                    ids.insert(chunk_id.to_string());
                }
            }
        }
    }
    ids
}

pub struct AnswerGenerator;

impl AnswerGenerator {
    /// Stream fragments when the adapter supports it, then obtain and
    /// validate the structured answer.
    pub async fn generate(
        adapter: &dyn LlmAdapter,
        ctx: &RunContext,
        results: &[ToolExecutionResult],
        report: &VerifierReport,
        system_context: &str,
        cancel: &CancellationToken,
        sink: &mut dyn EventSink,
    ) -> Result<Answer, CoreError> {
        let tool_results: Vec<_> = results
            .iter()
            .filter(|r| r.tool_call.status == ToolCallStatus::Success)
            .filter_map(|r| r.tool_result.clone())
            .collect();
        let request = AnswerRequest {
            user_message: ctx.user_message.clone(),
            tool_results: tool_results.clone(),
            verifier_report: report.clone(),
            system_context: system_context.to_string(),
        };

        if adapter.supports_streaming() {
            let mut fragments = adapter.stream_answer(request.clone());
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                    next = fragments.next() => next,
                };
                match next {
                    Some(Ok(token)) => {
                        emit_or_cancelled(sink, StreamEvent::Token { token }).await?;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("answer stream broke; falling back to final call: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }

        let raw = tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            raw = adapter.generate_answer(request) => raw,
        }
        .map_err(|e| CoreError::Answer {
            issues: vec![format!("adapter error: {e}")],
        })?;
        let answer = validate_answer(&raw).map_err(|issues| CoreError::Answer { issues })?;

        let known = known_evidence_ids(results);
        let mut issues = Vec::new();
        if tool_results.is_empty() && !answer.citations.is_empty() {
            issues.push("citations present but the run produced no evidence".to_string());
        }
        for citation in &answer.citations {
            if !known.contains(&citation.evidence_id) {
                issues.push(format!(
                    "citation [{}] references unknown evidence id '{}'",
                    citation.index, citation.evidence_id
                ));
            }
        }
        if !issues.is_empty() {
            return Err(CoreError::Answer { issues });
        }
        Ok(answer)
    }
}
