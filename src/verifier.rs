//! Structural evidence verification. Grounding is a property of the evidence
//! set (count of usable items), not of the answer text; claim extraction is
//! out of scope.

use crate::error::CoreError;
use crate::types::{
    EvidenceCheck, EvidenceType, ToolCallStatus, ToolExecutionResult, VerifierReport,
};

/// Derive the approval decision and checks from the run's execution results.
pub fn verify(results: &[ToolExecutionResult], _user_message: &str) -> VerifierReport {
    let mut checks = Vec::with_capacity(results.len() + 1);
    let mut suggested_actions = Vec::new();

    let any_success = results
        .iter()
        .any(|r| r.tool_call.status == ToolCallStatus::Success && r.tool_result.is_some());
    checks.push(EvidenceCheck {
        claim: "at least one tool execution succeeded".to_string(),
        supported: any_success,
        evidence_id: None,
        evidence_type: None,
        reason: if any_success {
            None
        } else {
            Some("no tool produced a result".to_string())
        },
    });

    for result in results {
        match (&result.tool_call.status, &result.tool_result) {
            (ToolCallStatus::Success, Some(tool_result)) => {
                let has_rows = tool_result.row_count.map(|n| n > 0).unwrap_or(false);
                // A zero-row result still counts when the payload object is
                // non-empty; this keeps an empty rag search non-fatal.
                let has_data = tool_result
                    .data
                    .as_object()
                    .map(|o| !o.is_empty())
                    .unwrap_or(false);
                let supported = has_rows || has_data;
                checks.push(EvidenceCheck {
                    claim: format!("tool `{}` returned data", result.tool_call.tool_name),
                    supported,
                    evidence_id: supported.then(|| tool_result.id.clone()),
                    evidence_type: supported.then_some(EvidenceType::ToolResult),
                    reason: (!supported).then(|| "result carried no rows or data".to_string()),
                });
            }
            _ => {
                let reason = result
                    .tool_call
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "tool execution failed".to_string());
                checks.push(EvidenceCheck {
                    claim: format!(
                        "tool `{}` executed successfully",
                        result.tool_call.tool_name
                    ),
                    supported: false,
                    evidence_id: None,
                    evidence_type: None,
                    reason: Some(reason),
                });
                suggested_actions.push(format!(
                    "retry `{}` or rephrase the question",
                    result.tool_call.tool_name
                ));
            }
        }
    }

    let evidence_checks_ok = checks
        .iter()
        .filter(|c| c.evidence_type.is_some())
        .all(|c| c.supported);
    let approved = any_success && evidence_checks_ok;

    VerifierReport {
        approved,
        summary: (!approved).then(|| {
            let failed = checks.iter().filter(|c| !c.supported).count();
            format!("{failed} of {} checks unsupported", checks.len())
        }),
        checks,
        suggested_actions: if suggested_actions.is_empty() {
            None
        } else {
            Some(suggested_actions)
        },
    }
}

/// Fatal shortcut: every attempted tool failed. Mixed or zero attempts are
/// non-fatal; the answer generator acknowledges missing data instead.
pub fn verify_or_throw(results: &[ToolExecutionResult]) -> Result<(), CoreError> {
    let attempted = results.len();
    let failed = results
        .iter()
        .filter(|r| r.tool_call.status != ToolCallStatus::Success)
        .count();
    if attempted > 0 && failed == attempted {
        let reasons = results
            .iter()
            .filter_map(|r| r.tool_call.error_message.clone())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(CoreError::Verification {
            reason: if reasons.is_empty() {
                "every tool execution failed".to_string()
            } else {
                format!("every tool execution failed: {reasons}")
            },
        });
    }
    Ok(())
}
