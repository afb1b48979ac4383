//! Validators between untrusted JSON (LLM output, client input) and the rest
//! of the core. Every issue is collected, not just the first.

use serde_json::Value;

use crate::types::{Answer, Plan, MAX_TOOL_NAME_CHARS, MAX_USER_MESSAGE_CHARS};

/// Validate a raw planner output against the Plan schema.
pub fn validate_plan(raw: &Value) -> Result<Plan, Vec<String>> {
    let plan: Plan = match serde_json::from_value(raw.clone()) {
        Ok(p) => p,
        Err(e) => return Err(vec![format!("plan is not schema-shaped: {e}")]),
    };
    let mut issues = Vec::new();
    if plan.intent.trim().is_empty() {
        issues.push("plan intent must be a non-empty string".to_string());
    }
    if plan.needs_clarification {
        match &plan.clarification_question {
            Some(q) if !q.trim().is_empty() => {}
            _ => issues.push(
                "needsClarification requires a non-empty clarificationQuestion".to_string(),
            ),
        }
    } else if plan.actions.is_empty() {
        issues.push("plan must contain at least one action".to_string());
    }
    for (idx, action) in plan.actions.iter().enumerate() {
        if action.tool.trim().is_empty() {
            issues.push(format!("action {} has an empty tool name", idx + 1));
        } else if action.tool.chars().count() > MAX_TOOL_NAME_CHARS {
            issues.push(format!(
                "action {} tool name exceeds {} chars",
                idx + 1,
                MAX_TOOL_NAME_CHARS
            ));
        }
    }
    if let Some(constraints) = &plan.constraints {
        if let Some(max_rows) = constraints.max_rows {
            if max_rows < 0 {
                issues.push("constraints.maxRows must be >= 0".to_string());
            }
        }
    }
    if issues.is_empty() {
        Ok(plan)
    } else {
        Err(issues)
    }
}

/// Validate a raw answer-generator output against the Answer schema.
/// Citation closure against the run's evidence is enforced separately by the
/// answer generator, which knows the evidence ids.
pub fn validate_answer(raw: &Value) -> Result<Answer, Vec<String>> {
    let answer: Answer = match serde_json::from_value(raw.clone()) {
        Ok(a) => a,
        Err(e) => return Err(vec![format!("answer is not schema-shaped: {e}")]),
    };
    let mut issues = Vec::new();
    if answer.content.trim().is_empty() {
        issues.push("answer content must be a non-empty string".to_string());
    }
    for (idx, citation) in answer.citations.iter().enumerate() {
        if citation.index < 1 {
            issues.push(format!("citation {} index must be >= 1", idx + 1));
        }
        if citation.evidence_id.trim().is_empty() {
            issues.push(format!("citation {} has an empty evidenceId", idx + 1));
        }
    }
    if issues.is_empty() {
        Ok(answer)
    } else {
        Err(issues)
    }
}

/// Validate the inbound user message before any stage runs.
pub fn validate_user_message(message: &str) -> Result<(), String> {
    if message.trim().is_empty() {
        return Err("user message must not be empty".to_string());
    }
    if message.chars().count() > MAX_USER_MESSAGE_CHARS {
        return Err(format!(
            "user message exceeds {MAX_USER_MESSAGE_CHARS} chars"
        ));
    }
    Ok(())
}
