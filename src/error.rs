use serde_json::{json, Value};
use thiserror::Error;

/// Stage-level failures that terminate the event stream. Per-action failures
/// are data (`PolicyDecision.errors`, `ToolCall.status == error`), never
/// raised through this type.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("planner failed after {attempts} attempt(s): {}", issues.join("; "))]
    Planner { attempts: u32, issues: Vec<String> },

    #[error("plan blocked by policy: {reason}")]
    PolicyBlocked { reason: String },

    #[error("sql safety violation: {reason}")]
    SqlSafety { reason: String },

    #[error("tool execution failed: {reason}")]
    ToolExecution { reason: String },

    #[error("answer rejected: {}", issues.join("; "))]
    Answer { issues: Vec<String> },

    #[error("verification failed: {reason}")]
    Verification { reason: String },

    #[error("source not found: {source_id}")]
    SourceNotFound { source_id: String },

    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Planner { .. } => "PLANNER_ERROR",
            CoreError::PolicyBlocked { .. } => "POLICY_BLOCKED",
            CoreError::SqlSafety { .. } => "SQL_SAFETY_ERROR",
            CoreError::ToolExecution { .. } => "TOOL_EXECUTION_ERROR",
            CoreError::Answer { .. } => "ANSWER_ERROR",
            CoreError::Verification { .. } => "VERIFICATION_ERROR",
            CoreError::SourceNotFound { .. } => "SOURCE_NOT_FOUND",
            CoreError::Cancelled => "CANCELLED",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::Planner { .. } => 422,
            CoreError::PolicyBlocked { .. } => 403,
            CoreError::SqlSafety { .. } => 403,
            CoreError::ToolExecution { .. } => 500,
            CoreError::Answer { .. } => 422,
            CoreError::Verification { .. } => 422,
            CoreError::SourceNotFound { .. } => 404,
            CoreError::Cancelled => 499,
        }
    }

    /// Structured detail bag for wire payloads and audit lines.
    pub fn detail(&self) -> Value {
        match self {
            CoreError::Planner { attempts, issues } => {
                json!({"attempts": attempts, "issues": issues})
            }
            CoreError::PolicyBlocked { reason } => json!({"reason": reason}),
            CoreError::SqlSafety { reason } => json!({"reason": reason}),
            CoreError::ToolExecution { reason } => json!({"reason": reason}),
            CoreError::Answer { issues } => json!({"issues": issues}),
            CoreError::Verification { reason } => json!({"reason": reason}),
            CoreError::SourceNotFound { source_id } => json!({"sourceId": source_id}),
            CoreError::Cancelled => json!({}),
        }
    }
}
