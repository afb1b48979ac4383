//! Plan-level tool gate and per-action policy engine. The gate rejects whole
//! plans; the engine turns each action into a `PolicyDecision` carrying the
//! arguments actually dispatched.

use globset::{Glob, GlobMatcher};
use serde_json::json;

use crate::config::{CoreConfig, SqlPolicyConfig};
use crate::error::CoreError;
use crate::sqlgate::check_sql;
use crate::types::{Plan, PlanAction, PolicyDecision};

pub const SQL_TOOL: &str = "sql.query";
pub const RAG_TOOL: &str = "rag.search";

#[derive(Debug, Clone)]
enum ToolMatcher {
    Exact(String),
    Glob(GlobMatcher),
}

impl ToolMatcher {
    fn matches(&self, tool: &str) -> bool {
        match self {
            ToolMatcher::Exact(name) => name == tool,
            ToolMatcher::Glob(glob) => glob.is_match(tool),
        }
    }
}

fn has_glob_meta(s: &str) -> bool {
    s.contains('*') || s.contains('?') || s.contains('[')
}

/// Whole-plan gate: allowlist membership plus the per-plan action cap.
#[derive(Debug, Clone)]
pub struct ToolGate {
    matchers: Vec<ToolMatcher>,
    max_calls_per_plan: usize,
}

impl ToolGate {
    pub fn new(patterns: &[String], max_calls_per_plan: usize) -> anyhow::Result<Self> {
        let mut matchers = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            if has_glob_meta(pattern) {
                matchers.push(ToolMatcher::Glob(Glob::new(pattern)?.compile_matcher()));
            } else {
                matchers.push(ToolMatcher::Exact(pattern.clone()));
            }
        }
        if matchers.is_empty() {
            tracing::warn!("tool allowlist is empty; all tools permitted");
        }
        Ok(Self {
            matchers,
            max_calls_per_plan,
        })
    }

    pub fn tool_allowed(&self, tool: &str) -> bool {
        self.matchers.is_empty() || self.matchers.iter().any(|m| m.matches(tool))
    }

    pub fn check_plan(&self, plan: &Plan) -> Result<(), CoreError> {
        if plan.actions.len() > self.max_calls_per_plan {
            return Err(CoreError::PolicyBlocked {
                reason: format!(
                    "plan has {} actions, exceeding the cap of {}",
                    plan.actions.len(),
                    self.max_calls_per_plan
                ),
            });
        }
        for action in &plan.actions {
            if !self.tool_allowed(&action.tool) {
                return Err(CoreError::PolicyBlocked {
                    reason: format!("tool '{}' is not allowlisted", action.tool),
                });
            }
        }
        Ok(())
    }
}

/// Composes the tool gate with per-action validation. `sql.query` arguments
/// go through the SQL safety gate and are replaced by their sanitized form;
/// other tools pass through unchanged.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    gate: ToolGate,
    sql_policy: SqlPolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: &CoreConfig) -> anyhow::Result<Self> {
        Ok(Self {
            gate: ToolGate::new(&config.allowed_tools, config.max_tool_calls_per_plan)?,
            sql_policy: config.sql_policy(),
        })
    }

    pub fn evaluate(&self, plan: &Plan) -> Result<Vec<PolicyDecision>, CoreError> {
        self.gate.check_plan(plan)?;
        Ok(plan
            .actions
            .iter()
            .map(|action| self.decide(action))
            .collect())
    }

    fn decide(&self, action: &PlanAction) -> PolicyDecision {
        if action.tool == SQL_TOOL {
            return self.decide_sql(action);
        }
        PolicyDecision {
            action: action.clone(),
            approved: true,
            sanitized_args: Some(action.args.clone()),
            errors: Vec::new(),
        }
    }

    fn decide_sql(&self, action: &PlanAction) -> PolicyDecision {
        let Some(sql) = action.args.get("sql").and_then(|v| v.as_str()) else {
            return PolicyDecision {
                action: action.clone(),
                approved: false,
                sanitized_args: None,
                errors: vec!["sql.query requires a string 'sql' argument".to_string()],
            };
        };
        let outcome = check_sql(sql, &self.sql_policy);
        if !outcome.valid {
            return PolicyDecision {
                action: action.clone(),
                approved: false,
                sanitized_args: None,
                errors: outcome.errors,
            };
        }
        let mut sanitized = action.args.clone();
        if let Some(sanitized_sql) = outcome.sanitized_sql {
            sanitized.insert("sql".to_string(), json!(sanitized_sql));
        }
        if let Some(limit) = outcome.effective_limit {
            sanitized.insert("maxRows".to_string(), json!(limit));
        }
        PolicyDecision {
            action: action.clone(),
            approved: true,
            sanitized_args: Some(sanitized),
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::{PolicyEngine, ToolGate};
    use crate::config::CoreConfig;
    use crate::error::CoreError;
    use crate::types::{Plan, PlanAction};

    fn action(tool: &str, args: serde_json::Value) -> PlanAction {
        let args = match args {
            serde_json::Value::Object(map) => map,
            _ => Map::new(),
        };
        PlanAction {
            tool: tool.to_string(),
            args,
            reason: None,
        }
    }

    fn plan_with(actions: Vec<PlanAction>) -> Plan {
        Plan {
            intent: "test".to_string(),
            actions,
            constraints: None,
            needs_clarification: false,
            clarification_question: None,
        }
    }

    fn engine() -> PolicyEngine {
        PolicyEngine::new(&CoreConfig::default()).expect("engine")
    }

    #[test]
    fn sql_action_gets_sanitized_sql_and_row_cap() {
        let plan = plan_with(vec![action(
            "sql.query",
            json!({"sql": "SELECT id FROM users"}),
        )]);
        let decisions = engine().evaluate(&plan).expect("decisions");
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].approved);
        let args = decisions[0].sanitized_args.as_ref().expect("args");
        assert_eq!(args["sql"], "SELECT id FROM users LIMIT 200");
        assert_eq!(args["maxRows"], 200);
    }

    #[test]
    fn write_statement_is_rejected_per_action() {
        let plan = plan_with(vec![action(
            "sql.query",
            json!({"sql": "UPDATE users SET x = 1"}),
        )]);
        let decisions = engine().evaluate(&plan).expect("decisions");
        assert!(!decisions[0].approved);
        assert!(decisions[0].errors[0].contains("SELECT"));
        assert!(decisions[0].sanitized_args.is_none());
    }

    #[test]
    fn sql_action_without_sql_arg_is_rejected() {
        let plan = plan_with(vec![action("sql.query", json!({}))]);
        let decisions = engine().evaluate(&plan).expect("decisions");
        assert!(!decisions[0].approved);
        assert!(decisions[0].errors[0].contains("'sql'"));
    }

    #[test]
    fn non_sql_tools_pass_args_through() {
        let plan = plan_with(vec![action("rag.search", json!({"query": "churn"}))]);
        let decisions = engine().evaluate(&plan).expect("decisions");
        assert!(decisions[0].approved);
        assert_eq!(
            decisions[0].sanitized_args.as_ref().expect("args")["query"],
            "churn"
        );
    }

    #[test]
    fn unlisted_tool_blocks_whole_plan() {
        let plan = plan_with(vec![action("shell.exec", json!({}))]);
        let err = engine().evaluate(&plan).expect_err("blocked");
        assert!(matches!(err, CoreError::PolicyBlocked { .. }));
        assert!(err.to_string().contains("shell.exec"));
    }

    #[test]
    fn action_cap_blocks_whole_plan() {
        let actions = (0..11)
            .map(|_| action("rag.search", json!({"query": "x"})))
            .collect();
        let err = engine().evaluate(&plan_with(actions)).expect_err("blocked");
        assert!(err.to_string().contains("cap"));
    }

    #[test]
    fn glob_patterns_match_tool_families() {
        let gate = ToolGate::new(&["sql.*".to_string()], 10).expect("gate");
        assert!(gate.tool_allowed("sql.query"));
        assert!(!gate.tool_allowed("rag.search"));
    }

    #[test]
    fn empty_allowlist_is_permissive() {
        let gate = ToolGate::new(&[], 10).expect("gate");
        assert!(gate.tool_allowed("anything.at.all"));
    }
}
