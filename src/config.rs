use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ROWS: i64 = 200;
pub const DEFAULT_TOOL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PLANNER_TEMPERATURE: f32 = 0.1;
pub const DEFAULT_PLANNER_MAX_RETRIES: u32 = 2;
pub const DEFAULT_MAX_TOOL_CALLS_PER_PLAN: usize = 10;

/// Policy input for the SQL safety gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SqlPolicyConfig {
    pub max_rows: i64,
    /// Empty means permissive; the gate logs that concession.
    pub allowed_tables: Vec<String>,
    pub allowed_columns: Vec<String>,
    /// Case-insensitive substring blocklist over the raw SQL text. Layered on
    /// top of AST inspection, never a replacement for it.
    pub forbidden_functions: Vec<String>,
}

impl Default for SqlPolicyConfig {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            allowed_tables: Vec::new(),
            allowed_columns: Vec::new(),
            forbidden_functions: default_forbidden_functions(),
        }
    }
}

pub fn default_forbidden_functions() -> Vec<String> {
    [
        "pg_sleep",
        "dblink",
        "pg_read_file",
        "pg_read_binary_file",
        "pg_ls_dir",
        "pg_stat_file",
        "lo_import",
        "lo_export",
        "set_config",
        "pg_reload_conf",
        "pg_terminate_backend",
        "pg_cancel_backend",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_allowed_tools() -> Vec<String> {
    vec!["sql.query".to_string(), "rag.search".to_string()]
}

/// Recognized options for the whole pipeline, loadable from YAML with every
/// field defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub max_rows: i64,
    pub allowed_tables: Vec<String>,
    /// Exact tool names or glob patterns. Empty means permissive.
    pub allowed_tools: Vec<String>,
    pub tool_timeout_ms: u64,
    pub planner_temperature: f32,
    pub planner_max_retries: u32,
    pub forbidden_functions: Vec<String>,
    pub max_tool_calls_per_plan: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            allowed_tables: Vec::new(),
            allowed_tools: default_allowed_tools(),
            tool_timeout_ms: DEFAULT_TOOL_TIMEOUT_MS,
            planner_temperature: DEFAULT_PLANNER_TEMPERATURE,
            planner_max_retries: DEFAULT_PLANNER_MAX_RETRIES,
            forbidden_functions: default_forbidden_functions(),
            max_tool_calls_per_plan: DEFAULT_MAX_TOOL_CALLS_PER_PLAN,
        }
    }
}

impl CoreConfig {
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("failed to parse config YAML")
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn sql_policy(&self) -> SqlPolicyConfig {
        SqlPolicyConfig {
            max_rows: self.max_rows,
            allowed_tables: self.allowed_tables.clone(),
            allowed_columns: Vec::new(),
            forbidden_functions: self.forbidden_functions.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CoreConfig;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.max_rows, 200);
        assert_eq!(config.tool_timeout_ms, 30_000);
        assert_eq!(config.planner_max_retries, 2);
        assert_eq!(config.max_tool_calls_per_plan, 10);
        assert_eq!(config.allowed_tools, vec!["sql.query", "rag.search"]);
        assert!(config
            .forbidden_functions
            .iter()
            .any(|f| f == "pg_sleep"));
    }

    #[test]
    fn yaml_overrides_partial_fields() {
        let config = CoreConfig::from_yaml(
            r#"
maxRows: 50
allowedTables: ["users", "workspaces"]
"#,
        )
        .expect("parse");
        assert_eq!(config.max_rows, 50);
        assert_eq!(config.allowed_tables.len(), 2);
        assert_eq!(config.tool_timeout_ms, 30_000);
    }

    #[test]
    fn sql_policy_inherits_row_ceiling() {
        let mut config = CoreConfig::default();
        config.max_rows = 17;
        assert_eq!(config.sql_policy().max_rows, 17);
    }
}
