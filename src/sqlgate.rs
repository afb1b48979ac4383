//! AST-based safety gate for candidate SQL. Parsing is the primary gate; the
//! forbidden-function text scan is a layered check on top of it. Every query
//! leaves this module with an enforced LIMIT.

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use sqlparser::ast::{Expr, ObjectName, Query, SetExpr, Statement, Value as SqlValue, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::config::SqlPolicyConfig;
use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct SqlCheckOutcome {
    pub valid: bool,
    pub sanitized_sql: Option<String>,
    pub effective_limit: Option<i64>,
    pub referenced_tables: Vec<String>,
    pub errors: Vec<String>,
}

impl SqlCheckOutcome {
    fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            sanitized_sql: None,
            effective_limit: None,
            referenced_tables: Vec::new(),
            errors,
        }
    }
}

/// Collects base-table references across the whole statement, skipping CTE
/// names (a CTE reference is not a base table).
#[derive(Default)]
struct RelationCollector {
    tables: BTreeSet<String>,
    ctes: BTreeSet<String>,
}

impl Visitor for RelationCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        let name = relation
            .0
            .iter()
            .map(|ident| ident.value.clone())
            .collect::<Vec<_>>()
            .join(".");
        if !(relation.0.len() == 1 && self.ctes.contains(&name.to_lowercase())) {
            self.tables.insert(name);
        }
        ControlFlow::Continue(())
    }
}

fn body_is_select(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(_) => true,
        SetExpr::Query(inner) => body_is_select(&inner.body),
        SetExpr::SetOperation { left, right, .. } => body_is_select(left) && body_is_select(right),
        _ => false,
    }
}

fn table_allowed(name: &str, allowed: &[String]) -> bool {
    let lower = name.to_lowercase();
    let last = lower.rsplit('.').next().unwrap_or(&lower).to_string();
    allowed
        .iter()
        .any(|a| a.to_lowercase() == lower || a.to_lowercase() == last)
}

fn strip_trailing_semicolons(sql: &str) -> &str {
    sql.trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Run the full gate over one candidate query.
pub fn check_sql(sql: &str, config: &SqlPolicyConfig) -> SqlCheckOutcome {
    let dialect = PostgreSqlDialect {};
    let mut statements = match Parser::parse_sql(&dialect, sql) {
        Ok(statements) => statements,
        Err(e) => return SqlCheckOutcome::invalid(vec![format!("SQL parse error: {e}")]),
    };
    if statements.is_empty() {
        return SqlCheckOutcome::invalid(vec!["Empty SQL statement".to_string()]);
    }
    if statements.len() > 1 {
        return SqlCheckOutcome::invalid(vec![
            "Multiple statements are not allowed".to_string()
        ]);
    }
    let mut statement = statements.remove(0);

    let is_select = matches!(&statement, Statement::Query(q) if body_is_select(&q.body));
    if !is_select {
        return SqlCheckOutcome::invalid(vec![
            "Only SELECT statements are allowed".to_string()
        ]);
    }

    let mut collector = RelationCollector::default();
    let _ = statement.visit(&mut collector);
    let referenced_tables: Vec<String> = collector.tables.into_iter().collect();

    let mut errors = Vec::new();
    if config.allowed_tables.is_empty() {
        tracing::warn!("sql table allowlist is empty; all tables permitted");
    } else {
        for table in &referenced_tables {
            if !table_allowed(table, &config.allowed_tables) {
                errors.push(format!("Table '{table}' is not in the allowed tables list"));
            }
        }
    }

    let lower_sql = sql.to_lowercase();
    for forbidden in &config.forbidden_functions {
        if !forbidden.is_empty() && lower_sql.contains(&forbidden.to_lowercase()) {
            errors.push(format!("Forbidden function reference: {forbidden}"));
        }
    }

    let (sanitized_sql, effective_limit) =
        enforce_limit(sql, &mut statement, config.max_rows);

    if errors.is_empty() {
        SqlCheckOutcome {
            valid: true,
            sanitized_sql: Some(sanitized_sql),
            effective_limit: Some(effective_limit),
            referenced_tables,
            errors,
        }
    } else {
        SqlCheckOutcome {
            valid: false,
            sanitized_sql: None,
            effective_limit: None,
            referenced_tables,
            errors,
        }
    }
}

/// LIMIT is always enforced; the gate never lets an unbounded query through.
///
/// - no LIMIT: append ` LIMIT max_rows` to the original text;
/// - literal `LIMIT n`: rewrite in place to `min(n, max_rows)`;
/// - non-literal LIMIT: nest the original as a bounded subquery.
fn enforce_limit(original: &str, statement: &mut Statement, max_rows: i64) -> (String, i64) {
    enum LimitClause {
        Absent,
        Literal(i64),
        NonLiteral,
    }

    let stripped = strip_trailing_semicolons(original);
    let clause = match statement {
        Statement::Query(query) => match query.limit.as_ref() {
            None => LimitClause::Absent,
            Some(Expr::Value(SqlValue::Number(n, _))) => match n.parse::<i64>() {
                Ok(n) => LimitClause::Literal(n),
                Err(_) => LimitClause::NonLiteral,
            },
            Some(_) => LimitClause::NonLiteral,
        },
        _ => LimitClause::Absent,
    };
    match clause {
        LimitClause::Absent => (format!("{stripped} LIMIT {max_rows}"), max_rows),
        LimitClause::Literal(n) => {
            let effective = n.min(max_rows);
            if let Statement::Query(query) = statement {
                query.limit = Some(Expr::Value(SqlValue::Number(effective.to_string(), false)));
            }
            (statement.to_string(), effective)
        }
        LimitClause::NonLiteral => (
            format!("SELECT * FROM ({stripped}) AS limited LIMIT {max_rows}"),
            max_rows,
        ),
    }
}

/// Last-line assertion before dispatch: whatever reaches a connector must be
/// a single SELECT carrying a literal LIMIT. Sanitized output of `check_sql`
/// always satisfies this; anything else was tampered with or bypassed the
/// gate.
pub fn ensure_dispatchable(sql: &str) -> Result<(), CoreError> {
    let dialect = PostgreSqlDialect {};
    let statements = Parser::parse_sql(&dialect, sql).map_err(|e| CoreError::SqlSafety {
        reason: format!("SQL parse error: {e}"),
    })?;
    if statements.len() != 1 {
        return Err(CoreError::SqlSafety {
            reason: "expected exactly one statement".to_string(),
        });
    }
    let Statement::Query(query) = &statements[0] else {
        return Err(CoreError::SqlSafety {
            reason: "only SELECT statements may be dispatched".to_string(),
        });
    };
    if !body_is_select(&query.body) {
        return Err(CoreError::SqlSafety {
            reason: "only SELECT statements may be dispatched".to_string(),
        });
    }
    match query.limit.as_ref() {
        Some(Expr::Value(SqlValue::Number(_, _))) => Ok(()),
        _ => Err(CoreError::SqlSafety {
            reason: "dispatched SQL must carry a literal LIMIT".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{check_sql, ensure_dispatchable};
    use crate::config::SqlPolicyConfig;

    fn policy(max_rows: i64, allowed_tables: &[&str]) -> SqlPolicyConfig {
        SqlPolicyConfig {
            max_rows,
            allowed_tables: allowed_tables.iter().map(|s| s.to_string()).collect(),
            ..SqlPolicyConfig::default()
        }
    }

    #[test]
    fn injects_limit_when_absent() {
        let outcome = check_sql("SELECT id FROM users", &policy(100, &[]));
        assert!(outcome.valid);
        assert_eq!(
            outcome.sanitized_sql.as_deref(),
            Some("SELECT id FROM users LIMIT 100")
        );
        assert_eq!(outcome.effective_limit, Some(100));
    }

    #[test]
    fn strips_trailing_semicolon_before_injecting() {
        let outcome = check_sql("SELECT id FROM users;", &policy(100, &[]));
        assert_eq!(
            outcome.sanitized_sql.as_deref(),
            Some("SELECT id FROM users LIMIT 100")
        );
    }

    #[test]
    fn clamps_literal_limit_above_ceiling() {
        let outcome = check_sql("SELECT id FROM users LIMIT 101", &policy(100, &[]));
        assert!(outcome.valid);
        assert_eq!(outcome.effective_limit, Some(100));
        assert!(outcome
            .sanitized_sql
            .as_deref()
            .expect("sanitized")
            .contains("LIMIT 100"));
    }

    #[test]
    fn keeps_literal_limit_below_ceiling() {
        let outcome = check_sql("SELECT id FROM users LIMIT 5", &policy(100, &[]));
        assert_eq!(outcome.effective_limit, Some(5));
    }

    #[test]
    fn limit_zero_is_accepted() {
        let outcome = check_sql("SELECT id FROM users LIMIT 0", &policy(100, &[]));
        assert!(outcome.valid);
        assert_eq!(outcome.effective_limit, Some(0));
    }

    #[test]
    fn non_literal_limit_is_nested_and_bounded() {
        let outcome = check_sql("SELECT id FROM users LIMIT 1 + 1", &policy(100, &[]));
        assert!(outcome.valid);
        let sanitized = outcome.sanitized_sql.expect("sanitized");
        assert!(sanitized.starts_with("SELECT * FROM ("));
        assert!(sanitized.ends_with("LIMIT 100"));
        assert_eq!(outcome.effective_limit, Some(100));
    }

    #[test]
    fn rejects_non_select() {
        let outcome = check_sql("UPDATE users SET x = 1", &policy(100, &[]));
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("SELECT"));
        assert!(outcome.sanitized_sql.is_none());
    }

    #[test]
    fn rejects_multiple_statements() {
        let outcome = check_sql("SELECT 1; SELECT 2", &policy(100, &[]));
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("Multiple statements"));
    }

    #[test]
    fn rejects_unparseable_sql() {
        let outcome = check_sql("SELEKT id FROM users", &policy(100, &[]));
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("parse error"));
    }

    #[test]
    fn collects_tables_from_joins_and_subqueries() {
        let outcome = check_sql(
            "SELECT u.id FROM (SELECT id FROM users) AS u JOIN orders AS o ON o.user_id = u.id",
            &policy(100, &["users", "orders"]),
        );
        assert!(outcome.valid, "errors: {:?}", outcome.errors);
        assert_eq!(outcome.referenced_tables, vec!["orders", "users"]);
    }

    #[test]
    fn cte_names_are_not_base_tables() {
        let outcome = check_sql(
            "WITH recent AS (SELECT * FROM events) SELECT * FROM recent",
            &policy(100, &["events"]),
        );
        assert!(outcome.valid, "errors: {:?}", outcome.errors);
        assert_eq!(outcome.referenced_tables, vec!["events"]);
    }

    #[test]
    fn allowlist_rejects_unknown_table() {
        let outcome = check_sql("SELECT * FROM secrets", &policy(100, &["users"]));
        assert!(!outcome.valid);
        assert!(outcome.errors[0].contains("'secrets'"));
    }

    #[test]
    fn allowlist_accepts_schema_qualified_names() {
        let outcome = check_sql("SELECT * FROM public.users", &policy(100, &["users"]));
        assert!(outcome.valid, "errors: {:?}", outcome.errors);
    }

    #[test]
    fn empty_allowlist_is_permissive() {
        let outcome = check_sql("SELECT * FROM anything_at_all", &policy(100, &[]));
        assert!(outcome.valid);
    }

    #[test]
    fn forbidden_function_scan_is_case_insensitive() {
        let outcome = check_sql("SELECT PG_SLEEP(10)", &policy(100, &[]));
        assert!(!outcome.valid);
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.contains("pg_sleep")));
    }

    #[test]
    fn sanitized_output_is_always_dispatchable() {
        for sql in [
            "SELECT id FROM users",
            "SELECT id FROM users LIMIT 7",
            "SELECT id FROM users LIMIT 1 + 1",
        ] {
            let outcome = check_sql(sql, &policy(100, &[]));
            let sanitized = outcome.sanitized_sql.expect("sanitized");
            ensure_dispatchable(&sanitized).expect("dispatchable");
        }
    }

    #[test]
    fn unbounded_or_mutating_sql_is_not_dispatchable() {
        let err = ensure_dispatchable("SELECT id FROM users").expect_err("unbounded");
        assert_eq!(err.code(), "SQL_SAFETY_ERROR");
        assert!(ensure_dispatchable("DELETE FROM users LIMIT 1").is_err());
    }
}
