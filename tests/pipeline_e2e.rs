use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use groundline::connectors::StaticSqlConnector;
use groundline::events::{StreamEvent, VecSink};
use groundline::providers::mock::MockLlm;
use groundline::runtime::ConnectorRegistry;
use groundline::store::NullEvidenceStore;
use groundline::types::RunContext;
use groundline::{CoreConfig, Pipeline};

fn ctx(user_message: &str) -> RunContext {
    RunContext {
        workspace_id: "w1".to_string(),
        thread_id: "t1".to_string(),
        message_id: "m1".to_string(),
        user_message: user_message.to_string(),
        allowed_sources: Vec::new(),
    }
}

fn sql_plan(sql: &str) -> Value {
    json!({
        "intent": "query the database",
        "actions": [{"tool": "sql.query", "args": {"sql": sql}}],
        "needsClarification": false
    })
}

fn build(adapter: MockLlm, sql: StaticSqlConnector, config: CoreConfig) -> Pipeline {
    let mut registry = ConnectorRegistry::new();
    registry.register_sql(Arc::new(sql), config.max_rows);
    Pipeline::new(config, Arc::new(adapter), registry, Arc::new(NullEvidenceStore))
        .expect("pipeline")
}

async fn run(pipeline: &Pipeline, ctx: &RunContext) -> VecSink {
    let mut sink = VecSink::new();
    pipeline.run(ctx, &CancellationToken::new(), &mut sink).await;
    sink
}

fn find_answer(sink: &VecSink) -> &groundline::types::Answer {
    sink.events
        .iter()
        .find_map(|e| match e {
            StreamEvent::Answer(answer) => Some(answer),
            _ => None,
        })
        .expect("answer event")
}

#[tokio::test]
async fn happy_path_single_sql_query() {
    let adapter = MockLlm::new()
        .with_plan(sql_plan("SELECT COUNT(*) FROM workspaces"))
        .with_grounded_answer("There are 2 workspaces [1].");
    let connector = StaticSqlConnector::new().with_rows(&["count"], vec![json!({"count": 2})]);
    let pipeline = build(adapter, connector, CoreConfig::default());

    let sink = run(&pipeline, &ctx("How many workspaces are there?")).await;
    assert_eq!(
        sink.tags(),
        vec![
            "meta",
            "status",
            "plan",
            "status",
            "status",
            "tool_call_start",
            "tool_call_end",
            "status",
            "verification",
            "status",
            "answer",
            "done",
        ]
    );

    let StreamEvent::Verification(report) = &sink.events[8] else {
        panic!("expected verification event");
    };
    assert!(report.approved);

    let answer = find_answer(&sink);
    assert_eq!(answer.citations.len(), 1);
    assert_eq!(
        answer.citations[0].evidence_type,
        groundline::types::EvidenceType::ToolResult
    );

    let starts = sink
        .events
        .iter()
        .filter(|e| matches!(e, StreamEvent::ToolCallStart { .. }))
        .count();
    let ends = sink
        .events
        .iter()
        .filter(|e| matches!(e, StreamEvent::ToolCallEnd { .. }))
        .count();
    assert_eq!((starts, ends), (1, 1));
}

#[tokio::test]
async fn limit_is_injected_into_dispatched_sql() {
    let mut config = CoreConfig::default();
    config.max_rows = 100;
    let adapter = MockLlm::new()
        .with_plan(sql_plan("SELECT id FROM users"))
        .with_grounded_answer("Found users [1].");
    let connector = StaticSqlConnector::new().with_rows(&["id"], vec![json!({"id": 1})]);
    let pipeline = build(adapter, connector, config);

    let sink = run(&pipeline, &ctx("List user ids")).await;
    let dispatched = sink
        .events
        .iter()
        .find_map(|e| match e {
            StreamEvent::ToolCallStart { args, .. } => args.get("sql").and_then(|v| v.as_str()),
            _ => None,
        })
        .expect("tool_call_start args");
    assert_eq!(dispatched, "SELECT id FROM users LIMIT 100");
}

#[tokio::test]
async fn blocked_write_statement_terminates_with_policy_error() {
    let adapter = MockLlm::new().with_plan(sql_plan("UPDATE users SET x = 1"));
    let pipeline = build(adapter, StaticSqlConnector::new(), CoreConfig::default());

    let sink = run(&pipeline, &ctx("Set x to 1")).await;
    assert_eq!(
        sink.tags(),
        vec!["meta", "status", "plan", "status", "error", "done"]
    );
    let StreamEvent::Error { message, code, .. } = &sink.events[4] else {
        panic!("expected error event");
    };
    assert_eq!(code.as_deref(), Some("POLICY_BLOCKED"));
    assert!(message.contains("SELECT"));
}

#[tokio::test]
async fn compound_plan_survives_one_failing_action() {
    // rag.search is allowlisted but no connector is registered for it.
    let adapter = MockLlm::new()
        .with_plan(json!({
            "intent": "query and search",
            "actions": [
                {"tool": "sql.query", "args": {"sql": "SELECT COUNT(*) FROM workspaces"}},
                {"tool": "rag.search", "args": {"query": "workspace notes"}}
            ],
            "needsClarification": false
        }))
        .with_grounded_answer("There are 2 workspaces [1].");
    let connector = StaticSqlConnector::new().with_rows(&["count"], vec![json!({"count": 2})]);
    let pipeline = build(adapter, connector, CoreConfig::default());

    let sink = run(&pipeline, &ctx("How many workspaces, and any notes?")).await;

    let end_statuses: Vec<String> = sink
        .events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ToolCallEnd { status, .. } => Some(status.as_str().to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(end_statuses, vec!["success", "error"]);

    let report = sink
        .events
        .iter()
        .find_map(|e| match e {
            StreamEvent::Verification(report) => Some(report),
            _ => None,
        })
        .expect("verification event");
    assert!(report.approved, "coverage is met by the sql success");

    let answer = find_answer(&sink);
    assert_eq!(answer.citations.len(), 1);
    assert_eq!(sink.tags().last(), Some(&"done"));
}

#[tokio::test]
async fn all_tools_failing_ends_with_verification_error() {
    let adapter = MockLlm::new().with_plan(sql_plan("SELECT COUNT(*) FROM workspaces"));
    let connector = StaticSqlConnector::new().with_error("connection refused");
    let pipeline = build(adapter, connector, CoreConfig::default());

    let sink = run(&pipeline, &ctx("How many workspaces?")).await;
    let tags = sink.tags();
    assert_eq!(
        tags[tags.len() - 3..].to_vec(),
        vec!["verification", "error", "done"]
    );

    let report = sink
        .events
        .iter()
        .find_map(|e| match e {
            StreamEvent::Verification(report) => Some(report),
            _ => None,
        })
        .expect("verification event");
    assert!(!report.approved);

    let StreamEvent::Error { code, .. } = &sink.events[tags.len() - 2] else {
        panic!("expected error event");
    };
    assert_eq!(code.as_deref(), Some("VERIFICATION_ERROR"));
}

#[tokio::test]
async fn clarification_short_circuits_policy_and_tools() {
    let adapter = MockLlm::new().with_plan(json!({
        "intent": "ambiguous",
        "actions": [],
        "needsClarification": true,
        "clarificationQuestion": "Which workspace?"
    }));
    let pipeline = build(adapter, StaticSqlConnector::new(), CoreConfig::default());

    let sink = run(&pipeline, &ctx("How many rows in it?")).await;
    assert_eq!(sink.tags(), vec!["meta", "status", "plan", "answer", "done"]);
    let answer = find_answer(&sink);
    assert_eq!(answer.content, "Which workspace?");
    assert!(answer.citations.is_empty());
}

#[tokio::test]
async fn done_is_emitted_exactly_once_and_last() {
    let adapter = MockLlm::new()
        .with_plan(sql_plan("SELECT COUNT(*) FROM workspaces"))
        .with_grounded_answer("There are 2 [1].");
    let connector = StaticSqlConnector::new().with_rows(&["count"], vec![json!({"count": 2})]);
    let pipeline = build(adapter, connector, CoreConfig::default());

    let sink = run(&pipeline, &ctx("How many?")).await;
    let tags = sink.tags();
    assert_eq!(tags.iter().filter(|t| **t == "done").count(), 1);
    assert_eq!(tags.last(), Some(&"done"));
}

#[tokio::test]
async fn streaming_tokens_precede_the_answer() {
    let adapter = MockLlm::new()
        .with_plan(sql_plan("SELECT COUNT(*) FROM workspaces"))
        .with_stream(&["There ", "are ", "2 [1]."])
        .with_grounded_answer("There are 2 [1].");
    let connector = StaticSqlConnector::new().with_rows(&["count"], vec![json!({"count": 2})]);
    let pipeline = build(adapter, connector, CoreConfig::default());

    let sink = run(&pipeline, &ctx("How many?")).await;
    let tags = sink.tags();
    let token_count = tags.iter().filter(|t| **t == "token").count();
    assert_eq!(token_count, 3);
    let first_token = tags.iter().position(|t| *t == "token").expect("token");
    let answer_pos = tags.iter().position(|t| *t == "answer").expect("answer");
    assert!(first_token < answer_pos);
}
