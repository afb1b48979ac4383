//! The five-stage coordinator: plan, gate, execute, verify, answer. One
//! orchestration task per request, strictly sequential stages, every outcome
//! delivered as ordered stream events ending in exactly one `done`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::answer::AnswerGenerator;
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::events::{emit_or_cancelled, ChannelSink, EventSink, Stage, StreamEvent};
use crate::planner::Planner;
use crate::policy::PolicyEngine;
use crate::providers::LlmAdapter;
use crate::runtime::{blocked_tool_call, ConnectorRegistry, ToolRuntime};
use crate::schema::validate_user_message;
use crate::store::{now_rfc3339, EvidenceStore, MessageRecord};
use crate::types::{Answer, RunContext};
use crate::verifier::{verify, verify_or_throw};

pub struct Pipeline {
    adapter: Arc<dyn LlmAdapter>,
    planner: Planner,
    policy: PolicyEngine,
    runtime: ToolRuntime,
    store: Arc<dyn EvidenceStore>,
    allowed_tools: Vec<String>,
}

impl Pipeline {
    pub fn new(
        config: CoreConfig,
        adapter: Arc<dyn LlmAdapter>,
        registry: ConnectorRegistry,
        store: Arc<dyn EvidenceStore>,
    ) -> anyhow::Result<Self> {
        let policy = PolicyEngine::new(&config)?;
        let planner = Planner::new(config.planner_temperature, config.planner_max_retries);
        let runtime = ToolRuntime::new(
            registry,
            store.clone(),
            config.tool_timeout_ms,
            config.max_rows,
        );
        Ok(Self {
            adapter,
            planner,
            policy,
            runtime,
            store,
            allowed_tools: config.allowed_tools,
        })
    }

    /// Run one request to completion. Failures become `error` then `done`
    /// events; nothing is raised past this point.
    pub async fn run(&self, ctx: &RunContext, cancel: &CancellationToken, sink: &mut dyn EventSink) {
        if let Err(message) = validate_user_message(&ctx.user_message) {
            let _ = sink
                .emit(StreamEvent::Error {
                    message,
                    stage: None,
                    code: None,
                })
                .await;
            let _ = sink.emit(StreamEvent::Done).await;
            return;
        }
        if let Err((error, stage)) = self.drive(ctx, cancel, sink).await {
            let _ = sink
                .emit(StreamEvent::Error {
                    message: error.to_string(),
                    stage,
                    code: Some(error.code().to_string()),
                })
                .await;
            let _ = sink.emit(StreamEvent::Done).await;
        }
    }

    /// Spawn the run on its own task and hand back the consumer end of the
    /// stream. Back-pressure from the receiver suspends the producer.
    pub fn run_streaming(
        self: &Arc<Self>,
        ctx: RunContext,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(32);
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let mut sink = ChannelSink::new(tx);
            pipeline.run(&ctx, &cancel, &mut sink).await;
        });
        rx
    }

    async fn drive(
        &self,
        ctx: &RunContext,
        cancel: &CancellationToken,
        sink: &mut dyn EventSink,
    ) -> Result<(), (CoreError, Option<Stage>)> {
        let system_context = self.system_context(ctx);

        emit_or_cancelled(
            sink,
            StreamEvent::Meta {
                thread_id: ctx.thread_id.clone(),
                message_id: ctx.message_id.clone(),
            },
        )
        .await
        .map_err(at(Stage::Planning))?;

        emit_or_cancelled(
            sink,
            StreamEvent::Status {
                stage: Stage::Planning,
            },
        )
        .await
        .map_err(at(Stage::Planning))?;
        let plan = self
            .planner
            .plan(
                self.adapter.as_ref(),
                ctx,
                &self.allowed_tools,
                &system_context,
                cancel,
            )
            .await
            .map_err(at(Stage::Planning))?;
        emit_or_cancelled(sink, StreamEvent::Plan(plan.clone()))
            .await
            .map_err(at(Stage::Planning))?;

        if plan.needs_clarification {
            let question = plan
                .clarification_question
                .clone()
                .unwrap_or_else(|| "Could you clarify the question?".to_string());
            let answer = Answer {
                content: question,
                citations: Vec::new(),
                follow_ups: None,
            };
            self.persist_answer(ctx, &answer).await;
            emit_or_cancelled(sink, StreamEvent::Answer(answer))
                .await
                .map_err(at(Stage::Planning))?;
            emit_or_cancelled(sink, StreamEvent::Done)
                .await
                .map_err(at(Stage::Planning))?;
            return Ok(());
        }

        emit_or_cancelled(
            sink,
            StreamEvent::Status {
                stage: Stage::Policy,
            },
        )
        .await
        .map_err(at(Stage::Policy))?;
        let decisions = self.policy.evaluate(&plan).map_err(at(Stage::Policy))?;
        for decision in decisions.iter().filter(|d| !d.approved) {
            let record = blocked_tool_call(decision, ctx);
            if let Err(e) = self.store.insert_tool_call(&record).await {
                tracing::warn!("failed to persist blocked tool call: {e}");
            }
        }
        if !decisions.iter().any(|d| d.approved) {
            let reason = decisions
                .iter()
                .flat_map(|d| d.errors.iter().cloned())
                .collect::<Vec<_>>()
                .join("; ");
            return Err((
                CoreError::PolicyBlocked {
                    reason: if reason.is_empty() {
                        "no action was approved".to_string()
                    } else {
                        reason
                    },
                },
                Some(Stage::Policy),
            ));
        }

        let results = self
            .runtime
            .execute_actions(&decisions, ctx, cancel, sink)
            .await
            .map_err(at(Stage::ToolsRunning))?;

        emit_or_cancelled(
            sink,
            StreamEvent::Status {
                stage: Stage::Verifying,
            },
        )
        .await
        .map_err(at(Stage::Verifying))?;
        let report = verify(&results, &ctx.user_message);
        emit_or_cancelled(sink, StreamEvent::Verification(report.clone()))
            .await
            .map_err(at(Stage::Verifying))?;
        verify_or_throw(&results).map_err(at(Stage::Verifying))?;

        emit_or_cancelled(
            sink,
            StreamEvent::Status {
                stage: Stage::Answering,
            },
        )
        .await
        .map_err(at(Stage::Answering))?;
        let answer = AnswerGenerator::generate(
            self.adapter.as_ref(),
            ctx,
            &results,
            &report,
            &system_context,
            cancel,
            sink,
        )
        .await
        .map_err(at(Stage::Answering))?;
        self.persist_answer(ctx, &answer).await;
        emit_or_cancelled(sink, StreamEvent::Answer(answer))
            .await
            .map_err(at(Stage::Answering))?;
        emit_or_cancelled(sink, StreamEvent::Done)
            .await
            .map_err(at(Stage::Answering))?;
        Ok(())
    }

    fn system_context(&self, ctx: &RunContext) -> String {
        let sources = if ctx.allowed_sources.is_empty() {
            "all".to_string()
        } else {
            ctx.allowed_sources.join(", ")
        };
        format!(
            "Workspace: {}. Accessible sources: {}.",
            ctx.workspace_id, sources
        )
    }

    async fn persist_answer(&self, ctx: &RunContext, answer: &Answer) {
        let record = MessageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: ctx.thread_id.clone(),
            workspace_id: ctx.workspace_id.clone(),
            role: "assistant".to_string(),
            content: answer.content.clone(),
            citations: answer.citations.clone(),
            created_at: now_rfc3339(),
        };
        if let Err(e) = self.store.insert_message(&record).await {
            tracing::warn!("failed to persist answer message: {e}");
        }
    }
}

fn at(stage: Stage) -> impl Fn(CoreError) -> (CoreError, Option<Stage>) {
    move |error| (error, Some(stage))
}
