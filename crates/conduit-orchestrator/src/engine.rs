use crate::progress::ProgressReporter;
use crate::types::{
    PipelineConfig, StageFailure, StageResult, StageStatus, WorkflowOutcome, WorkflowStage,
    WorkflowState,
};
use conduit_cache::{CacheRequest, SemanticCache};
use conduit_core::{ConduitError, ReplyShape};
use conduit_resilience::Deadline;
use conduit_transport::AgentInvoker;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const WORKFLOW_SCOPE: &str = "workflow";

/// Drives the understand → retrieve → visualize workflow.
///
/// Retries and transport fallback live below the [`AgentInvoker`] seam; a
/// stage failure here is always terminal for the workflow.
pub struct Orchestrator {
    invoker: Arc<dyn AgentInvoker>,
    cache: Arc<SemanticCache>,
    progress: Arc<ProgressReporter>,
    config: PipelineConfig,
}

impl Orchestrator {
    /// Wire an orchestrator to its invoker, cache and progress channel.
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        cache: Arc<SemanticCache>,
        progress: Arc<ProgressReporter>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            invoker,
            cache,
            progress,
            config,
        }
    }

    /// The channel observers subscribe to.
    pub fn progress(&self) -> &Arc<ProgressReporter> {
        &self.progress
    }

    /// The shared response cache.
    pub fn cache(&self) -> &Arc<SemanticCache> {
        &self.cache
    }

    /// Stage bindings and limits in effect.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run a workflow to completion.
    pub async fn run(&self, query: &str) -> WorkflowOutcome {
        self.run_with_cancel(query, CancellationToken::new()).await
    }

    /// Run a workflow, stopping at the current stage once `cancel` fires.
    ///
    /// The in-flight agent call is abandoned, not recalled.
    pub async fn run_with_cancel(&self, query: &str, cancel: CancellationToken) -> WorkflowOutcome {
        let started = Instant::now();
        let mut state = WorkflowState::new(query.trim());
        let workflow_id = state.workflow_id;
        info!(workflow_id = %workflow_id, query = %state.query, "Workflow started");

        if state.query.is_empty() {
            let failure = StageFailure::new(
                WorkflowStage::Understanding,
                &ConduitError::Validation("query must not be empty".into()),
                Vec::new(),
            );
            self.progress.emit(
                workflow_id,
                WorkflowStage::Understanding,
                StageStatus::Failed,
                failure.detail(),
            );
            return self.finish(state, WorkflowStage::Failed, Some(failure), started);
        }

        if self.config.cache_workflows {
            if let Some(outcome) = self.cached_workflow(&state, started).await {
                return outcome;
            }
        }

        let deadline = Deadline::after(Duration::from_millis(self.config.workflow_timeout_ms));

        for stage in WorkflowStage::PIPELINE {
            state.stage = stage;
            if cancel.is_cancelled() {
                return self.cancelled(state, stage, started);
            }

            self.progress
                .emit(workflow_id, stage, StageStatus::Started, Value::Null);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.run_stage(&state, stage, deadline) => Some(result),
            };

            match result {
                None => return self.cancelled(state, stage, started),
                Some(Ok(result)) => {
                    self.progress.emit(
                        workflow_id,
                        stage,
                        StageStatus::Completed,
                        json!({
                            "agent": result.agent,
                            "transport": result.transport,
                            "degraded": result.degraded,
                            "cached": result.cached,
                            "elapsed_ms": result.elapsed_ms,
                        }),
                    );
                    state.results.push(result);
                }
                Some(Err(failure)) => {
                    warn!(
                        workflow_id = %workflow_id,
                        stage = %stage,
                        error_type = %failure.error_type,
                        message = %failure.message,
                        "Stage failed"
                    );
                    self.progress
                        .emit(workflow_id, stage, StageStatus::Failed, failure.detail());
                    return self.finish(state, WorkflowStage::Failed, Some(failure), started);
                }
            }
        }

        self.progress.emit(
            workflow_id,
            WorkflowStage::Done,
            StageStatus::Completed,
            json!({ "cached": false, "transports": state.transports_used() }),
        );
        let outcome = self.finish(state, WorkflowStage::Done, None, started);
        if self.config.cache_workflows {
            self.store_workflow(&outcome).await;
        }
        outcome
    }

    async fn run_stage(
        &self,
        state: &WorkflowState,
        stage: WorkflowStage,
        deadline: Deadline,
    ) -> Result<StageResult, StageFailure> {
        let binding = self.config.binding(stage).ok_or_else(|| {
            StageFailure::new(
                stage,
                &ConduitError::Config(format!("no agent bound to stage '{stage}'")),
                Vec::new(),
            )
        })?;
        let stage_started = Instant::now();
        let input = stage_input(stage, state);
        let cache_request = CacheRequest::verbatim(
            format!("stage:{stage}"),
            format!("{}/{}:{input}", binding.agent, binding.capability),
        );

        if self.config.cache_stages {
            if let Some(hit) = self.cache.lookup(&cache_request).await {
                return Ok(StageResult {
                    stage,
                    agent: binding.agent.clone(),
                    capability: binding.capability.clone(),
                    output: hit.payload().clone(),
                    transport: None,
                    attempted: Vec::new(),
                    degraded: false,
                    cached: true,
                    elapsed_ms: stage_started.elapsed().as_millis() as u64,
                });
            }
        }

        if deadline.is_expired() {
            return Err(StageFailure::new(
                stage,
                &ConduitError::Timeout(format!(
                    "workflow budget of {}ms exhausted before '{stage}'",
                    self.config.workflow_timeout_ms
                )),
                Vec::new(),
            ));
        }

        let invocation = self
            .invoker
            .invoke(&binding.agent, &binding.capability, input, Some(deadline))
            .await
            .map_err(|f| StageFailure::new(stage, &f.error, f.attempted))?;

        let shape = ReplyShape::parse(stage.shape_hint(), invocation.payload)
            .map_err(|e| StageFailure::new(stage, &e, invocation.attempted.clone()))?;
        let output = shape.to_value();

        if self.config.cache_stages {
            let agent_tag = format!("agent:{}", binding.agent);
            let capability_tag = format!("capability:{}", binding.capability);
            self.cache
                .store(&cache_request, output.clone(), &[&agent_tag, &capability_tag])
                .await;
        }

        Ok(StageResult {
            stage,
            agent: binding.agent.clone(),
            capability: binding.capability.clone(),
            output,
            transport: Some(invocation.transport),
            attempted: invocation.attempted,
            degraded: invocation.degraded,
            cached: false,
            elapsed_ms: stage_started.elapsed().as_millis() as u64,
        })
    }

    async fn cached_workflow(&self, state: &WorkflowState, started: Instant) -> Option<WorkflowOutcome> {
        let hit = self
            .cache
            .lookup(&CacheRequest::new(WORKFLOW_SCOPE, state.query.as_str()))
            .await?;
        let cached: WorkflowOutcome = match serde_json::from_value(hit.payload().clone()) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(workflow_id = %state.workflow_id, error = %e, "Discarding unreadable cached workflow");
                return None;
            }
        };

        self.progress.emit(
            state.workflow_id,
            WorkflowStage::Done,
            StageStatus::Completed,
            json!({ "cached": true, "tier": hit.tier, "score": hit.score }),
        );
        info!(
            workflow_id = %state.workflow_id,
            tier = ?hit.tier,
            score = hit.score,
            matched = %hit.entry.text,
            "Workflow served from cache"
        );

        Some(WorkflowOutcome {
            workflow_id: state.workflow_id,
            query: state.query.clone(),
            status: WorkflowStage::Done,
            cached: true,
            results: cached
                .results
                .into_iter()
                .map(|r| StageResult { cached: true, ..r })
                .collect(),
            failure: None,
            started_at: state.started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn store_workflow(&self, outcome: &WorkflowOutcome) {
        let payload = match serde_json::to_value(outcome) {
            Ok(v) => v,
            Err(e) => {
                warn!(workflow_id = %outcome.workflow_id, error = %e, "Workflow outcome not cacheable");
                return;
            }
        };
        let mut tags: Vec<String> = vec![WORKFLOW_SCOPE.to_string()];
        tags.extend(outcome.results.iter().map(|r| format!("agent:{}", r.agent)));
        let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
        self.cache
            .store(&CacheRequest::new(WORKFLOW_SCOPE, outcome.query.as_str()), payload, &tags)
            .await;
    }

    fn cancelled(&self, state: WorkflowState, stage: WorkflowStage, started: Instant) -> WorkflowOutcome {
        let failure = StageFailure::new(stage, &ConduitError::Cancelled, Vec::new());
        self.progress
            .emit(state.workflow_id, stage, StageStatus::Failed, failure.detail());
        self.finish(state, WorkflowStage::Cancelled, Some(failure), started)
    }

    fn finish(
        &self,
        state: WorkflowState,
        status: WorkflowStage,
        failure: Option<StageFailure>,
        started: Instant,
    ) -> WorkflowOutcome {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            workflow_id = %state.workflow_id,
            status = %status,
            completed_stages = state.results.len(),
            elapsed_ms,
            "Workflow finished"
        );
        WorkflowOutcome {
            workflow_id: state.workflow_id,
            query: state.query,
            status,
            cached: false,
            results: state.results,
            failure,
            started_at: state.started_at,
            elapsed_ms,
        }
    }
}

/// Each stage sees the query plus the previous stage's output.
fn stage_input(stage: WorkflowStage, state: &WorkflowState) -> Value {
    match stage {
        WorkflowStage::Retrieving => json!({
            "query": state.query,
            "interpretation": state.output(WorkflowStage::Understanding),
        }),
        WorkflowStage::Visualizing => json!({
            "query": state.query,
            "data": state.output(WorkflowStage::Retrieving),
        }),
        _ => json!({ "query": state.query }),
    }
}
