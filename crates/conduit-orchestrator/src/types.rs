use chrono::{DateTime, Utc};
use conduit_core::{ConduitError, ErrorKind, ShapeHint};
use conduit_transport::TransportKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Position of a workflow in the fixed pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    /// The query is turned into a structured interpretation.
    Understanding,
    /// Data is fetched for the interpretation.
    Retrieving,
    /// The data is rendered as a chart.
    Visualizing,
    /// Terminal: every stage completed.
    Done,
    /// Terminal: a stage failed.
    Failed,
    /// Terminal: the caller cancelled.
    Cancelled,
}

impl WorkflowStage {
    /// Stages that invoke an agent, in execution order.
    pub const PIPELINE: [WorkflowStage; 3] = [
        WorkflowStage::Understanding,
        WorkflowStage::Retrieving,
        WorkflowStage::Visualizing,
    ];

    /// Whether the workflow can no longer advance.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStage::Done | WorkflowStage::Failed | WorkflowStage::Cancelled
        )
    }

    /// Reply shape this stage's agent must return.
    pub fn shape_hint(self) -> ShapeHint {
        match self {
            WorkflowStage::Understanding => ShapeHint::Interpretation,
            WorkflowStage::Retrieving => ShapeHint::Dataset,
            WorkflowStage::Visualizing => ShapeHint::Chart,
            _ => ShapeHint::Opaque,
        }
    }
}

impl std::fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            WorkflowStage::Understanding => "understanding",
            WorkflowStage::Retrieving => "retrieving",
            WorkflowStage::Visualizing => "visualizing",
            WorkflowStage::Done => "done",
            WorkflowStage::Failed => "failed",
            WorkflowStage::Cancelled => "cancelled",
        })
    }
}

/// Status carried by a [`ProgressEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The stage began.
    Started,
    /// The stage finished successfully.
    Completed,
    /// The stage failed and ended the workflow.
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Started => write!(f, "started"),
            StageStatus::Completed => write!(f, "completed"),
            StageStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One progress notification for an observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Workflow the event belongs to.
    pub workflow_id: Uuid,
    /// Stage the event refers to.
    pub stage: WorkflowStage,
    /// What happened to the stage.
    pub status: StageStatus,
    /// Stage-specific detail such as agent, transport or error.
    #[serde(default)]
    pub detail: Value,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// `"<stage>:<status>"`, e.g. `"retrieving:completed"`.
    pub fn label(&self) -> String {
        format!("{}:{}", self.stage, self.status)
    }
}

/// Which agent capability serves a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageBinding {
    /// Agent name.
    pub agent: String,
    /// Capability invoked on that agent.
    pub capability: String,
}

impl StageBinding {
    /// Bind `agent`'s `capability`.
    pub fn new(agent: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            capability: capability.into(),
        }
    }
}

/// Stage bindings and workflow limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Serves [`WorkflowStage::Understanding`].
    #[serde(default = "default_understanding")]
    pub understanding: StageBinding,
    /// Serves [`WorkflowStage::Retrieving`].
    #[serde(default = "default_retrieving")]
    pub retrieving: StageBinding,
    /// Serves [`WorkflowStage::Visualizing`].
    #[serde(default = "default_visualizing")]
    pub visualizing: StageBinding,
    /// Overall budget for one workflow.
    #[serde(default = "default_workflow_timeout_ms")]
    pub workflow_timeout_ms: u64,
    /// Serve whole workflows from the cache.
    #[serde(default = "default_true")]
    pub cache_workflows: bool,
    /// Serve individual stages from the cache.
    #[serde(default = "default_true")]
    pub cache_stages: bool,
}

fn default_understanding() -> StageBinding {
    StageBinding::new("nlp", "understand_query")
}
fn default_retrieving() -> StageBinding {
    StageBinding::new("data", "fetch_data")
}
fn default_visualizing() -> StageBinding {
    StageBinding::new("viz", "render_chart")
}
fn default_workflow_timeout_ms() -> u64 {
    120_000
}
fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            understanding: default_understanding(),
            retrieving: default_retrieving(),
            visualizing: default_visualizing(),
            workflow_timeout_ms: default_workflow_timeout_ms(),
            cache_workflows: true,
            cache_stages: true,
        }
    }
}

impl PipelineConfig {
    /// Binding for an agent stage; `None` for terminal stages.
    pub fn binding(&self, stage: WorkflowStage) -> Option<&StageBinding> {
        match stage {
            WorkflowStage::Understanding => Some(&self.understanding),
            WorkflowStage::Retrieving => Some(&self.retrieving),
            WorkflowStage::Visualizing => Some(&self.visualizing),
            _ => None,
        }
    }
}

/// Output of one completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage that produced this result.
    pub stage: WorkflowStage,
    /// Agent that served it.
    pub agent: String,
    /// Capability that was invoked.
    pub capability: String,
    /// Validated reply, as forwarded to the next stage.
    pub output: Value,
    /// Transport that served the call; `None` when answered from cache.
    pub transport: Option<TransportKind>,
    /// Transports tried, in order.
    #[serde(default)]
    pub attempted: Vec<TransportKind>,
    /// Served by the stateless fallback for an agent with a persistent address.
    #[serde(default)]
    pub degraded: bool,
    /// Answered from the cache.
    #[serde(default)]
    pub cached: bool,
    /// Time spent on this stage.
    pub elapsed_ms: u64,
}

/// Why a stage ended the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// Stage that failed.
    pub stage: WorkflowStage,
    /// Taxonomy of the error.
    pub error_type: ErrorKind,
    /// Error message.
    pub message: String,
    /// Transports attempted before giving up.
    pub transports: Vec<TransportKind>,
}

impl StageFailure {
    /// Capture `error` for `stage`.
    pub fn new(stage: WorkflowStage, error: &ConduitError, transports: Vec<TransportKind>) -> Self {
        Self {
            stage,
            error_type: error.kind(),
            message: error.to_string(),
            transports,
        }
    }

    /// Progress-event detail for this failure.
    pub fn detail(&self) -> Value {
        serde_json::json!({
            "error_type": self.error_type,
            "message": self.message,
            "transports": self.transports,
        })
    }
}

/// Mutable per-query state, discarded once the outcome is returned.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    /// Identifies the run in progress events.
    pub workflow_id: Uuid,
    /// The trimmed user query.
    pub query: String,
    /// Current stage.
    pub stage: WorkflowStage,
    /// Completed stages so far.
    pub results: Vec<StageResult>,
    /// When the run began.
    pub started_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Fresh state at [`WorkflowStage::Understanding`].
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            workflow_id: Uuid::new_v4(),
            query: query.into(),
            stage: WorkflowStage::Understanding,
            results: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Output of a completed stage.
    pub fn output(&self, stage: WorkflowStage) -> Option<&Value> {
        self.results
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.output)
    }

    /// Transports that served completed stages, without consecutive repeats.
    pub fn transports_used(&self) -> Vec<TransportKind> {
        let mut used: Vec<TransportKind> = self.results.iter().filter_map(|r| r.transport).collect();
        used.dedup();
        used
    }
}

/// What a caller gets back from a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    /// Identifies the run in progress events.
    pub workflow_id: Uuid,
    /// The trimmed user query.
    pub query: String,
    /// `done`, `failed` or `cancelled`.
    pub status: WorkflowStage,
    /// Served entirely from the workflow cache.
    #[serde(default)]
    pub cached: bool,
    /// Completed stages in order; partial when the workflow failed.
    pub results: Vec<StageResult>,
    /// Set when `status` is `failed` or `cancelled`.
    #[serde(default)]
    pub failure: Option<StageFailure>,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// Total run time.
    pub elapsed_ms: u64,
}

impl WorkflowOutcome {
    /// Whether every stage completed.
    pub fn is_complete(&self) -> bool {
        self.status == WorkflowStage::Done
    }

    /// Result of one stage, if it completed.
    pub fn result(&self, stage: WorkflowStage) -> Option<&StageResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    /// The deepest stage that completed.
    pub fn deepest(&self) -> Option<&StageResult> {
        self.results.last()
    }
}
