//! Ouroboros - Type Definitions
//!
//! Shared types for the self-evolving agent runtime. Everything that is
//! persisted in the journal or crosses a subsystem boundary lives here.

use serde::{Deserialize, Serialize};

// ─── Journal Rows ────────────────────────────────────────────────

/// A single row of the append-only `action_log` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionEntry {
    pub id: i64,
    pub timestamp: String,
    pub action: String,
    pub reasoning: String,
    pub outcome: String,
    pub cost: f64,
}

/// A single row of the append-only `economic_log` table.
///
/// `balance_after` carries the running balance: each row equals the
/// previous row's balance plus this row's `amount_signed`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionEntry {
    pub id: i64,
    pub timestamp: String,
    pub description: String,
    pub amount_signed: f64,
    pub balance_after: f64,
    pub category: String,
}

/// A single row of the append-only `dialogue_log` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DialogueEntry {
    pub id: i64,
    pub timestamp: String,
    pub phase: DialoguePhase,
    pub content: String,
    pub master_command: Option<String>,
    pub reasoning: Option<String>,
}

/// Phase vocabulary of the dialogue log.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DialoguePhase {
    Understanding,
    Risk,
    Alternative,
    Recommendation,
}

impl DialoguePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialoguePhase::Understanding => "understanding",
            DialoguePhase::Risk => "risk",
            DialoguePhase::Alternative => "alternative",
            DialoguePhase::Recommendation => "recommendation",
        }
    }
}

/// Registry row for a forged tool. The `file_path` points at the source
/// artifact on disk; the compiled binary sits next to it under `bin/`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub file_path: String,
    pub created_at: String,
    pub last_used: Option<String>,
    pub usage_count: i64,
}

/// A learned trait of the operator, with bounded-reinforcement confidence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterTrait {
    pub id: i64,
    pub trait_name: String,
    pub value: String,
    pub confidence: f64,
    pub evidence_count: i64,
    pub last_updated: String,
}

/// One tier of the hierarchy of needs. Exactly one tier has
/// `current_focus` set at any time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NeedTier {
    pub tier: i64,
    pub name: String,
    pub description: String,
    pub current_focus: bool,
    pub progress: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Goal {
    pub id: i64,
    pub goal_text: String,
    pub goal_type: String,
    pub priority: i64,
    pub status: GoalStatus,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub progress: i64,
    pub expected_benefit: String,
    pub estimated_effort: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Completed,
}

/// One sample of the `performance_metrics` time series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub error_rate: f64,
    pub response_time: f64,
    pub task_completion_rate: f64,
    pub autonomous_actions: i64,
    pub goals_completed: i64,
    pub evolutions_executed: i64,
}

/// Outcome record of one evolution strategy run, used to tune later cycles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: i64,
    pub timestamp: String,
    pub strategy_name: String,
    pub strategy_params: serde_json::Value,
    pub success_rate: f64,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub execution_time_seconds: f64,
    pub outcomes: serde_json::Value,
    pub lessons_learned: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub capability: String,
    pub description: String,
    pub value: i64,
    pub complexity: i64,
    pub dependencies: serde_json::Value,
    pub status: CapabilityStatus,
    pub discovered_at: String,
    pub developed_at: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    Discovered,
    Recommended,
    InProgress,
    Developed,
}

impl CapabilityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityStatus::Discovered => "discovered",
            CapabilityStatus::Recommended => "recommended",
            CapabilityStatus::InProgress => "in_progress",
            CapabilityStatus::Developed => "developed",
        }
    }
}

// ─── Action Outcome Vocabulary ───────────────────────────────────

/// Well-known `action_log.outcome` tags. The column is free-form text;
/// these are the values the miners look for.
pub mod outcome {
    pub const EXECUTING: &str = "executing";
    pub const COMPLETED: &str = "completed";
    pub const ERROR: &str = "error";
    pub const SKIPPED: &str = "skipped";
    pub const EVOLUTION_STARTED: &str = "evolution_started";
    pub const EVOLUTION_COMPLETED: &str = "evolution_completed";
}

// ─── Model Routing ───────────────────────────────────────────────

/// Task complexity hint handed to the router.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TaskComplexity {
    Low,
    Medium,
    High,
}

/// Capability classes a backend can declare.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelCapability {
    Coding,
    Reasoning,
    Planning,
    Analysis,
    Prediction,
    Synthesis,
    General,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendProvider {
    /// Local inference daemon (Ollama-style `/api/generate`).
    Local,
    /// Metered external API (OpenAI-compatible chat completions).
    Priced,
}

/// One entry of the static backend capability table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendSpec {
    pub id: String,
    pub model: String,
    pub provider: BackendProvider,
    pub capabilities: Vec<ModelCapability>,
    /// Flat per-token rate for local backends (applied to response tokens).
    pub cost_per_token: f64,
    /// Per-token rates for priced backends.
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
    pub max_context: u64,
    /// Highest complexity tier this backend is trusted with.
    pub max_complexity: TaskComplexity,
    pub timeout_secs: u64,
}

impl BackendSpec {
    /// Rate used for cost-ordering during routing.
    pub fn comparable_rate(&self) -> f64 {
        match self.provider {
            BackendProvider::Local => self.cost_per_token,
            BackendProvider::Priced => self.output_cost_per_token,
        }
    }
}

/// Token accounting for one backend round trip.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

// ─── Event Bus ───────────────────────────────────────────────────

/// Typed event vocabulary of the in-process bus.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Startup,
    Shutdown,
    HealthCheck,
    EconomicTransaction,
    BalanceLow,
    IncomeGenerated,
    EvolutionStarted,
    EvolutionCompleted,
    EvolutionFailed,
    ToolCreated,
    ToolLoaded,
    ToolError,
    GoalCreated,
    GoalCompleted,
    GoalFailed,
    ReflectionStarted,
    ReflectionCompleted,
    DiagnosisCompleted,
    DiagnosisActionRequired,
}

/// An event as delivered to subscribers and retained in history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub source: String,
    pub timestamp: String,
    pub correlation_id: String,
}

// ─── Diagnosis ───────────────────────────────────────────────────

/// Health verdict for one registered module.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleHealth {
    pub module: String,
    pub status: ModuleStatus,
    /// Number of public functions found in the module source.
    pub methods: usize,
    pub last_error: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Healthy,
    Error,
}

/// SQL aggregates over `action_log` used by the performance assessment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActionStatistics {
    pub total_actions: i64,
    pub active_days: i64,
    pub avg_action_length: f64,
    pub avg_reasoning_length: f64,
    pub error_count: i64,
    pub recent_hour_count: i64,
}

impl ActionStatistics {
    pub fn error_rate(&self) -> f64 {
        if self.total_actions == 0 {
            0.0
        } else {
            self.error_count as f64 / self.total_actions as f64
        }
    }
}

/// Trend over the recorded `performance_metrics` time series.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PerformanceTrend {
    /// Snapshots inside the assessment window.
    pub samples: usize,
    pub avg_error_rate: f64,
    pub avg_response_time: f64,
    /// Newest-sample error rate minus oldest-sample error rate; positive
    /// means the system is getting worse.
    pub error_rate_delta: f64,
}

/// A recurring action paired with the router's automation suggestion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Opportunity {
    pub action: String,
    pub occurrences: i64,
    pub suggestion: Option<String>,
}

/// Cyclomatic complexity of one function.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionComplexity {
    pub name: String,
    pub complexity: u32,
    pub line: usize,
}

/// Result of analyzing one module's source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodeAnalysis {
    pub module: String,
    pub functions: Vec<FunctionComplexity>,
    /// Functions whose complexity exceeds the flag threshold.
    pub flagged: Vec<FunctionComplexity>,
    pub suggestions: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ActionPriority {
    High,
    Medium,
    Low,
}

/// One step of the improvement plan derived from a diagnosis.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImprovementAction {
    pub priority: ActionPriority,
    pub title: String,
    pub steps: Vec<String>,
}

/// The composed self-diagnosis report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub timestamp: String,
    pub modules: Vec<ModuleHealth>,
    pub performance: ActionStatistics,
    pub trend: PerformanceTrend,
    pub bottlenecks: Vec<String>,
    pub opportunities: Vec<Opportunity>,
    pub plan: Vec<ImprovementAction>,
}

// ─── Evolution ───────────────────────────────────────────────────

/// Lifecycle state of the evolution pipeline.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Running,
    Completed,
    Failed,
    Paused,
}

/// Overall outcome of one cycle, computed from per-phase statuses.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Skipped,
    Completed,
    Partial,
    Failed,
    Paused,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Skipped => "skipped",
            CycleStatus::Completed => "completed",
            CycleStatus::Partial => "partial",
            CycleStatus::Failed => "failed",
            CycleStatus::Paused => "paused",
        }
    }
}

/// A planned evolution task, parsed from the planner's strict text format
/// or lifted directly from diagnosis recommendations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanTask {
    pub name: String,
    pub description: String,
    pub expected_benefit: String,
    pub effort: String,
    pub status: String,
    /// Which coarse goal (or "diagnosis") produced this task.
    pub source: String,
}

/// One evolution plan as persisted in the history file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvolutionPlan {
    pub cycle_id: String,
    pub focus_tier: i64,
    pub goals: Vec<String>,
    pub tasks: Vec<PlanTask>,
    pub created_at: String,
}

/// Execution record of one phase-4 task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task: String,
    pub start_time: String,
    pub end_time: String,
    pub success: bool,
    pub output: String,
    pub errors: Vec<String>,
}

/// Result of the integrate-and-test phase.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TestReport {
    pub tests_run: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub details: Vec<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LessonKind {
    Success,
    Failure,
    Warning,
}

/// A lesson extracted during reflection, appended to the knowledge file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lesson {
    #[serde(rename = "type")]
    pub kind: LessonKind,
    pub task: String,
    pub lesson: String,
    pub insight: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

/// Accumulated lessons across cycles (`evolution_knowledge.json`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EvolutionKnowledge {
    pub lessons: Vec<Lesson>,
    pub total_cycles: u64,
    pub last_update: String,
}

/// Pre-evolution snapshot written before each cycle enters `running`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvolutionCheckpoint {
    pub cycle_id: String,
    pub created_at: String,
    pub balance: f64,
    pub focus_tier: i64,
    /// Module name to backup file path, for the rollback restore path.
    pub module_backups: std::collections::BTreeMap<String, String>,
}

/// Return value of `run_autonomous_evolution`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvolutionOutcome {
    pub status: CycleStatus,
    pub reason: Option<String>,
    pub cycle_id: Option<String>,
    pub executions: Vec<TaskExecution>,
    pub test_report: Option<TestReport>,
    pub failed_phases: Vec<String>,
}

impl EvolutionOutcome {
    pub fn skipped(reason: &str) -> Self {
        Self {
            status: CycleStatus::Skipped,
            reason: Some(reason.to_string()),
            cycle_id: None,
            executions: Vec::new(),
            test_report: None,
            failed_phases: Vec::new(),
        }
    }
}
