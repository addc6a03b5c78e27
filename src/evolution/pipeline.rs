//! Evolution Pipeline
//!
//! The six-phase state machine at the heart of the runtime: diagnose,
//! plan, prioritize, execute, integrate-and-test, reflect-and-cleanup.
//! A checkpoint is written before a cycle enters `running`; phases are
//! strictly sequential; a failing phase is recorded and the pipeline
//! continues where possible. Pause is honored between phases and
//! between tasks inside the execute phase, never mid-phase.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::diagnosis::Diagnosis;
use crate::events::EventBus;
use crate::journal::{Journal, REQUIRED_TABLES};
use crate::ledger::Ledger;
use crate::router::ModelRouter;
use crate::types::*;

use super::artifacts::EvolutionArtifacts;
use super::forge::ToolForge;
use super::modify::ModuleModifier;
use super::planner::{self, TaskClass};

/// Error-rate signal threshold for the gating rule.
const GATE_ERROR_RATE: f64 = 0.10;
const GATE_BOTTLENECKS: usize = 3;
const GATE_OPPORTUNITIES: usize = 5;
const GATE_OPPORTUNITY_SURGE: usize = 10;
const GATE_STALE_DAYS: i64 = 7;

/// Pause between phase-4 tasks, relieving model back-pressure.
const INTER_TASK_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PipelinePhase {
    Plan,
    Prioritize,
    Execute,
    Test,
    Reflect,
}

/// In-flight cycle state, stashed whole when the cycle pauses.
struct CycleContext {
    cycle_id: String,
    started_at: DateTime<Utc>,
    report: DiagnosisReport,
    plan: Option<EvolutionPlan>,
    ranked: Vec<PlanTask>,
    executions: Vec<TaskExecution>,
    next_task: usize,
    test_report: Option<TestReport>,
    failed_phases: Vec<String>,
    phase: PipelinePhase,
}

pub struct EvolutionPipeline {
    journal: Arc<Journal>,
    router: Arc<ModelRouter>,
    diagnosis: Arc<Diagnosis>,
    forge: Arc<ToolForge>,
    modifier: Arc<ModuleModifier>,
    bus: Arc<EventBus>,
    artifacts: EvolutionArtifacts,
    state: Mutex<CycleState>,
    pause_requested: AtomicBool,
    paused: Mutex<Option<CycleContext>>,
    inter_task_delay: Duration,
    max_retries: u32,
}

impl EvolutionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        journal: Arc<Journal>,
        router: Arc<ModelRouter>,
        diagnosis: Arc<Diagnosis>,
        forge: Arc<ToolForge>,
        modifier: Arc<ModuleModifier>,
        bus: Arc<EventBus>,
        artifacts: EvolutionArtifacts,
        max_retries: u32,
    ) -> Self {
        Self {
            journal,
            router,
            diagnosis,
            forge,
            modifier,
            bus,
            artifacts,
            state: Mutex::new(CycleState::Idle),
            pause_requested: AtomicBool::new(false),
            paused: Mutex::new(None),
            inter_task_delay: INTER_TASK_DELAY,
            max_retries,
        }
    }

    /// Override the inter-task delay (tests run with zero).
    pub fn with_inter_task_delay(mut self, delay: Duration) -> Self {
        self.inter_task_delay = delay;
        self
    }

    pub fn state(&self) -> CycleState {
        *self.state.lock().unwrap()
    }

    /// Request a pause. Honored between phases and between tasks in the
    /// execute phase.
    pub fn pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    /// Continue a paused cycle from where it stopped.
    pub async fn resume(&self) -> Result<EvolutionOutcome> {
        let ctx = self
            .paused
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("no paused cycle to resume"))?;
        *self.state.lock().unwrap() = CycleState::Running;
        info!(cycle = ctx.cycle_id.as_str(), "resuming evolution cycle");
        self.run_from(ctx).await
    }

    // ─── Entry point ─────────────────────────────────────────────

    /// Run one closed-loop evolution cycle. Phase 1 (diagnose + gate)
    /// happens here; when the gate holds, a checkpoint is written and
    /// the remaining phases run.
    pub async fn run_autonomous_evolution(&self) -> Result<EvolutionOutcome> {
        if self.paused.lock().unwrap().is_some() {
            return Ok(EvolutionOutcome {
                status: CycleStatus::Paused,
                reason: Some("a paused cycle is awaiting resume".to_string()),
                cycle_id: None,
                executions: Vec::new(),
                test_report: None,
                failed_phases: Vec::new(),
            });
        }

        // Phase 1: diagnose, then gate.
        let report = self.diagnosis.perform_full_diagnosis().await?;
        let (evolve, reason) = should_evolve(&report, self.last_cycle_time()?, Utc::now());
        if !evolve {
            *self.state.lock().unwrap() = CycleState::Idle;
            self.journal.log_action(
                "evolution_cycle",
                &format!("gating held the cycle back: {reason}"),
                outcome::SKIPPED,
                0.0,
            )?;
            return Ok(EvolutionOutcome::skipped(&reason));
        }

        let now = Utc::now();
        let cycle_id = now.format("%Y%m%d_%H%M").to_string();
        self.write_checkpoint(&cycle_id)?;

        *self.state.lock().unwrap() = CycleState::Running;
        self.journal.log_action(
            "evolution_cycle",
            &format!("cycle {cycle_id} gated in: {reason}"),
            outcome::EVOLUTION_STARTED,
            0.0,
        )?;
        self.bus.publish(
            EventKind::EvolutionStarted,
            json!({ "cycle_id": cycle_id, "reason": reason }),
            "evolution",
        );

        self.run_from(CycleContext {
            cycle_id,
            started_at: now,
            report,
            plan: None,
            ranked: Vec::new(),
            executions: Vec::new(),
            next_task: 0,
            test_report: None,
            failed_phases: Vec::new(),
            phase: PipelinePhase::Plan,
        })
        .await
    }

    async fn run_from(&self, mut ctx: CycleContext) -> Result<EvolutionOutcome> {
        loop {
            if self.pause_requested.swap(false, Ordering::SeqCst) {
                return self.park(ctx);
            }

            match ctx.phase {
                PipelinePhase::Plan => {
                    match self.phase_plan(&ctx).await {
                        Ok(plan) => ctx.plan = Some(plan),
                        Err(e) => {
                            warn!("plan phase failed: {:#}", e);
                            ctx.failed_phases.push("plan".to_string());
                        }
                    }
                    ctx.phase = PipelinePhase::Prioritize;
                }
                PipelinePhase::Prioritize => {
                    if let Some(plan) = ctx.plan.clone() {
                        match self.phase_prioritize(&ctx, &plan).await {
                            Ok(ranked) => ctx.ranked = ranked,
                            Err(e) => {
                                warn!("prioritize phase failed, keeping plan order: {:#}", e);
                                ctx.failed_phases.push("prioritize".to_string());
                                let mut tasks = plan.tasks;
                                tasks.truncate(planner::TOP_TASK_COUNT);
                                ctx.ranked = tasks;
                            }
                        }
                    }
                    ctx.phase = PipelinePhase::Execute;
                }
                PipelinePhase::Execute => {
                    let paused = self.phase_execute(&mut ctx).await;
                    if paused {
                        return self.park(ctx);
                    }
                    ctx.phase = PipelinePhase::Test;
                }
                PipelinePhase::Test => {
                    ctx.test_report = Some(self.phase_test());
                    ctx.phase = PipelinePhase::Reflect;
                }
                PipelinePhase::Reflect => {
                    if let Err(e) = self.phase_reflect(&ctx) {
                        warn!("reflect phase failed: {:#}", e);
                        ctx.failed_phases.push("reflect".to_string());
                    }
                    break;
                }
            }
        }

        self.finalize(ctx)
    }

    fn park(&self, ctx: CycleContext) -> Result<EvolutionOutcome> {
        *self.state.lock().unwrap() = CycleState::Paused;
        let cycle_id = ctx.cycle_id.clone();
        self.journal.log_action(
            "evolution_cycle",
            &format!("cycle {cycle_id} paused"),
            "paused",
            0.0,
        )?;
        *self.paused.lock().unwrap() = Some(ctx);
        Ok(EvolutionOutcome {
            status: CycleStatus::Paused,
            reason: Some("pause requested".to_string()),
            cycle_id: Some(cycle_id),
            executions: Vec::new(),
            test_report: None,
            failed_phases: Vec::new(),
        })
    }

    // ─── Phase 2: plan ───────────────────────────────────────────

    async fn phase_plan(&self, ctx: &CycleContext) -> Result<EvolutionPlan> {
        let tier = self.journal.focus_tier()?;
        let goals = planner::tier_goals(tier.tier);

        let mut tasks: Vec<PlanTask> = Vec::new();
        for goal in goals.iter().copied() {
            let prompt = planner::build_goal_prompt(goal, &ctx.report);
            match self
                .call_with_fallback("planning", TaskComplexity::Medium, &prompt)
                .await
            {
                Ok(text) => tasks.extend(planner::parse_plan_tasks(&text, goal)),
                Err(e) => warn!(goal, "goal planning call failed: {:#}", e),
            }
        }
        tasks.extend(planner::direct_tasks(&ctx.report.plan));

        // Drop duplicate names, first occurrence wins.
        let mut seen = std::collections::HashSet::new();
        tasks.retain(|t| seen.insert(t.name.to_lowercase()));

        if tasks.is_empty() {
            return Err(anyhow!("planning produced no tasks"));
        }

        let plan = EvolutionPlan {
            cycle_id: ctx.cycle_id.clone(),
            focus_tier: tier.tier,
            goals: goals.iter().map(|g| g.to_string()).collect(),
            tasks,
            created_at: Utc::now().to_rfc3339(),
        };
        self.artifacts.append_plan(&plan)?;
        info!(
            cycle = ctx.cycle_id.as_str(),
            tasks = plan.tasks.len(),
            tier = plan.focus_tier,
            "plan persisted"
        );
        Ok(plan)
    }

    // ─── Phase 3: prioritize ─────────────────────────────────────

    async fn phase_prioritize(
        &self,
        ctx: &CycleContext,
        plan: &EvolutionPlan,
    ) -> Result<Vec<PlanTask>> {
        let prompt = planner::build_priority_prompt(&ctx.report, &plan.tasks);
        let text = self
            .call_with_fallback("planning", TaskComplexity::Medium, &prompt)
            .await?;
        let ranked_names = planner::parse_ranked_names(&text);
        Ok(planner::rank_tasks(plan.tasks.clone(), &ranked_names))
    }

    // ─── Phase 4: execute ────────────────────────────────────────

    /// Returns true when a pause was requested between tasks.
    async fn phase_execute(&self, ctx: &mut CycleContext) -> bool {
        while ctx.next_task < ctx.ranked.len() {
            if ctx.next_task > 0 && !self.inter_task_delay.is_zero() {
                tokio::time::sleep(self.inter_task_delay).await;
            }
            if self.pause_requested.swap(false, Ordering::SeqCst) {
                return true;
            }

            let task = ctx.ranked[ctx.next_task].clone();
            let execution = self.execute_task(&task, ctx.next_task).await;

            let row_outcome = if execution.success {
                outcome::COMPLETED
            } else {
                outcome::ERROR
            };
            if let Err(e) = self.journal.log_action(
                "evolution_task",
                &format!("'{}': {}", execution.task, summarize(&execution)),
                row_outcome,
                0.0,
            ) {
                warn!("failed to record task execution: {:#}", e);
            }

            ctx.executions.push(execution);
            ctx.next_task += 1;
        }

        if !ctx.executions.is_empty() && ctx.executions.iter().all(|e| !e.success) {
            ctx.failed_phases.push("execute".to_string());
        }
        false
    }

    async fn execute_task(&self, task: &PlanTask, index: usize) -> TaskExecution {
        let start = Utc::now();
        let result = match planner::classify_task(&task.name) {
            TaskClass::Optimization => self.run_optimization_task(task, index).await,
            TaskClass::Creation => self.run_creation_task(task).await,
            TaskClass::Analysis => self.run_analysis_task().await,
            TaskClass::Other => self.run_dispatched_task(task, index).await,
        };
        let end = Utc::now();

        match result {
            Ok(output) => TaskExecution {
                task: task.name.clone(),
                start_time: start.to_rfc3339(),
                end_time: end.to_rfc3339(),
                success: true,
                output,
                errors: Vec::new(),
            },
            Err(e) => TaskExecution {
                task: task.name.clone(),
                start_time: start.to_rfc3339(),
                end_time: end.to_rfc3339(),
                success: false,
                output: String::new(),
                errors: vec![format!("{e:#}")],
            },
        }
    }

    /// Complexity analysis of one core module, chosen by mention in the
    /// task text or rotation.
    async fn run_optimization_task(&self, task: &PlanTask, index: usize) -> Result<String> {
        let modules = self.diagnosis.module_names();
        if modules.is_empty() {
            return Err(anyhow!("no modules registered for analysis"));
        }
        let haystack = format!("{} {}", task.name, task.description).to_lowercase();
        let module = modules
            .iter()
            .find(|m| haystack.contains(m.as_str()))
            .cloned()
            .unwrap_or_else(|| modules[index % modules.len()].clone());

        let analysis = self.diagnosis.analyze_own_code(&module).await?;
        let mut report = format!(
            "module '{}': {} functions, {} above complexity threshold",
            analysis.module,
            analysis.functions.len(),
            analysis.flagged.len()
        );
        if let Some(suggestions) = &analysis.suggestions {
            report.push_str(&format!("; suggestions: {suggestions}"));
        }
        Ok(report)
    }

    /// Forge a new tool named after the task.
    async fn run_creation_task(&self, task: &PlanTask) -> Result<String> {
        let name = format!("evolved_{}", planner::slugify(&task.name));
        let description = if task.description.is_empty() {
            task.name.clone()
        } else {
            task.description.clone()
        };
        let record = self.forge.create_tool(&name, &description, None).await?;
        Ok(format!("tool created: {} at {}", record.name, record.file_path))
    }

    /// Rerun diagnosis and report the headline counts.
    async fn run_analysis_task(&self) -> Result<String> {
        let report = self.diagnosis.perform_full_diagnosis().await?;
        Ok(format!(
            "diagnosis rerun: {} bottlenecks, {} opportunities, error rate {:.1}%",
            report.bottlenecks.len(),
            report.opportunities.len(),
            report.performance.error_rate() * 100.0
        ))
    }

    /// Unclassified task: ask the router to pick the action, then
    /// dispatch.
    async fn run_dispatched_task(&self, task: &PlanTask, index: usize) -> Result<String> {
        let prompt = format!(
            "Task: {} - {}\nChoose exactly one action for this task: \
             create_tool, optimize, analyze, modify_config. Answer with the action only.",
            task.name, task.description
        );
        let reply = self
            .call_with_fallback("reasoning", TaskComplexity::Low, &prompt)
            .await?;
        let choice = reply.to_lowercase();

        if choice.contains("create_tool") {
            self.run_creation_task(task).await
        } else if choice.contains("modify_config") {
            self.journal.log_action(
                "config_modification",
                &format!("intent from task '{}': {}", task.name, task.description),
                outcome::EXECUTING,
                0.0,
            )?;
            Ok("configuration change recorded for review".to_string())
        } else if choice.contains("optimize") {
            self.run_optimization_task(task, index).await
        } else if choice.contains("analyze") {
            self.run_analysis_task().await
        } else {
            Err(anyhow!("router picked no usable action: {reply}"))
        }
    }

    // ─── Phase 5: integrate & test ───────────────────────────────

    fn phase_test(&self) -> TestReport {
        let mut report = TestReport::default();
        let check = |name: &str, passed: bool, report: &mut TestReport| {
            report.tests_run += 1;
            if passed {
                report.tests_passed += 1;
            } else {
                report.tests_failed += 1;
                report.details.push(format!("FAIL: {name}"));
            }
        };

        // Every registered module still reads and parses.
        for health in self.diagnosis.assess_modules() {
            check(
                &format!("module '{}' re-parses", health.module),
                health.status == ModuleStatus::Healthy,
                &mut report,
            );
        }

        // Every required table answers a count.
        for table in REQUIRED_TABLES {
            check(
                &format!("table '{table}' queryable"),
                self.journal.table_count(table).is_ok(),
                &mut report,
            );
        }

        // The router can route a trivial request.
        let trivial_route = self.router.route("general", TaskComplexity::Low);
        check("router routes trivial request", trivial_route.is_ok(), &mut report);

        // Subsystem handles are live.
        check(
            "forge, diagnosis and modification handles live",
            self.forge.tools_dir().exists()
                && self.modifier.backups_dir().exists()
                && !self.diagnosis.module_names().is_empty(),
            &mut report,
        );

        // Cost arithmetic stays in sane ranges.
        let cost_sane = trivial_route
            .map(|spec| {
                let usage = TokenUsage {
                    prompt_tokens: 1000,
                    completion_tokens: 1000,
                };
                let cost = Ledger::calculate_cost(spec, &usage);
                cost > 0.0 && cost < 1.0
            })
            .unwrap_or(false);
        check("cost arithmetic within sanity range", cost_sane, &mut report);

        report
    }

    // ─── Phase 6: reflect & cleanup ──────────────────────────────

    fn phase_reflect(&self, ctx: &CycleContext) -> Result<()> {
        let mut lessons: Vec<Lesson> = ctx
            .executions
            .iter()
            .map(|execution| {
                if execution.success {
                    Lesson {
                        kind: LessonKind::Success,
                        task: execution.task.clone(),
                        lesson: format!("'{}' completed", execution.task),
                        insight: execution.output.clone(),
                        recommendation: None,
                    }
                } else {
                    Lesson {
                        kind: LessonKind::Failure,
                        task: execution.task.clone(),
                        lesson: format!("'{}' failed", execution.task),
                        insight: execution.errors.join("; "),
                        recommendation: Some("retry with a narrower scope".to_string()),
                    }
                }
            })
            .collect();

        if let Some(test_report) = &ctx.test_report {
            if test_report.tests_failed > 0 {
                lessons.push(Lesson {
                    kind: LessonKind::Warning,
                    task: "integration tests".to_string(),
                    lesson: format!(
                        "{}/{} integration checks failed",
                        test_report.tests_failed, test_report.tests_run
                    ),
                    insight: test_report.details.join("; "),
                    recommendation: Some("review the failing checks before the next cycle".to_string()),
                });
            }
        }

        self.artifacts.append_lessons(&lessons)?;

        let completed = ctx.executions.iter().filter(|e| e.success).count() as i64;
        let failed = ctx.executions.len() as i64 - completed;
        let success_rate = if ctx.executions.is_empty() {
            0.0
        } else {
            completed as f64 / ctx.executions.len() as f64
        };
        self.journal.insert_strategy_record(&StrategyRecord {
            id: 0,
            timestamp: Utc::now().to_rfc3339(),
            strategy_name: format!("evolution_cycle_{}", ctx.cycle_id),
            strategy_params: json!({
                "focus_tier": ctx.plan.as_ref().map(|p| p.focus_tier),
                "planned_tasks": ctx.plan.as_ref().map(|p| p.tasks.len()),
                "ranked_tasks": ctx.ranked.len(),
            }),
            success_rate,
            tasks_completed: completed,
            tasks_failed: failed,
            execution_time_seconds: (Utc::now() - ctx.started_at).num_milliseconds() as f64
                / 1000.0,
            outcomes: serde_json::to_value(&ctx.executions)?,
            lessons_learned: lessons
                .iter()
                .map(|l| l.lesson.clone())
                .collect::<Vec<_>>()
                .join("; "),
        })?;

        let removed = self.artifacts.cleanup_temp()?;
        if removed > 0 {
            info!(removed, "cycle cleanup removed temporary files");
        }
        Ok(())
    }

    // ─── Finalization ────────────────────────────────────────────

    fn finalize(&self, ctx: CycleContext) -> Result<EvolutionOutcome> {
        let mut failed_phases = ctx.failed_phases.clone();
        if let Some(test_report) = &ctx.test_report {
            if test_report.tests_failed > 0 && !failed_phases.iter().any(|p| p == "test") {
                failed_phases.push("test".to_string());
            }
        }

        let status = if failed_phases.len() > 2 {
            CycleStatus::Failed
        } else if !failed_phases.is_empty() {
            CycleStatus::Partial
        } else {
            CycleStatus::Completed
        };

        *self.state.lock().unwrap() = match status {
            CycleStatus::Failed => CycleState::Failed,
            _ => CycleState::Completed,
        };

        self.journal
            .set_state("last_evolution_cycle", &ctx.cycle_id)?;
        self.journal
            .set_state("last_evolution_at", &Utc::now().to_rfc3339())?;
        let executed: u64 = self
            .journal
            .get_state("evolutions_executed")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        self.journal
            .set_state("evolutions_executed", &(executed + 1).to_string())?;

        let (event, row_outcome) = match status {
            CycleStatus::Failed => (EventKind::EvolutionFailed, outcome::ERROR),
            _ => (EventKind::EvolutionCompleted, outcome::EVOLUTION_COMPLETED),
        };
        self.journal.log_action(
            "evolution_cycle",
            &format!(
                "cycle {} finished with status {} ({} tasks, {} failed phases)",
                ctx.cycle_id,
                status.as_str(),
                ctx.executions.len(),
                failed_phases.len()
            ),
            row_outcome,
            0.0,
        )?;
        self.bus.publish(
            event,
            json!({ "cycle_id": ctx.cycle_id, "status": status.as_str() }),
            "evolution",
        );
        info!(
            cycle = ctx.cycle_id.as_str(),
            status = status.as_str(),
            "evolution cycle finished"
        );

        Ok(EvolutionOutcome {
            status,
            reason: None,
            cycle_id: Some(ctx.cycle_id),
            executions: ctx.executions,
            test_report: ctx.test_report,
            failed_phases,
        })
    }

    // ─── Checkpoint & rollback ───────────────────────────────────

    fn write_checkpoint(&self, cycle_id: &str) -> Result<()> {
        let mut module_backups = BTreeMap::new();
        for name in self.modifier.module_names() {
            match self.modifier.backup_module(&name) {
                Ok(path) => {
                    module_backups.insert(name, path.to_string_lossy().to_string());
                }
                Err(e) => warn!(module = name.as_str(), "checkpoint backup failed: {:#}", e),
            }
        }

        self.artifacts.write_checkpoint(&EvolutionCheckpoint {
            cycle_id: cycle_id.to_string(),
            created_at: Utc::now().to_rfc3339(),
            balance: self.journal.current_balance()?,
            focus_tier: self.journal.focus_tier()?.tier,
            module_backups,
        })
    }

    /// Best-effort rollback to the last pre-evolution checkpoint. With
    /// no checkpoint on disk this reports failure without side effects.
    pub fn rollback_last_evolution(&self) -> Result<String> {
        let checkpoint = self
            .artifacts
            .read_checkpoint()?
            .ok_or_else(|| anyhow!("no checkpoint available; nothing to roll back"))?;

        let mut restored = 0;
        for (module, backup) in &checkpoint.module_backups {
            self.modifier.restore_from(module, Path::new(backup))?;
            restored += 1;
        }

        let summary = format!(
            "rolled back {restored} modules to pre-cycle state {}",
            checkpoint.cycle_id
        );
        self.journal
            .log_action("evolution_rollback", &summary, outcome::COMPLETED, 0.0)?;
        Ok(summary)
    }

    // ─── Helpers ─────────────────────────────────────────────────

    fn last_cycle_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .journal
            .get_state("last_evolution_at")?
            .and_then(|v| v.parse().ok()))
    }

    /// Router call with the pipeline's downgrade fallback: on model
    /// failure, retry at the next lower complexity, at most
    /// `max_retries` extra attempts.
    async fn call_with_fallback(
        &self,
        task_kind: &str,
        complexity: TaskComplexity,
        prompt: &str,
    ) -> Result<String> {
        let mut complexity = complexity;
        let mut attempts = 0;
        loop {
            match self
                .router
                .call_routed(task_kind, complexity, prompt, PIPELINE_PROMPT)
                .await
            {
                Ok(text) => return Ok(text),
                Err(e) => {
                    attempts += 1;
                    if attempts > self.max_retries {
                        return Err(e);
                    }
                    complexity = match complexity {
                        TaskComplexity::High => TaskComplexity::Medium,
                        _ => TaskComplexity::Low,
                    };
                    warn!(task_kind, ?complexity, "model call failed, downgrading: {:#}", e);
                }
            }
        }
    }
}

/// The gating rule of phase 1.
pub fn should_evolve(
    report: &DiagnosisReport,
    last_cycle: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (bool, String) {
    let mut signals = Vec::new();
    if report.performance.error_rate() > GATE_ERROR_RATE {
        signals.push("elevated_error_rate");
    }
    if report.bottlenecks.len() >= GATE_BOTTLENECKS {
        signals.push("bottleneck_pressure");
    }
    if report.opportunities.len() >= GATE_OPPORTUNITIES {
        signals.push("opportunity_backlog");
    }
    if signals.len() >= 2 {
        return (true, signals.join("+"));
    }

    if let Some(last) = last_cycle {
        if now - last > chrono::Duration::days(GATE_STALE_DAYS) {
            return (true, "last_cycle_overdue".to_string());
        }
    }

    if report.opportunities.len() >= GATE_OPPORTUNITY_SURGE {
        return (true, "opportunity_surge".to_string());
    }

    (false, "no_improvement_needed".to_string())
}

fn summarize(execution: &TaskExecution) -> String {
    if execution.success {
        execution.output.chars().take(200).collect()
    } else {
        execution.errors.join("; ").chars().take(200).collect()
    }
}

const PIPELINE_PROMPT: &str =
    "You are the evolution planner of an autonomous agent runtime. Follow the requested output format exactly.";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::diagnosis::ModuleSource;
    use crate::router::testing::ScriptedTransport;
    use crate::router::{backend_table, BackendReply};
    use std::fs;

    fn empty_report(opportunities: usize, bottlenecks: usize, error_rate_pct: i64) -> DiagnosisReport {
        DiagnosisReport {
            timestamp: String::new(),
            modules: Vec::new(),
            performance: ActionStatistics {
                total_actions: 100,
                error_count: error_rate_pct,
                ..Default::default()
            },
            trend: PerformanceTrend::default(),
            bottlenecks: (0..bottlenecks).map(|i| format!("b{i}")).collect(),
            opportunities: (0..opportunities)
                .map(|i| Opportunity {
                    action: format!("a{i}"),
                    occurrences: 4,
                    suggestion: None,
                })
                .collect(),
            plan: Vec::new(),
        }
    }

    #[test]
    fn test_gating_rule() {
        let now = Utc::now();

        // Nothing wrong: skip, even with an unknown last cycle.
        let (evolve, reason) = should_evolve(&empty_report(0, 0, 0), None, now);
        assert!(!evolve);
        assert_eq!(reason, "no_improvement_needed");

        // One signal is not enough.
        let (evolve, _) = should_evolve(&empty_report(5, 0, 0), None, now);
        assert!(!evolve);

        // Two signals gate in.
        let (evolve, _) = should_evolve(&empty_report(5, 3, 0), None, now);
        assert!(evolve);

        // Error rate above 10% plus bottlenecks.
        let (evolve, _) = should_evolve(&empty_report(0, 3, 11), None, now);
        assert!(evolve);

        // Opportunity surge alone suffices.
        let (evolve, reason) = should_evolve(&empty_report(10, 0, 0), None, now);
        assert!(evolve);
        assert_eq!(reason, "opportunity_surge");

        // A stale cycle forces evolution.
        let stale = now - chrono::Duration::days(8);
        let (evolve, reason) = should_evolve(&empty_report(0, 0, 0), Some(stale), now);
        assert!(evolve);
        assert_eq!(reason, "last_cycle_overdue");

        // A recent cycle does not.
        let recent = now - chrono::Duration::days(2);
        let (evolve, _) = should_evolve(&empty_report(0, 0, 0), Some(recent), now);
        assert!(!evolve);
    }

    struct Fixture {
        pipeline: EvolutionPipeline,
        journal: Arc<Journal>,
        _dir: tempfile::TempDir,
    }

    fn fixture(replies: Vec<Result<BackendReply>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();

        // Three simple, healthy module sources under the pipeline's care.
        let mut modules = Vec::new();
        for name in ["journal", "ledger", "router"] {
            let path = dir.path().join(format!("{name}.rs"));
            fs::write(&path, format!("pub fn {name}_entry() -> i32 {{ 1 }}\n")).unwrap();
            modules.push(ModuleSource {
                name: name.to_string(),
                path,
            });
        }

        let journal = Arc::new(Journal::open_in_memory(100.0).unwrap());
        let bus = Arc::new(EventBus::new());
        let ledger = Arc::new(Ledger::new(Arc::clone(&journal), Arc::clone(&bus), 10.0));
        let router = Arc::new(ModelRouter::new(
            backend_table(&RuntimeConfig::default()),
            Arc::new(ScriptedTransport::new(replies)),
            Arc::clone(&ledger),
            Arc::clone(&journal),
        ));
        let diagnosis = Arc::new(Diagnosis::with_modules(
            Arc::clone(&journal),
            Arc::clone(&router),
            Arc::clone(&bus),
            modules.clone(),
        ));
        let forge = Arc::new(
            ToolForge::new(
                Arc::clone(&journal),
                Arc::clone(&router),
                Arc::clone(&ledger),
                Arc::clone(&bus),
                dir.path().join("tools"),
                0.0,
            )
            .unwrap(),
        );
        let modifier = Arc::new(
            ModuleModifier::new(
                Arc::clone(&journal),
                dir.path().join("backups"),
                modules,
                true,
            )
            .unwrap(),
        );
        let artifacts = EvolutionArtifacts::new(dir.path().join("data")).unwrap();

        let pipeline = EvolutionPipeline::new(
            Arc::clone(&journal),
            router,
            diagnosis,
            forge,
            modifier,
            bus,
            artifacts,
            1,
        )
        .with_inter_task_delay(Duration::ZERO);

        Fixture {
            pipeline,
            journal,
            _dir: dir,
        }
    }

    fn seed_recurring_actions(journal: &Journal, distinct: usize) {
        for i in 0..distinct {
            for _ in 0..4 {
                journal
                    .log_action(&format!("a{i:02}"), "recurring work", outcome::COMPLETED, 0.0)
                    .unwrap();
            }
        }
    }

    fn goal_reply(tasks: &[&str]) -> Result<BackendReply> {
        let text = tasks
            .iter()
            .map(|t| {
                format!(
                    "TASK: {t}\nDESCRIPTION: {t} in the smallest safe step\n\
                     EXPECTED_BENEFIT: measurable gain\nEFFORT: low"
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        ScriptedTransport::reply(&text, Some(40))
    }

    #[tokio::test]
    async fn test_skip_with_quiet_system() {
        let fixture = fixture(vec![]);
        let outcome = fixture.pipeline.run_autonomous_evolution().await.unwrap();

        assert_eq!(outcome.status, CycleStatus::Skipped);
        assert_eq!(outcome.reason.as_deref(), Some("no_improvement_needed"));
        assert!(outcome.executions.is_empty());

        // No plan was persisted.
        assert!(fixture.pipeline.artifacts.load_plans().unwrap().is_empty());
        assert_eq!(fixture.pipeline.state(), CycleState::Idle);

        let actions = fixture.journal.recent_actions(50).unwrap();
        assert!(actions
            .iter()
            .any(|a| a.action == "evolution_cycle" && a.outcome == "skipped"));
    }

    #[tokio::test]
    async fn test_end_to_end_cycle() {
        // 12 opportunity suggestions + 3 goal plans + 1 priority ranking.
        let mut replies: Vec<Result<BackendReply>> = (0..12)
            .map(|_| ScriptedTransport::reply("Automate it.", Some(8)))
            .collect();
        replies.push(goal_reply(&["Optimize journal write path", "Optimize journal indexes"]));
        replies.push(goal_reply(&["Optimize router selection"]));
        replies.push(goal_reply(&["Optimize ledger rounding"]));
        replies.push(ScriptedTransport::reply(
            "1. Optimize journal write path\n2. Optimize router selection\n3. Optimize ledger rounding",
            Some(30),
        ));

        let fixture = fixture(replies);
        seed_recurring_actions(&fixture.journal, 12);

        let outcome = fixture.pipeline.run_autonomous_evolution().await.unwrap();

        assert!(matches!(
            outcome.status,
            CycleStatus::Completed | CycleStatus::Partial
        ));
        assert!(!outcome.executions.is_empty());
        assert!(outcome.test_report.is_some());

        let cycle_id = outcome.cycle_id.clone().unwrap();
        assert_eq!(cycle_id.len(), "YYYYMMDD_HHMM".len());
        assert!(cycle_id.chars().nth(8) == Some('_'));

        // The plan landed in the history file under the same cycle id.
        let plans = fixture.pipeline.artifacts.load_plans().unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].cycle_id, cycle_id);
        assert!(!plans[0].tasks.is_empty());

        // Ranked execution follows the priority reply.
        assert_eq!(outcome.executions[0].task, "Optimize journal write path");
        assert!(outcome.executions.iter().all(|e| e.success));

        // Knowledge and strategy history were written.
        let knowledge = fixture.pipeline.artifacts.load_knowledge().unwrap();
        assert_eq!(knowledge.total_cycles, 1);
        assert!(!knowledge.lessons.is_empty());
        assert_eq!(fixture.journal.recent_strategies(5).unwrap().len(), 1);

        // The checkpoint recorded pre-cycle module backups.
        let checkpoint = fixture.pipeline.artifacts.read_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.module_backups.len(), 3);

        // State bookkeeping.
        assert_eq!(
            fixture.journal.get_state("last_evolution_cycle").unwrap().unwrap(),
            cycle_id
        );
        assert_eq!(
            fixture.journal.get_state("evolutions_executed").unwrap().unwrap(),
            "1"
        );
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let mut replies: Vec<Result<BackendReply>> = (0..12)
            .map(|_| ScriptedTransport::reply("Automate it.", Some(8)))
            .collect();
        replies.push(goal_reply(&["Optimize journal write path"]));
        replies.push(goal_reply(&["Optimize router selection"]));
        replies.push(goal_reply(&["Optimize ledger rounding"]));
        replies.push(ScriptedTransport::reply(
            "1. Optimize journal write path\n2. Optimize router selection",
            Some(20),
        ));

        let fixture = fixture(replies);
        seed_recurring_actions(&fixture.journal, 12);

        // Pause lands before the first phase after gating.
        fixture.pipeline.pause();
        let outcome = fixture.pipeline.run_autonomous_evolution().await.unwrap();
        assert_eq!(outcome.status, CycleStatus::Paused);
        assert_eq!(fixture.pipeline.state(), CycleState::Paused);

        // Running again while paused does not start a second cycle.
        let blocked = fixture.pipeline.run_autonomous_evolution().await.unwrap();
        assert_eq!(blocked.status, CycleStatus::Paused);

        // Resume picks the cycle up and finishes it.
        let outcome = fixture.pipeline.resume().await.unwrap();
        assert!(matches!(
            outcome.status,
            CycleStatus::Completed | CycleStatus::Partial
        ));
        assert!(!outcome.executions.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_without_checkpoint_reports_failure() {
        let fixture = fixture(vec![]);
        let err = fixture.pipeline.rollback_last_evolution().unwrap_err();
        assert!(err.to_string().contains("no checkpoint"));
    }

    #[tokio::test]
    async fn test_rollback_restores_checkpoint_backups() {
        let mut replies: Vec<Result<BackendReply>> = (0..12)
            .map(|_| ScriptedTransport::reply("Automate it.", Some(8)))
            .collect();
        replies.push(goal_reply(&["Optimize journal write path"]));
        replies.push(goal_reply(&["Optimize router selection"]));
        replies.push(goal_reply(&["Optimize ledger rounding"]));
        replies.push(ScriptedTransport::reply("1. Optimize journal write path", Some(10)));

        let fixture = fixture(replies);
        seed_recurring_actions(&fixture.journal, 12);
        fixture.pipeline.run_autonomous_evolution().await.unwrap();

        // Corrupt a module, then roll back to the checkpoint.
        let journal_module = fixture
            .pipeline
            .diagnosis
            .module_path("journal")
            .unwrap()
            .to_path_buf();
        let original = fs::read(&journal_module).unwrap();
        fs::write(&journal_module, "fn broken( {").unwrap();

        let summary = fixture.pipeline.rollback_last_evolution().unwrap();
        assert!(summary.contains("3 modules"));
        assert_eq!(fs::read(&journal_module).unwrap(), original);
    }
}
