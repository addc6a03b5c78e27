//! Self-Diagnosis
//!
//! Introspects the runtime's own modules, mines the journal for
//! bottlenecks and improvement opportunities, and composes the full
//! diagnosis report the evolution pipeline gates on. Diagnosis is
//! strictly read-only over the system: it never modifies code, data or
//! configuration. Router calls it makes are charged normally.

pub mod analyzer;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::json;
use sysinfo::{Disks, System};
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::journal::Journal;
use crate::router::ModelRouter;
use crate::types::*;

use analyzer::COMPLEXITY_FLAG_THRESHOLD;

/// Journal size above which compaction is recommended.
const JOURNAL_ROW_LIMIT: i64 = 10_000;
/// Tool registry size above which pruning is recommended.
const TOOL_COUNT_LIMIT: i64 = 20;
/// Memory usage fraction above which a bottleneck is reported.
const MEMORY_LIMIT_PCT: f64 = 85.0;
/// Disk usage fraction above which a bottleneck is reported.
const DISK_LIMIT_PCT: f64 = 90.0;

/// How often an action must recur inside the window to count as an
/// automation opportunity.
const RECURRENCE_THRESHOLD: i64 = 3;
const RECURRENCE_WINDOW_DAYS: i64 = 7;

/// Snapshots of the `performance_metrics` series read per assessment.
const METRICS_WINDOW: i64 = 24;
/// Error-rate worsening (newest minus oldest sample) that earns a
/// high-priority plan entry.
const TREND_DEGRADATION_LIMIT: f64 = 0.05;

/// A named module source registered for introspection.
#[derive(Clone, Debug)]
pub struct ModuleSource {
    pub name: String,
    pub path: PathBuf,
}

/// The core modules this build knows how to introspect. Paths resolve
/// against the crate's own source tree.
pub fn default_module_sources() -> Vec<ModuleSource> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src");
    [
        ("journal", "journal/store.rs"),
        ("ledger", "ledger/mod.rs"),
        ("router", "router/mod.rs"),
        ("scheduler", "scheduler/mod.rs"),
        ("diagnosis", "diagnosis/mod.rs"),
        ("analyzer", "diagnosis/analyzer.rs"),
        ("evolution", "evolution/pipeline.rs"),
        ("forge", "evolution/forge.rs"),
        ("events", "events/mod.rs"),
    ]
    .into_iter()
    .map(|(name, rel)| ModuleSource {
        name: name.to_string(),
        path: root.join(rel),
    })
    .collect()
}

pub struct Diagnosis {
    journal: Arc<Journal>,
    router: Arc<ModelRouter>,
    bus: Arc<EventBus>,
    modules: Vec<ModuleSource>,
}

impl Diagnosis {
    pub fn new(journal: Arc<Journal>, router: Arc<ModelRouter>, bus: Arc<EventBus>) -> Self {
        Self::with_modules(journal, router, bus, default_module_sources())
    }

    pub fn with_modules(
        journal: Arc<Journal>,
        router: Arc<ModelRouter>,
        bus: Arc<EventBus>,
        modules: Vec<ModuleSource>,
    ) -> Self {
        Self {
            journal,
            router,
            bus,
            modules,
        }
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name.clone()).collect()
    }

    pub fn module_path(&self, name: &str) -> Option<&Path> {
        self.modules
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.path.as_path())
    }

    // ─── Assessments ─────────────────────────────────────────────

    /// Load and parse each registered module, counting its public
    /// functions. A module that cannot be read or parsed reports an
    /// error status with the failure message.
    pub fn assess_modules(&self) -> Vec<ModuleHealth> {
        self.modules
            .iter()
            .map(|module| match load_and_count(&module.path) {
                Ok(methods) => ModuleHealth {
                    module: module.name.clone(),
                    status: ModuleStatus::Healthy,
                    methods,
                    last_error: None,
                },
                Err(e) => ModuleHealth {
                    module: module.name.clone(),
                    status: ModuleStatus::Error,
                    methods: 0,
                    last_error: Some(format!("{e:#}")),
                },
            })
            .collect()
    }

    /// Aggregate action-log statistics.
    pub fn assess_performance(&self) -> Result<ActionStatistics> {
        self.journal.action_statistics()
    }

    /// Read the recorded `performance_metrics` time series and reduce
    /// it to averages and an error-rate direction.
    pub fn assess_metrics_trend(&self) -> Result<PerformanceTrend> {
        let snapshots = self.journal.recent_snapshots(METRICS_WINDOW)?;
        if snapshots.is_empty() {
            return Ok(PerformanceTrend::default());
        }

        let samples = snapshots.len();
        let avg_error_rate =
            snapshots.iter().map(|s| s.error_rate).sum::<f64>() / samples as f64;
        let avg_response_time =
            snapshots.iter().map(|s| s.response_time).sum::<f64>() / samples as f64;
        // Snapshots arrive oldest first.
        let error_rate_delta =
            snapshots[samples - 1].error_rate - snapshots[0].error_rate;

        Ok(PerformanceTrend {
            samples,
            avg_error_rate,
            avg_response_time,
            error_rate_delta,
        })
    }

    /// Rule-based bottleneck detection over journal size, tool count and
    /// host memory/disk pressure.
    pub fn identify_bottlenecks(&self) -> Result<Vec<String>> {
        let action_rows = self.journal.action_count()?;
        let tool_count = self.journal.tool_count()?;

        let mut system = System::new();
        system.refresh_memory();
        let memory_pct = if system.total_memory() == 0 {
            0.0
        } else {
            system.used_memory() as f64 / system.total_memory() as f64 * 100.0
        };

        let disks = Disks::new_with_refreshed_list();
        let disk_pct = disks
            .list()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let used = d.total_space() - d.available_space();
                used as f64 / d.total_space() as f64 * 100.0
            })
            .fold(0.0f64, f64::max);

        Ok(evaluate_bottleneck_rules(
            action_rows,
            tool_count,
            memory_pct,
            disk_pct,
        ))
    }

    /// For each action that recurred beyond the threshold in the recent
    /// window, ask the router whether it should be automated, optimized
    /// or eliminated. Router failures leave the suggestion empty; the
    /// opportunity is still reported.
    pub async fn find_improvement_opportunities(&self) -> Result<Vec<Opportunity>> {
        let recurring = self
            .journal
            .recurring_actions(RECURRENCE_THRESHOLD, RECURRENCE_WINDOW_DAYS)?;

        let mut opportunities = Vec::with_capacity(recurring.len());
        for (action, occurrences) in recurring {
            let prompt = format!(
                "The action '{action}' ran {occurrences} times in the past \
                 {RECURRENCE_WINDOW_DAYS} days. Should it be automated, optimized, \
                 or eliminated? Answer in one short paragraph."
            );
            let suggestion = match self
                .router
                .call_routed("analysis", TaskComplexity::Medium, &prompt, ANALYST_PROMPT)
                .await
            {
                Ok(text) => Some(text.trim().to_string()),
                Err(e) => {
                    warn!(action = action.as_str(), "opportunity suggestion failed: {:#}", e);
                    None
                }
            };
            opportunities.push(Opportunity {
                action,
                occurrences,
                suggestion,
            });
        }
        Ok(opportunities)
    }

    /// Parse one module's source, compute per-function complexity, flag
    /// anything above the threshold, and ask the router for improvement
    /// suggestions on the flagged functions.
    pub async fn analyze_own_code(&self, module_name: &str) -> Result<CodeAnalysis> {
        let module = self
            .modules
            .iter()
            .find(|m| m.name == module_name)
            .ok_or_else(|| anyhow!("unknown module: {module_name}"))?;

        let source = fs::read_to_string(&module.path)?;
        let functions = analyzer::function_complexities(&source)?;
        let flagged: Vec<FunctionComplexity> = functions
            .iter()
            .filter(|f| f.complexity > COMPLEXITY_FLAG_THRESHOLD)
            .cloned()
            .collect();

        let suggestions = if flagged.is_empty() {
            None
        } else {
            let listing = flagged
                .iter()
                .map(|f| format!("- {} (complexity {}, line {})", f.name, f.complexity, f.line))
                .collect::<Vec<_>>()
                .join("\n");
            let prompt = format!(
                "These functions in module '{module_name}' exceed the cyclomatic \
                 complexity threshold of {COMPLEXITY_FLAG_THRESHOLD}:\n{listing}\n\
                 Suggest concrete refactorings to reduce their complexity."
            );
            match self
                .router
                .call_routed("analysis", TaskComplexity::Medium, &prompt, ANALYST_PROMPT)
                .await
            {
                Ok(text) => Some(text.trim().to_string()),
                Err(e) => {
                    warn!(module = module_name, "suggestion call failed: {:#}", e);
                    None
                }
            }
        };

        debug!(
            module = module_name,
            functions = functions.len(),
            flagged = flagged.len(),
            "code analysis complete"
        );

        Ok(CodeAnalysis {
            module: module_name.to_string(),
            functions,
            flagged,
            suggestions,
        })
    }

    /// Turn bottlenecks, opportunities and the metrics trend into a
    /// prioritized action list, highest priority first.
    pub fn generate_improvement_plan(
        &self,
        bottlenecks: &[String],
        opportunities: &[Opportunity],
        trend: &PerformanceTrend,
    ) -> Vec<ImprovementAction> {
        let mut plan = Vec::new();

        if trend.samples >= 2 && trend.error_rate_delta > TREND_DEGRADATION_LIMIT {
            plan.push(ImprovementAction {
                priority: ActionPriority::High,
                title: format!(
                    "arrest the rising error rate (+{:.1} points over {} snapshots)",
                    trend.error_rate_delta * 100.0,
                    trend.samples
                ),
                steps: vec![
                    "inspect the error-outcome actions since the oldest snapshot".to_string(),
                    "correlate with recent evolution cycles and tool changes".to_string(),
                    "roll back or disable the regressing behavior".to_string(),
                ],
            });
        }

        for bottleneck in bottlenecks {
            plan.push(ImprovementAction {
                priority: ActionPriority::High,
                title: format!("resolve bottleneck: {bottleneck}"),
                steps: vec![
                    "measure the current impact".to_string(),
                    "apply the smallest change that relieves the limit".to_string(),
                    "re-run diagnosis to confirm".to_string(),
                ],
            });
        }

        for opportunity in opportunities {
            let mut steps = vec![format!(
                "review the {} recent occurrences of '{}'",
                opportunity.occurrences, opportunity.action
            )];
            if let Some(suggestion) = &opportunity.suggestion {
                steps.push(format!("apply suggestion: {suggestion}"));
            }
            steps.push("automate or retire the action".to_string());
            plan.push(ImprovementAction {
                priority: ActionPriority::Medium,
                title: format!("streamline recurring action '{}'", opportunity.action),
                steps,
            });
        }

        plan.sort_by_key(|a| a.priority);
        plan
    }

    /// Compose module assessment, performance aggregates, bottlenecks,
    /// opportunities and the improvement plan into one report, and
    /// record the run in the journal.
    pub async fn perform_full_diagnosis(&self) -> Result<DiagnosisReport> {
        let modules = self.assess_modules();
        let performance = self.assess_performance()?;
        let trend = self.assess_metrics_trend()?;
        let bottlenecks = self.identify_bottlenecks()?;
        let opportunities = self.find_improvement_opportunities().await?;
        let plan = self.generate_improvement_plan(&bottlenecks, &opportunities, &trend);

        let unhealthy = modules
            .iter()
            .filter(|m| m.status == ModuleStatus::Error)
            .count();
        let report = DiagnosisReport {
            timestamp: Utc::now().to_rfc3339(),
            modules,
            performance,
            trend,
            bottlenecks,
            opportunities,
            plan,
        };

        self.journal.log_action(
            "self_diagnosis",
            &format!(
                "modules={} unhealthy={} error_rate={:.3} trend_samples={} trend_delta={:+.3} bottlenecks={} opportunities={}",
                report.modules.len(),
                unhealthy,
                report.performance.error_rate(),
                report.trend.samples,
                report.trend.error_rate_delta,
                report.bottlenecks.len(),
                report.opportunities.len()
            ),
            outcome::COMPLETED,
            0.0,
        )?;

        self.bus.publish(
            EventKind::DiagnosisCompleted,
            json!({
                "bottlenecks": report.bottlenecks.len(),
                "opportunities": report.opportunities.len(),
                "error_rate": report.performance.error_rate(),
            }),
            "diagnosis",
        );
        if !report.plan.is_empty() {
            self.bus.publish(
                EventKind::DiagnosisActionRequired,
                json!({ "actions": report.plan.len() }),
                "diagnosis",
            );
        }

        info!(
            bottlenecks = report.bottlenecks.len(),
            opportunities = report.opportunities.len(),
            "full diagnosis complete"
        );
        Ok(report)
    }
}

fn load_and_count(path: &Path) -> Result<usize> {
    let source = fs::read_to_string(path)
        .map_err(|e| anyhow!("cannot read {}: {e}", path.display()))?;
    if analyzer::has_parse_errors(&source)? {
        return Err(anyhow!("syntax errors in {}", path.display()));
    }
    analyzer::count_public_functions(&source)
}

/// The fixed bottleneck rules, separated from measurement for testing.
fn evaluate_bottleneck_rules(
    action_rows: i64,
    tool_count: i64,
    memory_pct: f64,
    disk_pct: f64,
) -> Vec<String> {
    let mut bottlenecks = Vec::new();
    if action_rows > JOURNAL_ROW_LIMIT {
        bottlenecks.push(format!(
            "journal has {action_rows} action rows (limit {JOURNAL_ROW_LIMIT}); compaction recommended"
        ));
    }
    if tool_count > TOOL_COUNT_LIMIT {
        bottlenecks.push(format!(
            "tool registry holds {tool_count} tools (limit {TOOL_COUNT_LIMIT}); prune unused tools"
        ));
    }
    if memory_pct > MEMORY_LIMIT_PCT {
        bottlenecks.push(format!("memory usage at {memory_pct:.0}%"));
    }
    if disk_pct > DISK_LIMIT_PCT {
        bottlenecks.push(format!("disk usage at {disk_pct:.0}%"));
    }
    bottlenecks
}

const ANALYST_PROMPT: &str =
    "You are the self-analysis assistant of an autonomous agent runtime. Be specific and brief.";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::ledger::Ledger;
    use crate::router::testing::ScriptedTransport;
    use crate::router::{backend_table, BackendReply};
    use std::io::Write;

    fn fixture(replies: Vec<Result<BackendReply>>) -> (Diagnosis, Arc<Journal>) {
        let journal = Arc::new(Journal::open_in_memory(100.0).unwrap());
        let bus = Arc::new(EventBus::new());
        let ledger = Arc::new(Ledger::new(Arc::clone(&journal), Arc::clone(&bus), 10.0));
        let router = Arc::new(ModelRouter::new(
            backend_table(&RuntimeConfig::default()),
            Arc::new(ScriptedTransport::new(replies)),
            ledger,
            Arc::clone(&journal),
        ));
        (
            Diagnosis::new(Arc::clone(&journal), router, bus),
            journal,
        )
    }

    #[test]
    fn test_bottleneck_rules() {
        assert!(evaluate_bottleneck_rules(100, 5, 50.0, 50.0).is_empty());

        let hits = evaluate_bottleneck_rules(10_001, 21, 86.0, 91.0);
        assert_eq!(hits.len(), 4);
        assert!(hits[0].contains("journal"));
        assert!(hits[1].contains("tool registry"));
        assert!(hits[2].contains("memory"));
        assert!(hits[3].contains("disk"));
    }

    #[test]
    fn test_assess_modules_reports_errors_for_missing_sources() {
        let journal = Arc::new(Journal::open_in_memory(100.0).unwrap());
        let bus = Arc::new(EventBus::new());
        let ledger = Arc::new(Ledger::new(Arc::clone(&journal), Arc::clone(&bus), 10.0));
        let router = Arc::new(ModelRouter::new(
            backend_table(&RuntimeConfig::default()),
            Arc::new(ScriptedTransport::new(vec![])),
            ledger,
            Arc::clone(&journal),
        ));

        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.rs");
        let mut f = fs::File::create(&good).unwrap();
        writeln!(f, "pub fn one() {{}}\npub fn two() {{}}\nfn three() {{}}").unwrap();

        let diagnosis = Diagnosis::with_modules(
            journal,
            router,
            bus,
            vec![
                ModuleSource {
                    name: "good".to_string(),
                    path: good,
                },
                ModuleSource {
                    name: "missing".to_string(),
                    path: dir.path().join("missing.rs"),
                },
            ],
        );

        let health = diagnosis.assess_modules();
        assert_eq!(health.len(), 2);
        assert_eq!(health[0].status, ModuleStatus::Healthy);
        assert_eq!(health[0].methods, 2);
        assert_eq!(health[1].status, ModuleStatus::Error);
        assert!(health[1].last_error.is_some());
    }

    #[tokio::test]
    async fn test_opportunities_from_recurring_actions() {
        let (diagnosis, journal) = fixture(vec![ScriptedTransport::reply(
            "Automate it with a scheduled task.",
            Some(10),
        )]);

        for _ in 0..5 {
            journal
                .log_action("rebuild_cache", "routine", outcome::COMPLETED, 0.0)
                .unwrap();
        }

        let opportunities = diagnosis.find_improvement_opportunities().await.unwrap();
        assert_eq!(opportunities.len(), 1);
        assert_eq!(opportunities[0].action, "rebuild_cache");
        assert_eq!(opportunities[0].occurrences, 5);
        assert_eq!(
            opportunities[0].suggestion.as_deref(),
            Some("Automate it with a scheduled task.")
        );
    }

    #[tokio::test]
    async fn test_opportunity_survives_router_failure() {
        let (diagnosis, journal) = fixture(vec![Err(crate::error::CoreError::model(
            "local-general",
            "down",
        )
        .into())]);

        for _ in 0..4 {
            journal
                .log_action("poll_inbox", "routine", outcome::COMPLETED, 0.0)
                .unwrap();
        }

        let opportunities = diagnosis.find_improvement_opportunities().await.unwrap();
        assert_eq!(opportunities.len(), 1);
        assert!(opportunities[0].suggestion.is_none());
    }

    #[tokio::test]
    async fn test_analyze_own_code_flags_complex_functions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tangled.rs");
        // Eleven ifs: complexity 12, above the threshold of 10.
        let mut source = String::from("pub fn tangled(x: i32) -> i32 {\n  let mut n = 0;\n");
        for i in 0..11 {
            source.push_str(&format!("  if x > {i} {{ n += 1; }}\n"));
        }
        source.push_str("  n\n}\n");
        fs::write(&path, &source).unwrap();

        let journal = Arc::new(Journal::open_in_memory(100.0).unwrap());
        let bus = Arc::new(EventBus::new());
        let ledger = Arc::new(Ledger::new(Arc::clone(&journal), Arc::clone(&bus), 10.0));
        let router = Arc::new(ModelRouter::new(
            backend_table(&RuntimeConfig::default()),
            Arc::new(ScriptedTransport::new(vec![ScriptedTransport::reply(
                "Split the cascade into a lookup table.",
                Some(12),
            )])),
            ledger,
            Arc::clone(&journal),
        ));
        let diagnosis = Diagnosis::with_modules(
            journal,
            router,
            bus,
            vec![ModuleSource {
                name: "tangled".to_string(),
                path,
            }],
        );

        let analysis = diagnosis.analyze_own_code("tangled").await.unwrap();
        assert_eq!(analysis.functions.len(), 1);
        assert_eq!(analysis.functions[0].complexity, 12);
        assert_eq!(analysis.flagged.len(), 1);
        assert!(analysis.suggestions.is_some());
    }

    #[tokio::test]
    async fn test_full_diagnosis_writes_action_row_and_reads_metrics() {
        let (diagnosis, journal) = fixture(vec![]);
        journal
            .insert_performance_snapshot(&PerformanceSnapshot {
                id: 0,
                timestamp: Utc::now().to_rfc3339(),
                error_rate: 0.05,
                response_time: 0.2,
                task_completion_rate: 0.95,
                autonomous_actions: 10,
                goals_completed: 0,
                evolutions_executed: 0,
            })
            .unwrap();

        let report = diagnosis.perform_full_diagnosis().await.unwrap();
        assert!(report.opportunities.is_empty());

        // The recorded metrics series feeds the report.
        assert_eq!(report.trend.samples, 1);
        assert!((report.trend.avg_error_rate - 0.05).abs() < 1e-9);
        assert!((report.trend.avg_response_time - 0.2).abs() < 1e-9);

        let actions = journal.recent_actions(10).unwrap();
        let row = actions
            .iter()
            .find(|a| a.action == "self_diagnosis")
            .expect("diagnosis action row");
        assert_eq!(row.outcome, "completed");
        assert!(row.reasoning.contains("trend_samples=1"));
    }

    #[test]
    fn test_metrics_trend_over_snapshots() {
        let (diagnosis, journal) = fixture(vec![]);
        assert_eq!(diagnosis.assess_metrics_trend().unwrap().samples, 0);

        for (error_rate, response_time) in [(0.02, 0.1), (0.04, 0.3), (0.12, 0.2)] {
            journal
                .insert_performance_snapshot(&PerformanceSnapshot {
                    id: 0,
                    timestamp: Utc::now().to_rfc3339(),
                    error_rate,
                    response_time,
                    task_completion_rate: 1.0 - error_rate,
                    autonomous_actions: 5,
                    goals_completed: 0,
                    evolutions_executed: 0,
                })
                .unwrap();
        }

        let trend = diagnosis.assess_metrics_trend().unwrap();
        assert_eq!(trend.samples, 3);
        assert!((trend.avg_error_rate - 0.06).abs() < 1e-9);
        assert!((trend.avg_response_time - 0.2).abs() < 1e-9);
        assert!((trend.error_rate_delta - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_improvement_plan_is_priority_sorted() {
        let (diagnosis, _journal) = fixture(vec![]);
        let plan = diagnosis.generate_improvement_plan(
            &["journal too large".to_string()],
            &[Opportunity {
                action: "x".to_string(),
                occurrences: 4,
                suggestion: None,
            }],
            &PerformanceTrend::default(),
        );
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].priority, ActionPriority::High);
        assert_eq!(plan[1].priority, ActionPriority::Medium);
        assert!(!plan[0].steps.is_empty());
    }

    #[test]
    fn test_worsening_trend_earns_high_priority_action() {
        let (diagnosis, _journal) = fixture(vec![]);
        let trend = PerformanceTrend {
            samples: 4,
            avg_error_rate: 0.15,
            avg_response_time: 0.3,
            error_rate_delta: 0.08,
        };
        let plan = diagnosis.generate_improvement_plan(&[], &[], &trend);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].priority, ActionPriority::High);
        assert!(plan[0].title.contains("error rate"));
    }
}
