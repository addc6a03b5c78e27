//! Default scheduled tasks.
//!
//! The standing maintenance cadence of the runtime. The last three
//! registrations (capability discovery, intent prediction, environment
//! exploration) are thin journal writers: their rich consumers live
//! outside the core and subscribe through the bus and journal.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use crate::diagnosis::Diagnosis;
use crate::events::EventBus;
use crate::evolution::{EvolutionPipeline, ToolForge};
use crate::journal::{Journal, REQUIRED_TABLES};
use crate::ledger::Ledger;
use crate::types::{DialoguePhase, EventKind, PerformanceSnapshot};

use super::{Scheduler, TaskInterval};

/// Handles the default tasks close over.
pub struct DefaultTaskDeps {
    pub journal: Arc<Journal>,
    pub ledger: Arc<Ledger>,
    pub diagnosis: Arc<Diagnosis>,
    pub evolution: Arc<EvolutionPipeline>,
    pub forge: Arc<ToolForge>,
    pub bus: Arc<EventBus>,
}

/// Register the standing task set with its cadences and priorities.
pub fn register_default_tasks(scheduler: &Scheduler, deps: &DefaultTaskDeps) {
    // System health probe: journal reachable, every table answers.
    {
        let journal = Arc::clone(&deps.journal);
        let bus = Arc::clone(&deps.bus);
        scheduler.register(
            "system_health_probe",
            TaskInterval::Minutes(30),
            1,
            true,
            move || {
                let journal = Arc::clone(&journal);
                let bus = Arc::clone(&bus);
                Box::pin(async move {
                    for table in REQUIRED_TABLES {
                        journal.table_count(table)?;
                    }
                    let actions = journal.action_count()?;
                    bus.publish(
                        EventKind::HealthCheck,
                        json!({ "tables": REQUIRED_TABLES.len(), "actions": actions }),
                        "scheduler",
                    );
                    Ok(format!(
                        "all {} tables queryable, {actions} actions recorded",
                        REQUIRED_TABLES.len()
                    ))
                })
            },
        );
    }

    // Economic review: balance trend and a risk note when low.
    {
        let journal = Arc::clone(&deps.journal);
        let ledger = Arc::clone(&deps.ledger);
        scheduler.register(
            "economic_review",
            TaskInterval::Hours(1),
            2,
            true,
            move || {
                let journal = Arc::clone(&journal);
                let ledger = Arc::clone(&ledger);
                Box::pin(async move {
                    let balance = ledger.balance()?;
                    let recent = journal.recent_transactions(20)?;
                    let spent: f64 = recent
                        .iter()
                        .filter(|t| t.amount_signed < 0.0)
                        .map(|t| -t.amount_signed)
                        .sum();
                    if balance < ledger.threshold() {
                        journal.append_dialogue(
                            DialoguePhase::Risk,
                            &format!("balance {balance:.4} is below the threshold"),
                            None,
                            "economic review",
                        )?;
                    }
                    Ok(format!(
                        "balance {balance:.4}, {spent:.4} spent across last {} transactions",
                        recent.len()
                    ))
                })
            },
        );
    }

    // Reflection over the last day of actions.
    {
        let journal = Arc::clone(&deps.journal);
        let bus = Arc::clone(&deps.bus);
        scheduler.register("reflection", TaskInterval::Hours(24), 3, true, move || {
            let journal = Arc::clone(&journal);
            let bus = Arc::clone(&bus);
            Box::pin(async move {
                bus.publish(EventKind::ReflectionStarted, json!({}), "scheduler");
                let recent = journal.recent_actions(200)?;
                let mut by_outcome: HashMap<String, usize> = HashMap::new();
                for action in &recent {
                    *by_outcome.entry(action.outcome.clone()).or_insert(0) += 1;
                }
                let errors = by_outcome.get("error").copied().unwrap_or(0);
                let summary = format!(
                    "{} recent actions, {} distinct outcomes, {errors} errors",
                    recent.len(),
                    by_outcome.len()
                );
                journal.append_dialogue(
                    DialoguePhase::Understanding,
                    &summary,
                    None,
                    "daily reflection",
                )?;
                bus.publish(
                    EventKind::ReflectionCompleted,
                    json!({ "actions": recent.len(), "errors": errors }),
                    "scheduler",
                );
                Ok(summary)
            })
        });
    }

    // Tool maintenance: registry and artifacts stay in lockstep.
    {
        let forge = Arc::clone(&deps.forge);
        scheduler.register(
            "tool_maintenance",
            TaskInterval::Hours(6),
            2,
            true,
            move || {
                let forge = Arc::clone(&forge);
                Box::pin(async move { forge.sync_registry() })
            },
        );
    }

    // Evolution check: the pipeline's gate decides whether to run.
    {
        let evolution = Arc::clone(&deps.evolution);
        scheduler.register(
            "evolution_check",
            TaskInterval::Hours(24),
            2,
            true,
            move || {
                let evolution = Arc::clone(&evolution);
                Box::pin(async move {
                    let outcome = evolution.run_autonomous_evolution().await?;
                    Ok(match outcome.reason {
                        Some(reason) => format!("{}: {reason}", outcome.status.as_str()),
                        None => format!(
                            "{} ({} tasks executed)",
                            outcome.status.as_str(),
                            outcome.executions.len()
                        ),
                    })
                })
            },
        );
    }

    // Self-diagnosis.
    {
        let diagnosis = Arc::clone(&deps.diagnosis);
        scheduler.register(
            "self_diagnosis",
            TaskInterval::Hours(6),
            3,
            true,
            move || {
                let diagnosis = Arc::clone(&diagnosis);
                Box::pin(async move {
                    let report = diagnosis.perform_full_diagnosis().await?;
                    Ok(format!(
                        "{} bottlenecks, {} opportunities, error rate {:.1}%",
                        report.bottlenecks.len(),
                        report.opportunities.len(),
                        report.performance.error_rate() * 100.0
                    ))
                })
            },
        );
    }

    // Performance snapshot into the metrics time series.
    {
        let journal = Arc::clone(&deps.journal);
        scheduler.register(
            "performance_snapshot",
            TaskInterval::Hours(1),
            2,
            true,
            move || {
                let journal = Arc::clone(&journal);
                Box::pin(async move {
                    // Time the aggregate probe itself: journal latency is
                    // the response time every subsystem pays per decision.
                    let probe_started = std::time::Instant::now();
                    let stats = journal.action_statistics()?;
                    let response_time = probe_started.elapsed().as_secs_f64();

                    let goals_completed = journal.goals_completed_count()?;
                    let evolutions: i64 = journal
                        .get_state("evolutions_executed")?
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    journal.insert_performance_snapshot(&PerformanceSnapshot {
                        id: 0,
                        timestamp: chrono::Utc::now().to_rfc3339(),
                        error_rate: stats.error_rate(),
                        response_time,
                        task_completion_rate: if stats.total_actions == 0 {
                            1.0
                        } else {
                            1.0 - stats.error_rate()
                        },
                        autonomous_actions: stats.recent_hour_count,
                        goals_completed,
                        evolutions_executed: evolutions,
                    })?;
                    Ok(format!(
                        "snapshot: error rate {:.3}, probe {response_time:.4}s, {} actions in the last hour",
                        stats.error_rate(),
                        stats.recent_hour_count
                    ))
                })
            },
        );
    }

    // Thin registrations: out-of-scope consumers read these journal
    // trails through the bus and the tables.
    {
        let journal = Arc::clone(&deps.journal);
        scheduler.register(
            "capability_discovery",
            TaskInterval::Hours(48),
            3,
            true,
            move || {
                let journal = Arc::clone(&journal);
                Box::pin(async move {
                    let known = journal.list_capabilities()?.len();
                    journal.log_action(
                        "capability_discovery",
                        &format!("{known} capabilities in the catalog; discovery pass due"),
                        "executing",
                        0.0,
                    )?;
                    Ok(format!("{known} capabilities catalogued"))
                })
            },
        );
    }
    {
        let journal = Arc::clone(&deps.journal);
        scheduler.register(
            "intent_prediction",
            TaskInterval::Hours(12),
            3,
            true,
            move || {
                let journal = Arc::clone(&journal);
                Box::pin(async move {
                    let dialogues = journal.recent_dialogues(50)?;
                    Ok(format!(
                        "{} dialogue entries available for intent modelling",
                        dialogues.len()
                    ))
                })
            },
        );
    }
    {
        let journal = Arc::clone(&deps.journal);
        scheduler.register(
            "environment_exploration",
            TaskInterval::Hours(24),
            3,
            true,
            move || {
                let journal = Arc::clone(&journal);
                Box::pin(async move {
                    journal.log_action(
                        "environment_exploration",
                        "environment probe window open",
                        "executing",
                        0.0,
                    )?;
                    Ok("environment probe recorded".to_string())
                })
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::diagnosis::ModuleSource;
    use crate::evolution::EvolutionArtifacts;
    use crate::evolution::ModuleModifier;
    use crate::router::testing::ScriptedTransport;
    use crate::router::{backend_table, ModelRouter};

    fn deps(dir: &tempfile::TempDir) -> (DefaultTaskDeps, Arc<Journal>, Arc<EventBus>) {
        let module_path = dir.path().join("m.rs");
        std::fs::write(&module_path, "pub fn entry() {}\n").unwrap();
        let modules = vec![ModuleSource {
            name: "m".to_string(),
            path: module_path,
        }];

        let journal = Arc::new(Journal::open_in_memory(100.0).unwrap());
        let bus = Arc::new(EventBus::new());
        let ledger = Arc::new(Ledger::new(Arc::clone(&journal), Arc::clone(&bus), 10.0));
        let router = Arc::new(ModelRouter::new(
            backend_table(&RuntimeConfig::default()),
            Arc::new(ScriptedTransport::new(vec![])),
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
        let evolution = Arc::new(EvolutionPipeline::new(
            Arc::clone(&journal),
            Arc::clone(&router),
            Arc::clone(&diagnosis),
            Arc::clone(&forge),
            modifier,
            Arc::clone(&bus),
            EvolutionArtifacts::new(dir.path().join("data")).unwrap(),
            1,
        ));

        (
            DefaultTaskDeps {
                journal: Arc::clone(&journal),
                ledger,
                diagnosis,
                evolution,
                forge,
                bus: Arc::clone(&bus),
            },
            journal,
            bus,
        )
    }

    #[test]
    fn test_default_registrations() {
        let dir = tempfile::tempdir().unwrap();
        let (deps, journal, bus) = deps(&dir);
        let scheduler = Scheduler::new(journal, bus, 60);
        register_default_tasks(&scheduler, &deps);

        let status = scheduler.task_status();
        assert_eq!(status.len(), 10);

        let find = |name: &str| status.iter().find(|t| t.name == name).unwrap();
        assert_eq!(find("system_health_probe").interval, "30m");
        assert_eq!(find("system_health_probe").priority, 1);
        assert_eq!(find("economic_review").interval, "1h");
        assert_eq!(find("reflection").interval, "24h");
        assert_eq!(find("tool_maintenance").interval, "6h");
        assert_eq!(find("evolution_check").interval, "24h");
        assert_eq!(find("self_diagnosis").interval, "6h");
        assert_eq!(find("performance_snapshot").interval, "1h");
        assert_eq!(find("capability_discovery").interval, "48h");
        assert_eq!(find("intent_prediction").interval, "12h");
        assert_eq!(find("environment_exploration").interval, "24h");
        assert!(status.iter().all(|t| t.enabled));
    }

    #[tokio::test]
    async fn test_health_probe_and_snapshot_run() {
        let dir = tempfile::tempdir().unwrap();
        let (deps, journal, bus) = deps(&dir);
        let scheduler = Scheduler::new(Arc::clone(&journal), bus, 60);
        register_default_tasks(&scheduler, &deps);

        // Everything becomes due two days in.
        let ran = scheduler
            .run_due(chrono::Utc::now() + chrono::Duration::hours(49))
            .await;
        assert_eq!(ran, 10);

        // The snapshot task wrote a metrics row with a measured probe
        // latency.
        let snapshots = journal.recent_snapshots(5).unwrap();
        assert!(!snapshots.is_empty());
        assert!(snapshots[0].response_time > 0.0);

        // Every task left a completed action row (evolution skipped
        // counts as a completed check).
        let actions = journal.recent_actions(100).unwrap();
        let task_rows: Vec<_> = actions
            .iter()
            .filter(|a| a.action.starts_with("task:"))
            .collect();
        assert_eq!(task_rows.len(), 10);
        assert!(task_rows.iter().all(|a| a.outcome == "completed"));
    }
}
