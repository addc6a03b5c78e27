//! Composition root.
//!
//! The subsystems form a dependency DAG with mutual references at the
//! top; this container owns every instance and hands out `Arc` handles
//! by constructor injection. Subsystems never construct each other.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::diagnosis::{default_module_sources, Diagnosis};
use crate::events::EventBus;
use crate::evolution::{EvolutionArtifacts, EvolutionPipeline, ModuleModifier, ToolForge};
use crate::journal::Journal;
use crate::ledger::Ledger;
use crate::router::{backend_table, HttpTransport, ModelRouter};
use crate::scheduler::{register_default_tasks, DefaultTaskDeps, Scheduler};

pub struct Runtime {
    pub config: RuntimeConfig,
    pub journal: Arc<Journal>,
    pub bus: Arc<EventBus>,
    pub ledger: Arc<Ledger>,
    pub router: Arc<ModelRouter>,
    pub scheduler: Arc<Scheduler>,
    pub diagnosis: Arc<Diagnosis>,
    pub forge: Arc<ToolForge>,
    pub modifier: Arc<ModuleModifier>,
    pub evolution: Arc<EvolutionPipeline>,
}

impl Runtime {
    /// Build the full subsystem graph, leaves first, and register the
    /// default task set.
    pub fn build(config: RuntimeConfig) -> Result<Self> {
        let journal = Arc::new(Journal::open(
            &config.resolved_db_path(),
            config.initial_balance,
        )?);
        let bus = Arc::new(EventBus::new());
        let ledger = Arc::new(Ledger::new(
            Arc::clone(&journal),
            Arc::clone(&bus),
            config.low_balance_threshold,
        ));

        let transport = Arc::new(HttpTransport::new(
            config.model_base_url.clone(),
            config.api_key.clone(),
        ));
        let router = Arc::new(ModelRouter::new(
            backend_table(&config),
            transport,
            Arc::clone(&ledger),
            Arc::clone(&journal),
        ));

        let diagnosis = Arc::new(Diagnosis::new(
            Arc::clone(&journal),
            Arc::clone(&router),
            Arc::clone(&bus),
        ));
        let forge = Arc::new(ToolForge::new(
            Arc::clone(&journal),
            Arc::clone(&router),
            Arc::clone(&ledger),
            Arc::clone(&bus),
            config.resolved_tools_dir(),
            config.tool_creation_cost,
        )?);
        let modifier = Arc::new(ModuleModifier::new(
            Arc::clone(&journal),
            config.resolved_backups_dir(),
            default_module_sources(),
            config.backup_before_modify,
        )?);
        let evolution = Arc::new(EvolutionPipeline::new(
            Arc::clone(&journal),
            Arc::clone(&router),
            Arc::clone(&diagnosis),
            Arc::clone(&forge),
            Arc::clone(&modifier),
            Arc::clone(&bus),
            EvolutionArtifacts::new(config.resolved_data_dir())?,
            config.evolution_max_retries,
        ));

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&journal),
            Arc::clone(&bus),
            config.tick_secs,
        ));
        register_default_tasks(
            &scheduler,
            &DefaultTaskDeps {
                journal: Arc::clone(&journal),
                ledger: Arc::clone(&ledger),
                diagnosis: Arc::clone(&diagnosis),
                evolution: Arc::clone(&evolution),
                forge: Arc::clone(&forge),
                bus: Arc::clone(&bus),
            },
        );

        info!(
            tasks = scheduler.task_count(),
            db = config.db_path.as_str(),
            "runtime assembled"
        );

        Ok(Self {
            config,
            journal,
            bus,
            ledger,
            router,
            scheduler,
            diagnosis,
            forge,
            modifier,
            evolution,
        })
    }

    pub fn start(&self) {
        self.scheduler.start();
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
    }
}
