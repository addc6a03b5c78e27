//! Evolution artifacts on disk.
//!
//! The pipeline owns three JSON files under the data directory: the
//! plan history (capped at the last 10 plans), the knowledge file of
//! accumulated lessons, and the pre-evolution checkpoint. The journal
//! never touches these.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::debug;

use crate::types::{EvolutionCheckpoint, EvolutionKnowledge, EvolutionPlan, Lesson};

/// Number of plans retained in the history file.
pub const PLAN_HISTORY_CAP: usize = 10;

const HISTORY_FILE: &str = "evolution.json";
const KNOWLEDGE_FILE: &str = "evolution_knowledge.json";
const CHECKPOINT_FILE: &str = "evolution_checkpoint.json";

/// Prefixes of scratch files the cleanup phase removes.
const TEMP_PREFIXES: &[&str] = &["tmp_", "diagnosis_", "patch_"];

pub struct EvolutionArtifacts {
    data_dir: PathBuf,
}

impl EvolutionArtifacts {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        Ok(Self { data_dir })
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join(HISTORY_FILE)
    }

    pub fn knowledge_path(&self) -> PathBuf {
        self.data_dir.join(KNOWLEDGE_FILE)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join(CHECKPOINT_FILE)
    }

    // ─── Plan history ────────────────────────────────────────────

    pub fn load_plans(&self) -> Result<Vec<EvolutionPlan>> {
        read_json_or_default(&self.history_path())
    }

    /// Append a plan, keeping only the most recent
    /// [`PLAN_HISTORY_CAP`] entries.
    pub fn append_plan(&self, plan: &EvolutionPlan) -> Result<()> {
        let mut plans = self.load_plans()?;
        plans.push(plan.clone());
        if plans.len() > PLAN_HISTORY_CAP {
            let excess = plans.len() - PLAN_HISTORY_CAP;
            plans.drain(..excess);
        }
        write_json(&self.history_path(), &plans)
    }

    // ─── Knowledge ───────────────────────────────────────────────

    pub fn load_knowledge(&self) -> Result<EvolutionKnowledge> {
        read_json_or_default(&self.knowledge_path())
    }

    /// Append the cycle's lessons and bump the cycle counter.
    pub fn append_lessons(&self, lessons: &[Lesson]) -> Result<EvolutionKnowledge> {
        let mut knowledge = self.load_knowledge()?;
        knowledge.lessons.extend(lessons.iter().cloned());
        knowledge.total_cycles += 1;
        knowledge.last_update = Utc::now().to_rfc3339();
        write_json(&self.knowledge_path(), &knowledge)?;
        Ok(knowledge)
    }

    // ─── Checkpoint ──────────────────────────────────────────────

    /// Overwrite the checkpoint with the pre-evolution snapshot.
    pub fn write_checkpoint(&self, checkpoint: &EvolutionCheckpoint) -> Result<()> {
        write_json(&self.checkpoint_path(), checkpoint)
    }

    pub fn read_checkpoint(&self) -> Result<Option<EvolutionCheckpoint>> {
        let path = self.checkpoint_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents).with_context(|| {
            format!("corrupt checkpoint at {}", path.display())
        })?))
    }

    // ─── Cleanup ─────────────────────────────────────────────────

    /// Remove scratch files left behind by a cycle. Backups are never
    /// touched. Returns the number of files removed.
    pub fn cleanup_temp(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let is_temp = TEMP_PREFIXES.iter().any(|p| name.starts_with(p))
                || name.ends_with(".tmp");
            if is_temp && entry.path().is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "removed temporary files");
        }
        Ok(removed)
    }
}

fn read_json_or_default<T: Default + serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)
        .with_context(|| format!("corrupt artifact at {}", path.display()))?)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
