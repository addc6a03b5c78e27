//! Persistent Journal
//!
//! SQLite-backed append-mostly store behind a single writer lock. The
//! journal is the source of truth for ordering of all side effects:
//! every subsystem writes an action row for each non-trivial decision,
//! and balance changes happen only through [`Journal::log_transaction`].

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::*;

use super::schema::{CREATE_TABLES, REQUIRED_TABLES, SCHEMA_VERSION, SEED_HIERARCHY};

/// The journal handle. All persistent state lives here; writers are
/// serialized through the internal mutex.
pub struct Journal {
    conn: Mutex<Connection>,
}

impl Journal {
    /// Open (or create) the journal at `db_path`, create the schema if
    /// needed, and seed initial state. Later opens are idempotent.
    pub fn open(db_path: &str, initial_balance: f64) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create journal directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open journal: {db_path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::initialize(conn, initial_balance)
    }

    /// Open an in-memory journal (used by tests).
    pub fn open_in_memory(initial_balance: f64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, initial_balance)
    }

    fn initialize(conn: Connection, initial_balance: f64) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .context("failed to create journal tables")?;

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, now],
        )?;

        // Seed the hierarchy of needs; exactly one tier carries focus.
        for (tier, name, description) in SEED_HIERARCHY {
            conn.execute(
                "INSERT OR IGNORE INTO hierarchy_of_needs (tier, name, description, current_focus, progress)
                 VALUES (?1, ?2, ?3, 0, 0)",
                params![tier, name, description],
            )?;
        }
        let focused: i64 = conn.query_row(
            "SELECT COUNT(*) FROM hierarchy_of_needs WHERE current_focus = 1",
            [],
            |row| row.get(0),
        )?;
        if focused == 0 {
            conn.execute(
                "UPDATE hierarchy_of_needs SET current_focus = 1 WHERE tier = 1",
                [],
            )?;
        }

        // Seed the authoritative balance on first open only.
        let has_balance: Option<String> = conn
            .query_row(
                "SELECT value FROM system_state WHERE key = 'current_balance'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if has_balance.is_none() {
            conn.execute(
                "INSERT INTO system_state (key, value, updated_at) VALUES ('current_balance', ?1, ?2)",
                params![initial_balance.to_string(), now],
            )?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ─── Action Log ──────────────────────────────────────────────

    /// Append a row to `action_log`. Returns the row id.
    pub fn log_action(&self, action: &str, reasoning: &str, outcome: &str, cost: f64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO action_log (timestamp, action, reasoning, outcome, cost)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![Utc::now().to_rfc3339(), action, reasoning, outcome, cost],
        )
        .context("failed to append action")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent_actions(&self, limit: i64) -> Result<Vec<ActionEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, action, reasoning, outcome, cost
             FROM action_log ORDER BY id DESC LIMIT ?1",
        )?;
        let mut entries: Vec<ActionEntry> = stmt
            .query_map(params![limit], |row| {
                Ok(ActionEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    action: row.get(2)?,
                    reasoning: row.get(3)?,
                    outcome: row.get(4)?,
                    cost: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        entries.reverse();
        Ok(entries)
    }

    pub fn action_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM action_log", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Aggregates over `action_log` for the performance assessment.
    pub fn action_statistics(&self) -> Result<ActionStatistics> {
        let conn = self.conn.lock().unwrap();
        let (total_actions, active_days, avg_action_length, avg_reasoning_length, error_count) =
            conn.query_row(
                "SELECT COUNT(*),
                        COUNT(DISTINCT date(timestamp)),
                        COALESCE(AVG(LENGTH(action)), 0),
                        COALESCE(AVG(LENGTH(reasoning)), 0),
                        COALESCE(SUM(CASE WHEN outcome LIKE '%error%' THEN 1 ELSE 0 END), 0)
                 FROM action_log",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )?;

        let hour_ago = (Utc::now() - Duration::hours(1)).to_rfc3339();
        let recent_hour_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM action_log WHERE timestamp >= ?1",
            params![hour_ago],
            |row| row.get(0),
        )?;

        Ok(ActionStatistics {
            total_actions,
            active_days,
            avg_action_length,
            avg_reasoning_length,
            error_count,
            recent_hour_count,
        })
    }

    /// Actions that recurred more than `min_count` times in the last
    /// `days` days, most frequent first.
    pub fn recurring_actions(&self, min_count: i64, days: i64) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap();
        let since = (Utc::now() - Duration::days(days)).to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT action, COUNT(*) AS occurrences
             FROM action_log WHERE timestamp >= ?1
             GROUP BY action HAVING occurrences > ?2
             ORDER BY occurrences DESC",
        )?;
        let rows = stmt
            .query_map(params![since, min_count], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Economic Log ────────────────────────────────────────────

    /// Append a transaction and atomically update the authoritative
    /// balance. This is the only way the balance changes. Returns the
    /// new balance.
    pub fn log_transaction(&self, description: &str, amount: f64, category: &str) -> Result<f64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let previous: f64 = tx
            .query_row(
                "SELECT value FROM system_state WHERE key = 'current_balance'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);

        let balance = previous + amount;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO economic_log (timestamp, description, amount_signed, balance_after, category)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![now, description, amount, balance, category],
        )?;
        tx.execute(
            "INSERT INTO system_state (key, value, updated_at) VALUES ('current_balance', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![balance.to_string(), now],
        )?;

        tx.commit().context("failed to commit transaction")?;
        Ok(balance)
    }

    /// The authoritative balance from `system_state`.
    pub fn current_balance(&self) -> Result<f64> {
        let conn = self.conn.lock().unwrap();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM system_state WHERE key = 'current_balance'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0.0))
    }

    pub fn recent_transactions(&self, limit: i64) -> Result<Vec<TransactionEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, description, amount_signed, balance_after, category
             FROM economic_log ORDER BY id DESC LIMIT ?1",
        )?;
        let mut entries: Vec<TransactionEntry> = stmt
            .query_map(params![limit], |row| {
                Ok(TransactionEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    description: row.get(2)?,
                    amount_signed: row.get(3)?,
                    balance_after: row.get(4)?,
                    category: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        entries.reverse();
        Ok(entries)
    }

    // ─── System State ────────────────────────────────────────────

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT value FROM system_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(result)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO system_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ─── Dialogue Log ────────────────────────────────────────────

    pub fn append_dialogue(
        &self,
        phase: DialoguePhase,
        content: &str,
        master_command: Option<&str>,
        reasoning: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO dialogue_log (timestamp, phase, content, master_command, reasoning)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Utc::now().to_rfc3339(),
                phase.as_str(),
                content,
                master_command,
                reasoning,
            ],
        )?;
        Ok(())
    }

    pub fn recent_dialogues(&self, limit: i64) -> Result<Vec<DialogueEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, phase, content, master_command, reasoning
             FROM dialogue_log ORDER BY id DESC LIMIT ?1",
        )?;
        let mut entries: Vec<DialogueEntry> = stmt
            .query_map(params![limit], |row| {
                let phase_str: String = row.get(2)?;
                Ok(DialogueEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    phase: serde_json::from_str(&format!("\"{}\"", phase_str))
                        .unwrap_or(DialoguePhase::Understanding),
                    content: row.get(3)?,
                    master_command: row.get(4)?,
                    reasoning: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        entries.reverse();
        Ok(entries)
    }

    // ─── Tools ───────────────────────────────────────────────────

    pub fn insert_tool(&self, name: &str, description: &str, file_path: &str) -> Result<ToolRecord> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO tools (name, description, file_path, created_at, usage_count)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![name, description, file_path, now],
        )
        .with_context(|| format!("failed to register tool '{name}'"))?;
        Ok(ToolRecord {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            description: description.to_string(),
            file_path: file_path.to_string(),
            created_at: now,
            last_used: None,
            usage_count: 0,
        })
    }

    pub fn get_tool(&self, name: &str) -> Result<Option<ToolRecord>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT id, name, description, file_path, created_at, last_used, usage_count
                 FROM tools WHERE name = ?1",
                params![name],
                |row| Ok(Self::deserialize_tool(row)),
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_tools(&self) -> Result<Vec<ToolRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, file_path, created_at, last_used, usage_count
             FROM tools ORDER BY name",
        )?;
        let tools = stmt
            .query_map([], |row| Ok(Self::deserialize_tool(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tools)
    }

    pub fn tool_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM tools", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn delete_tool(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM tools WHERE name = ?1", params![name])?;
        Ok(changed > 0)
    }

    /// Record a tool use: bump `usage_count` and stamp `last_used`.
    pub fn touch_tool(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tools SET usage_count = usage_count + 1, last_used = ?1 WHERE name = ?2",
            params![Utc::now().to_rfc3339(), name],
        )?;
        Ok(())
    }

    // ─── Master Model ────────────────────────────────────────────

    /// Upsert a learned trait with bounded reinforcement: confidence
    /// moves toward 1.0 by `delta` of the remaining headroom (or toward
    /// 0.0 for negative `delta`) and stays inside [0, 1].
    pub fn reinforce_trait(&self, trait_name: &str, value: &str, delta: f64) -> Result<f64> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();

        let existing: Option<(f64, i64)> = conn
            .query_row(
                "SELECT confidence, evidence_count FROM master_model WHERE trait = ?1",
                params![trait_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let confidence = match existing {
            Some((confidence, evidence_count)) => {
                let updated = if delta >= 0.0 {
                    confidence + delta * (1.0 - confidence)
                } else {
                    confidence + delta * confidence
                }
                .clamp(0.0, 1.0);
                conn.execute(
                    "UPDATE master_model
                     SET value = ?1, confidence = ?2, evidence_count = ?3, last_updated = ?4
                     WHERE trait = ?5",
                    params![value, updated, evidence_count + 1, now, trait_name],
                )?;
                updated
            }
            None => {
                let initial = (0.5 + delta).clamp(0.0, 1.0);
                conn.execute(
                    "INSERT INTO master_model (trait, value, confidence, evidence_count, last_updated)
                     VALUES (?1, ?2, ?3, 1, ?4)",
                    params![trait_name, value, initial, now],
                )?;
                initial
            }
        };
        Ok(confidence)
    }

    pub fn get_trait(&self, trait_name: &str) -> Result<Option<MasterTrait>> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT id, trait, value, confidence, evidence_count, last_updated
                 FROM master_model WHERE trait = ?1",
                params![trait_name],
                |row| {
                    Ok(MasterTrait {
                        id: row.get(0)?,
                        trait_name: row.get(1)?,
                        value: row.get(2)?,
                        confidence: row.get(3)?,
                        evidence_count: row.get(4)?,
                        last_updated: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    // ─── Hierarchy of Needs ──────────────────────────────────────

    /// The tier currently carrying focus.
    pub fn focus_tier(&self) -> Result<NeedTier> {
        let conn = self.conn.lock().unwrap();
        let tier = conn.query_row(
            "SELECT tier, name, description, current_focus, progress
             FROM hierarchy_of_needs WHERE current_focus = 1",
            [],
            |row| Ok(Self::deserialize_tier(row)),
        )?;
        Ok(tier)
    }

    /// Move focus to `tier`, keeping the single-focus invariant inside
    /// one transaction.
    pub fn set_focus_tier(&self, tier: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("UPDATE hierarchy_of_needs SET current_focus = 0", [])?;
        let changed = tx.execute(
            "UPDATE hierarchy_of_needs SET current_focus = 1 WHERE tier = ?1",
            params![tier],
        )?;
        if changed != 1 {
            bail!("no hierarchy tier {tier}");
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_tiers(&self) -> Result<Vec<NeedTier>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT tier, name, description, current_focus, progress
             FROM hierarchy_of_needs ORDER BY tier",
        )?;
        let tiers = stmt
            .query_map([], |row| Ok(Self::deserialize_tier(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tiers)
    }

    // ─── Goals ───────────────────────────────────────────────────

    pub fn insert_goal(
        &self,
        goal_text: &str,
        goal_type: &str,
        priority: i64,
        expected_benefit: &str,
        estimated_effort: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO goals (goal_text, goal_type, priority, status, created_at, progress, expected_benefit, estimated_effort)
             VALUES (?1, ?2, ?3, 'active', ?4, 0, ?5, ?6)",
            params![
                goal_text,
                goal_type,
                priority.clamp(1, 5),
                Utc::now().to_rfc3339(),
                expected_benefit,
                estimated_effort,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn complete_goal(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE goals SET status = 'completed', progress = 100, completed_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn active_goals(&self) -> Result<Vec<Goal>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, goal_text, goal_type, priority, status, created_at, completed_at, progress, expected_benefit, estimated_effort
             FROM goals WHERE status = 'active' ORDER BY priority, id",
        )?;
        let goals = stmt
            .query_map([], |row| Ok(Self::deserialize_goal(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(goals)
    }

    pub fn goals_completed_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM goals WHERE status = 'completed'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ─── Performance Metrics ─────────────────────────────────────

    pub fn insert_performance_snapshot(&self, snapshot: &PerformanceSnapshot) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO performance_metrics (timestamp, error_rate, response_time, task_completion_rate, autonomous_actions, goals_completed, evolutions_executed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.timestamp,
                snapshot.error_rate,
                snapshot.response_time,
                snapshot.task_completion_rate,
                snapshot.autonomous_actions,
                snapshot.goals_completed,
                snapshot.evolutions_executed,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent_snapshots(&self, limit: i64) -> Result<Vec<PerformanceSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, error_rate, response_time, task_completion_rate, autonomous_actions, goals_completed, evolutions_executed
             FROM performance_metrics ORDER BY id DESC LIMIT ?1",
        )?;
        let mut snapshots: Vec<PerformanceSnapshot> = stmt
            .query_map(params![limit], |row| {
                Ok(PerformanceSnapshot {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    error_rate: row.get(2)?,
                    response_time: row.get(3)?,
                    task_completion_rate: row.get(4)?,
                    autonomous_actions: row.get(5)?,
                    goals_completed: row.get(6)?,
                    evolutions_executed: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        snapshots.reverse();
        Ok(snapshots)
    }

    // ─── Strategy History ────────────────────────────────────────

    pub fn insert_strategy_record(&self, record: &StrategyRecord) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO strategy_history (timestamp, strategy_name, strategy_params, success_rate, tasks_completed, tasks_failed, execution_time_seconds, outcomes, lessons_learned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.timestamp,
                record.strategy_name,
                serde_json::to_string(&record.strategy_params)?,
                record.success_rate,
                record.tasks_completed,
                record.tasks_failed,
                record.execution_time_seconds,
                serde_json::to_string(&record.outcomes)?,
                record.lessons_learned,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent_strategies(&self, limit: i64) -> Result<Vec<StrategyRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, strategy_name, strategy_params, success_rate, tasks_completed, tasks_failed, execution_time_seconds, outcomes, lessons_learned
             FROM strategy_history ORDER BY id DESC LIMIT ?1",
        )?;
        let mut records: Vec<StrategyRecord> = stmt
            .query_map(params![limit], |row| {
                let params_json: String = row.get(3)?;
                let outcomes_json: String = row.get(8)?;
                Ok(StrategyRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    strategy_name: row.get(2)?,
                    strategy_params: serde_json::from_str(&params_json)
                        .unwrap_or(serde_json::Value::Null),
                    success_rate: row.get(4)?,
                    tasks_completed: row.get(5)?,
                    tasks_failed: row.get(6)?,
                    execution_time_seconds: row.get(7)?,
                    outcomes: serde_json::from_str(&outcomes_json)
                        .unwrap_or(serde_json::Value::Null),
                    lessons_learned: row.get(9)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }

    // ─── Capability Knowledge ────────────────────────────────────

    pub fn upsert_capability(
        &self,
        capability: &str,
        description: &str,
        value: i64,
        complexity: i64,
        dependencies: &serde_json::Value,
        status: CapabilityStatus,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO capability_knowledge (capability, description, value, complexity, dependencies, status, discovered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(capability) DO UPDATE SET
               description = excluded.description,
               value = excluded.value,
               complexity = excluded.complexity,
               dependencies = excluded.dependencies,
               status = excluded.status",
            params![
                capability,
                description,
                value.clamp(1, 10),
                complexity.clamp(1, 10),
                serde_json::to_string(dependencies)?,
                status.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn mark_capability_developed(&self, capability: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE capability_knowledge SET status = 'developed', developed_at = ?1 WHERE capability = ?2",
            params![Utc::now().to_rfc3339(), capability],
        )?;
        Ok(())
    }

    pub fn list_capabilities(&self) -> Result<Vec<CapabilityRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT capability, description, value, complexity, dependencies, status, discovered_at, developed_at
             FROM capability_knowledge ORDER BY capability",
        )?;
        let records = stmt
            .query_map([], |row| {
                let deps_json: String = row.get(4)?;
                let status_str: String = row.get(5)?;
                Ok(CapabilityRecord {
                    capability: row.get(0)?,
                    description: row.get(1)?,
                    value: row.get(2)?,
                    complexity: row.get(3)?,
                    dependencies: serde_json::from_str(&deps_json)
                        .unwrap_or(serde_json::Value::Null),
                    status: serde_json::from_str(&format!("\"{}\"", status_str))
                        .unwrap_or(CapabilityStatus::Discovered),
                    discovered_at: row.get(6)?,
                    developed_at: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // ─── Introspection ───────────────────────────────────────────

    /// Row count of a required table. Rejects names outside the schema's
    /// own list so callers cannot smuggle SQL through the table name.
    pub fn table_count(&self, table: &str) -> Result<i64> {
        if !REQUIRED_TABLES.contains(&table) {
            bail!("unknown table: {table}");
        }
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    // ─── Deserializers (private) ─────────────────────────────────

    fn deserialize_tool(row: &rusqlite::Row<'_>) -> ToolRecord {
        ToolRecord {
            id: row.get(0).unwrap_or_default(),
            name: row.get(1).unwrap_or_default(),
            description: row.get(2).unwrap_or_default(),
            file_path: row.get(3).unwrap_or_default(),
            created_at: row.get(4).unwrap_or_default(),
            last_used: row.get(5).unwrap_or(None),
            usage_count: row.get(6).unwrap_or(0),
        }
    }

    fn deserialize_tier(row: &rusqlite::Row<'_>) -> NeedTier {
        NeedTier {
            tier: row.get(0).unwrap_or(1),
            name: row.get(1).unwrap_or_default(),
            description: row.get(2).unwrap_or_default(),
            current_focus: row.get::<_, i64>(3).unwrap_or(0) != 0,
            progress: row.get(4).unwrap_or(0.0),
        }
    }

    fn deserialize_goal(row: &rusqlite::Row<'_>) -> Goal {
        let status_str: String = row.get(4).unwrap_or_default();
        Goal {
            id: row.get(0).unwrap_or_default(),
            goal_text: row.get(1).unwrap_or_default(),
            goal_type: row.get(2).unwrap_or_default(),
            priority: row.get(3).unwrap_or(3),
            status: serde_json::from_str(&format!("\"{}\"", status_str))
                .unwrap_or(GoalStatus::Active),
            created_at: row.get(5).unwrap_or_default(),
            completed_at: row.get(6).unwrap_or(None),
            progress: row.get(7).unwrap_or(0),
            expected_benefit: row.get(8).unwrap_or_default(),
            estimated_effort: row.get(9).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal() -> Journal {
        Journal::open_in_memory(100.0).unwrap()
    }

    #[test]
    fn test_open_is_idempotent_and_seeds_state() {
        let j = journal();
        assert!((j.current_balance().unwrap() - 100.0).abs() < 1e-9);

        let tiers = j.list_tiers().unwrap();
        assert_eq!(tiers.len(), 4);
        assert_eq!(tiers.iter().filter(|t| t.current_focus).count(), 1);
        assert_eq!(j.focus_tier().unwrap().tier, 1);
    }

    #[test]
    fn test_action_log_append() {
        let j = journal();
        j.log_action("probe", "checking health", outcome::COMPLETED, 0.0)
            .unwrap();
        j.log_action("probe", "second run", outcome::ERROR, 0.0).unwrap();

        let actions = j.recent_actions(10).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].outcome, "completed");
        assert_eq!(actions[1].outcome, "error");
        assert_eq!(j.action_count().unwrap(), 2);
    }

    #[test]
    fn test_transaction_chain_invariant() {
        let j = journal();
        j.log_transaction("debit a", -1.5, "inference").unwrap();
        j.log_transaction("credit b", 0.5, "income").unwrap();
        j.log_transaction("debit c", -2.0, "tooling").unwrap();

        let txns = j.recent_transactions(10).unwrap();
        assert_eq!(txns.len(), 3);
        for pair in txns.windows(2) {
            let expected = pair[0].balance_after + pair[1].amount_signed;
            assert!((pair[1].balance_after - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_state_balance_matches_last_transaction() {
        let j = journal();
        j.log_transaction("x", -0.25, "inference").unwrap();
        let balance = j.log_transaction("y", -0.25, "inference").unwrap();

        let last = j.recent_transactions(1).unwrap().pop().unwrap();
        assert!((last.balance_after - balance).abs() < 1e-9);
        assert!((j.current_balance().unwrap() - balance).abs() < 1e-9);
    }

    #[test]
    fn test_balance_may_go_negative() {
        let j = journal();
        let balance = j.log_transaction("big spend", -250.0, "inference").unwrap();
        assert!(balance < 0.0);
    }

    #[test]
    fn test_state_roundtrip() {
        let j = journal();
        assert!(j.get_state("missing").unwrap().is_none());
        j.set_state("last_cycle", "20250101_0000").unwrap();
        assert_eq!(j.get_state("last_cycle").unwrap().unwrap(), "20250101_0000");
        j.set_state("last_cycle", "20250102_0000").unwrap();
        assert_eq!(j.get_state("last_cycle").unwrap().unwrap(), "20250102_0000");
    }

    #[test]
    fn test_dialogue_append() {
        let j = journal();
        j.append_dialogue(DialoguePhase::Risk, "balance is low", None, "economic review")
            .unwrap();
        let dialogues = j.recent_dialogues(5).unwrap();
        assert_eq!(dialogues.len(), 1);
        assert_eq!(dialogues[0].phase, DialoguePhase::Risk);
    }

    #[test]
    fn test_tool_lifecycle() {
        let j = journal();
        j.insert_tool("evolved_summarize", "summarizes text", "/tools/evolved_summarize.rs")
            .unwrap();
        assert!(j.insert_tool("evolved_summarize", "dup", "/x").is_err());

        j.touch_tool("evolved_summarize").unwrap();
        let tool = j.get_tool("evolved_summarize").unwrap().unwrap();
        assert_eq!(tool.usage_count, 1);
        assert!(tool.last_used.is_some());

        assert!(j.delete_tool("evolved_summarize").unwrap());
        assert!(!j.delete_tool("evolved_summarize").unwrap());
        assert!(j.get_tool("evolved_summarize").unwrap().is_none());
    }

    #[test]
    fn test_trait_reinforcement_is_bounded() {
        let j = journal();
        let mut confidence = 0.0;
        for _ in 0..50 {
            confidence = j.reinforce_trait("patience", "high", 0.3).unwrap();
        }
        assert!(confidence <= 1.0);
        assert!(confidence > 0.9);

        let stored = j.get_trait("patience").unwrap().unwrap();
        assert_eq!(stored.evidence_count, 50);

        for _ in 0..50 {
            confidence = j.reinforce_trait("patience", "high", -0.5).unwrap();
        }
        assert!(confidence >= 0.0);
    }

    #[test]
    fn test_single_focus_invariant_after_switch() {
        let j = journal();
        j.set_focus_tier(3).unwrap();
        let tiers = j.list_tiers().unwrap();
        assert_eq!(tiers.iter().filter(|t| t.current_focus).count(), 1);
        assert_eq!(j.focus_tier().unwrap().tier, 3);

        assert!(j.set_focus_tier(9).is_err());
        // A failed switch must leave the invariant intact.
        assert_eq!(j.focus_tier().unwrap().tier, 3);
    }

    #[test]
    fn test_goal_lifecycle() {
        let j = journal();
        let id = j
            .insert_goal("reduce error rate", "stability", 1, "fewer failures", "medium")
            .unwrap();
        assert_eq!(j.active_goals().unwrap().len(), 1);

        j.complete_goal(id).unwrap();
        assert!(j.active_goals().unwrap().is_empty());
        assert_eq!(j.goals_completed_count().unwrap(), 1);
    }

    #[test]
    fn test_recurring_actions() {
        let j = journal();
        for _ in 0..5 {
            j.log_action("compress_journal", "routine", outcome::COMPLETED, 0.0)
                .unwrap();
        }
        j.log_action("one_off", "rare", outcome::COMPLETED, 0.0).unwrap();

        let recurring = j.recurring_actions(3, 7).unwrap();
        assert_eq!(recurring.len(), 1);
        assert_eq!(recurring[0], ("compress_journal".to_string(), 5));
    }

    #[test]
    fn test_action_statistics() {
        let j = journal();
        for i in 0..10 {
            let outcome = if i < 2 { outcome::ERROR } else { outcome::COMPLETED };
            j.log_action("tick", "scheduled run", outcome, 0.0).unwrap();
        }
        let stats = j.action_statistics().unwrap();
        assert_eq!(stats.total_actions, 10);
        assert_eq!(stats.error_count, 2);
        assert_eq!(stats.recent_hour_count, 10);
        assert!((stats.error_rate() - 0.2).abs() < 1e-9);
        assert!(stats.avg_action_length > 0.0);
    }

    #[test]
    fn test_table_count_whitelist() {
        let j = journal();
        assert_eq!(j.table_count("action_log").unwrap(), 0);
        assert!(j.table_count("sqlite_master; DROP TABLE tools").is_err());
    }

    #[test]
    fn test_capability_upsert_and_develop() {
        let j = journal();
        j.upsert_capability(
            "text_summarization",
            "condense long inputs",
            7,
            3,
            &serde_json::json!([]),
            CapabilityStatus::Discovered,
        )
        .unwrap();
        j.mark_capability_developed("text_summarization").unwrap();

        let caps = j.list_capabilities().unwrap();
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].status, CapabilityStatus::Developed);
        assert!(caps[0].developed_at.is_some());
    }

    #[test]
    fn test_performance_snapshot_roundtrip() {
        let j = journal();
        j.insert_performance_snapshot(&PerformanceSnapshot {
            id: 0,
            timestamp: chrono::Utc::now().to_rfc3339(),
            error_rate: 0.1,
            response_time: 1.2,
            task_completion_rate: 0.9,
            autonomous_actions: 42,
            goals_completed: 3,
            evolutions_executed: 1,
        })
        .unwrap();

        let snapshots = j.recent_snapshots(5).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].autonomous_actions, 42);
    }
}
