//! Journal schema.
//!
//! The journal exclusively owns table creation; every other subsystem
//! reaches persistence through the journal's API. `execute_batch` with
//! `IF NOT EXISTS` keeps later opens idempotent.

pub const SCHEMA_VERSION: i64 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS action_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT NOT NULL,
    action      TEXT NOT NULL,
    reasoning   TEXT NOT NULL DEFAULT '',
    outcome     TEXT NOT NULL DEFAULT '',
    cost        REAL NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_action_log_timestamp ON action_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_action_log_outcome ON action_log(outcome);

CREATE TABLE IF NOT EXISTS economic_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp     TEXT NOT NULL,
    description   TEXT NOT NULL,
    amount_signed REAL NOT NULL,
    balance_after REAL NOT NULL,
    category      TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_economic_log_timestamp ON economic_log(timestamp);

CREATE TABLE IF NOT EXISTS system_state (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dialogue_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp       TEXT NOT NULL,
    phase           TEXT NOT NULL,
    content         TEXT NOT NULL,
    master_command  TEXT,
    reasoning       TEXT
);

CREATE TABLE IF NOT EXISTS tools (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    file_path   TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    last_used   TEXT,
    usage_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS master_model (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    trait          TEXT NOT NULL UNIQUE,
    value          TEXT NOT NULL DEFAULT '',
    confidence     REAL NOT NULL DEFAULT 0.5,
    evidence_count INTEGER NOT NULL DEFAULT 1,
    last_updated   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS hierarchy_of_needs (
    tier          INTEGER PRIMARY KEY,
    name          TEXT NOT NULL,
    description   TEXT NOT NULL DEFAULT '',
    current_focus INTEGER NOT NULL DEFAULT 0,
    progress      REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS goals (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    goal_text        TEXT NOT NULL,
    goal_type        TEXT NOT NULL DEFAULT 'general',
    priority         INTEGER NOT NULL DEFAULT 3,
    status           TEXT NOT NULL DEFAULT 'active',
    created_at       TEXT NOT NULL,
    completed_at     TEXT,
    progress         INTEGER NOT NULL DEFAULT 0,
    expected_benefit TEXT NOT NULL DEFAULT '',
    estimated_effort TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS performance_metrics (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp            TEXT NOT NULL,
    error_rate           REAL NOT NULL DEFAULT 0,
    response_time        REAL NOT NULL DEFAULT 0,
    task_completion_rate REAL NOT NULL DEFAULT 0,
    autonomous_actions   INTEGER NOT NULL DEFAULT 0,
    goals_completed      INTEGER NOT NULL DEFAULT 0,
    evolutions_executed  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS strategy_history (
    id                     INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp              TEXT NOT NULL,
    strategy_name          TEXT NOT NULL,
    strategy_params        TEXT NOT NULL DEFAULT '{}',
    success_rate           REAL NOT NULL DEFAULT 0,
    tasks_completed        INTEGER NOT NULL DEFAULT 0,
    tasks_failed           INTEGER NOT NULL DEFAULT 0,
    execution_time_seconds REAL NOT NULL DEFAULT 0,
    outcomes               TEXT NOT NULL DEFAULT '[]',
    lessons_learned        TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS capability_knowledge (
    capability   TEXT PRIMARY KEY,
    description  TEXT NOT NULL DEFAULT '',
    value        INTEGER NOT NULL DEFAULT 5,
    complexity   INTEGER NOT NULL DEFAULT 5,
    dependencies TEXT NOT NULL DEFAULT '[]',
    status       TEXT NOT NULL DEFAULT 'discovered',
    discovered_at TEXT NOT NULL,
    developed_at  TEXT
);
"#;

/// Tables every open must leave queryable. The evolution test phase and
/// the journal's own health check iterate this list.
pub const REQUIRED_TABLES: &[&str] = &[
    "action_log",
    "economic_log",
    "system_state",
    "dialogue_log",
    "tools",
    "master_model",
    "hierarchy_of_needs",
    "goals",
    "performance_metrics",
    "strategy_history",
    "capability_knowledge",
];

/// Seed rows for the hierarchy of needs. Tier 1 starts focused.
pub const SEED_HIERARCHY: &[(i64, &str, &str)] = &[
    (1, "survival", "Keep the runtime solvent, stable and error-free"),
    (2, "growth", "Expand tooling and raise throughput"),
    (3, "mastery", "Deepen analysis quality and self-knowledge"),
    (4, "transcendence", "Refine the architecture beyond its original design"),
];
