//! Runtime Configuration
//!
//! All knobs are read from environment variables at startup, prefixed
//! `OURO_`. Unset variables fall back to the defaults below. Paths may
//! start with `~`, which resolves against the user's home directory.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    Local,
    Priced,
}

/// Full runtime configuration. Built once in `main` and shared by
/// constructor injection; subsystems never read the environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // Storage
    pub db_path: String,
    pub data_dir: String,
    pub tools_dir: String,
    pub backups_dir: String,

    // Scheduler
    pub tick_secs: u64,

    // Model backend
    pub model_provider: ModelProvider,
    pub model: String,
    pub model_base_url: String,
    pub model_timeout_secs: u64,
    pub model_retries: u32,
    pub api_key: String,

    // Economics
    pub initial_balance: f64,
    pub low_balance_threshold: f64,
    pub inference_cost: f64,
    pub tool_creation_cost: f64,

    // Evolution
    pub evolution_max_retries: u32,
    pub safety_mode: bool,
    pub backup_before_modify: bool,

    pub log_level: LogLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: "~/.ouroboros/state.db".to_string(),
            data_dir: "~/.ouroboros/data".to_string(),
            tools_dir: "~/.ouroboros/tools".to_string(),
            backups_dir: "~/.ouroboros/backups".to_string(),
            tick_secs: 60,
            model_provider: ModelProvider::Local,
            model: "llama3.1:8b".to_string(),
            model_base_url: "http://localhost:11434".to_string(),
            model_timeout_secs: 300,
            model_retries: 0,
            api_key: String::new(),
            initial_balance: 100.0,
            low_balance_threshold: 10.0,
            inference_cost: 0.000001,
            tool_creation_cost: 0.05,
            evolution_max_retries: 2,
            safety_mode: true,
            backup_before_modify: true,
            log_level: LogLevel::Info,
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from the process environment, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let d = Self::default();

        Self {
            db_path: env_string("OURO_DB_PATH", d.db_path),
            data_dir: env_string("OURO_DATA_DIR", d.data_dir),
            tools_dir: env_string("OURO_TOOLS_DIR", d.tools_dir),
            backups_dir: env_string("OURO_BACKUPS_DIR", d.backups_dir),
            tick_secs: env_parse("OURO_TICK_SECS", d.tick_secs),
            model_provider: match std::env::var("OURO_MODEL_PROVIDER").as_deref() {
                Ok("priced") => ModelProvider::Priced,
                _ => d.model_provider,
            },
            model: env_string("OURO_MODEL", d.model),
            model_base_url: env_string("OURO_MODEL_BASE_URL", d.model_base_url),
            model_timeout_secs: env_parse("OURO_MODEL_TIMEOUT_SECS", d.model_timeout_secs),
            model_retries: env_parse("OURO_MODEL_RETRIES", d.model_retries),
            api_key: env_string("OURO_API_KEY", d.api_key),
            initial_balance: env_parse("OURO_INITIAL_BALANCE", d.initial_balance),
            low_balance_threshold: env_parse("OURO_LOW_BALANCE_THRESHOLD", d.low_balance_threshold),
            inference_cost: env_parse("OURO_INFERENCE_COST", d.inference_cost),
            tool_creation_cost: env_parse("OURO_TOOL_CREATION_COST", d.tool_creation_cost),
            evolution_max_retries: env_parse("OURO_EVOLUTION_MAX_RETRIES", d.evolution_max_retries),
            safety_mode: env_parse("OURO_SAFETY_MODE", d.safety_mode),
            backup_before_modify: env_parse("OURO_BACKUP_BEFORE_MODIFY", d.backup_before_modify),
            log_level: match std::env::var("OURO_LOG_LEVEL").as_deref() {
                Ok("debug") => LogLevel::Debug,
                Ok("warn") => LogLevel::Warn,
                Ok("error") => LogLevel::Error,
                Ok("info") => LogLevel::Info,
                _ => d.log_level,
            },
        }
    }

    pub fn resolved_db_path(&self) -> String {
        resolve_path(&self.db_path)
    }

    pub fn resolved_data_dir(&self) -> PathBuf {
        PathBuf::from(resolve_path(&self.data_dir))
    }

    pub fn resolved_tools_dir(&self) -> PathBuf {
        PathBuf::from(resolve_path(&self.tools_dir))
    }

    pub fn resolved_backups_dir(&self) -> PathBuf {
        PathBuf::from(resolve_path(&self.backups_dir))
    }
}

fn env_string(key: &str, default: String) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Resolve a path that may start with `~` to an absolute path.
pub fn resolve_path(p: &str) -> String {
    if let Some(rest) = p.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        home.join(rest).to_string_lossy().to_string()
    } else {
        p.to_string()
    }
}
