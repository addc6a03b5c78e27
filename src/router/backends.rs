//! Backend capability table.
//!
//! A static, cost-annotated catalog of the model backends the router
//! can select from. The table is built once at startup; the configured
//! primary model replaces the default entry for its provider.

use crate::config::{ModelProvider, RuntimeConfig};
use crate::types::{BackendProvider, BackendSpec, ModelCapability, TaskComplexity};

use ModelCapability::*;

/// Map free-form task-kind text onto capability classes by keyword.
/// Unrecognized kinds fall back to `General`.
pub fn capabilities_for_task(task_kind: &str) -> Vec<ModelCapability> {
    let kind = task_kind.to_lowercase();
    let mut caps = Vec::new();

    if kind.contains("cod") || kind.contains("implement") || kind.contains("program") {
        caps.push(Coding);
    }
    if kind.contains("reason") || kind.contains("think") {
        caps.push(Reasoning);
    }
    if kind.contains("plan") || kind.contains("strateg") {
        caps.push(Planning);
    }
    if kind.contains("analy") || kind.contains("diagnos") || kind.contains("review") {
        caps.push(Analysis);
    }
    if kind.contains("predict") || kind.contains("forecast") {
        caps.push(Prediction);
    }
    if kind.contains("synth") || kind.contains("summar") || kind.contains("write") {
        caps.push(Synthesis);
    }
    if caps.is_empty() {
        caps.push(General);
    }
    caps
}

/// Build the backend table. Local entries point at the configured
/// inference daemon; priced entries are used when an API key is set or
/// the provider is forced to `priced`.
pub fn backend_table(config: &RuntimeConfig) -> Vec<BackendSpec> {
    let mut table = vec![
        BackendSpec {
            id: "local-general".to_string(),
            model: config.model.clone(),
            provider: BackendProvider::Local,
            capabilities: vec![General, Analysis, Synthesis],
            cost_per_token: config.inference_cost,
            input_cost_per_token: 0.0,
            output_cost_per_token: 0.0,
            max_context: 8192,
            max_complexity: TaskComplexity::Medium,
            timeout_secs: config.model_timeout_secs,
        },
        BackendSpec {
            id: "local-coder".to_string(),
            model: "qwen2.5-coder:7b".to_string(),
            provider: BackendProvider::Local,
            capabilities: vec![Coding],
            cost_per_token: config.inference_cost * 1.2,
            input_cost_per_token: 0.0,
            output_cost_per_token: 0.0,
            max_context: 32_768,
            max_complexity: TaskComplexity::High,
            timeout_secs: config.model_timeout_secs,
        },
        BackendSpec {
            id: "local-reasoner".to_string(),
            model: "deepseek-r1:8b".to_string(),
            provider: BackendProvider::Local,
            capabilities: vec![Reasoning, Planning, Prediction],
            cost_per_token: config.inference_cost * 2.0,
            input_cost_per_token: 0.0,
            output_cost_per_token: 0.0,
            max_context: 16_384,
            max_complexity: TaskComplexity::High,
            timeout_secs: config.model_timeout_secs,
        },
    ];

    if config.model_provider == ModelProvider::Priced || !config.api_key.is_empty() {
        table.push(BackendSpec {
            id: "priced-mini".to_string(),
            model: "gpt-4o-mini".to_string(),
            provider: BackendProvider::Priced,
            capabilities: vec![General, Coding, Analysis, Synthesis, Planning],
            cost_per_token: 0.0,
            input_cost_per_token: 0.000_000_15,
            output_cost_per_token: 0.000_000_6,
            max_context: 128_000,
            max_complexity: TaskComplexity::Medium,
            timeout_secs: 60,
        });
        table.push(BackendSpec {
            id: "priced-frontier".to_string(),
            model: if config.model_provider == ModelProvider::Priced {
                config.model.clone()
            } else {
                "gpt-4o".to_string()
            },
            provider: BackendProvider::Priced,
            capabilities: vec![General, Coding, Reasoning, Planning, Analysis, Prediction, Synthesis],
            cost_per_token: 0.0,
            input_cost_per_token: 0.000_002_5,
            output_cost_per_token: 0.000_01,
            max_context: 128_000,
            max_complexity: TaskComplexity::High,
            timeout_secs: 60,
        });
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_keyword_mapping() {
        assert_eq!(capabilities_for_task("coding"), vec![Coding]);
        assert_eq!(capabilities_for_task("strategic planning"), vec![Planning]);
        assert_eq!(
            capabilities_for_task("analyze and predict"),
            vec![Analysis, Prediction]
        );
        assert_eq!(capabilities_for_task("whatever"), vec![General]);
    }

    #[test]
    fn test_local_only_table_without_api_key() {
        let config = RuntimeConfig::default();
        let table = backend_table(&config);
        assert_eq!(table.len(), 3);
        assert!(table.iter().all(|b| b.provider == BackendProvider::Local));
    }

    #[test]
    fn test_priced_entries_with_api_key() {
        let config = RuntimeConfig {
            api_key: "sk-test".to_string(),
            ..RuntimeConfig::default()
        };
        let table = backend_table(&config);
        assert!(table.iter().any(|b| b.provider == BackendProvider::Priced));
    }
}
