//! Model Router
//!
//! Capability- and cost-aware backend selection plus the metered call
//! path. Every successful call produces exactly one ledger debit and
//! one action row; every failed call produces one error action row and
//! no debit. The router never retries and never falls back; both are
//! pipeline-level decisions.

mod backends;
mod transport;

pub use backends::{backend_table, capabilities_for_task};
pub use transport::{BackendReply, BackendTransport, HttpTransport};

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{debug, info};

use crate::journal::Journal;
use crate::ledger::Ledger;
use crate::types::{outcome, BackendSpec, TaskComplexity, TokenUsage};

pub struct ModelRouter {
    table: Vec<BackendSpec>,
    transport: Arc<dyn BackendTransport>,
    ledger: Arc<Ledger>,
    journal: Arc<Journal>,
}

impl ModelRouter {
    pub fn new(
        table: Vec<BackendSpec>,
        transport: Arc<dyn BackendTransport>,
        ledger: Arc<Ledger>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            table,
            transport,
            ledger,
            journal,
        }
    }

    /// Select a backend for a task. Deterministic and cost-aware: among
    /// backends declaring a matching capability and trusted with the
    /// requested complexity, the lowest per-token rate wins; ties break
    /// toward the larger declared context window.
    pub fn route(&self, task_kind: &str, complexity: TaskComplexity) -> Result<&BackendSpec> {
        let wanted = capabilities_for_task(task_kind);

        let mut candidates: Vec<&BackendSpec> = self
            .table
            .iter()
            .filter(|b| b.max_complexity >= complexity)
            .filter(|b| wanted.iter().any(|c| b.capabilities.contains(c)))
            .collect();

        // No capability match: any general-purpose backend will do.
        if candidates.is_empty() {
            candidates = self
                .table
                .iter()
                .filter(|b| b.max_complexity >= complexity)
                .filter(|b| b.capabilities.contains(&crate::types::ModelCapability::General))
                .collect();
        }

        candidates.sort_by(|a, b| {
            a.comparable_rate()
                .partial_cmp(&b.comparable_rate())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.max_context.cmp(&a.max_context))
                .then(a.id.cmp(&b.id))
        });

        let chosen = candidates
            .first()
            .copied()
            .ok_or_else(|| anyhow!("no backend for task '{task_kind}' at {complexity:?} complexity"))?;

        debug!(task_kind, ?complexity, backend = chosen.id.as_str(), "routed");
        Ok(chosen)
    }

    pub fn backend(&self, backend_id: &str) -> Option<&BackendSpec> {
        self.table.iter().find(|b| b.id == backend_id)
    }

    /// Invoke a backend, meter tokens, debit the ledger, and return the
    /// response text whole.
    pub async fn call(&self, backend_id: &str, prompt: &str, system_prompt: &str) -> Result<String> {
        let spec = self
            .backend(backend_id)
            .ok_or_else(|| anyhow!("unknown backend: {backend_id}"))?;

        match self.transport.complete(spec, prompt, system_prompt).await {
            Ok(reply) => {
                let usage = TokenUsage {
                    prompt_tokens: reply
                        .prompt_tokens
                        .unwrap_or_else(|| estimate_tokens(prompt)),
                    completion_tokens: reply
                        .completion_tokens
                        .unwrap_or_else(|| estimate_tokens(&reply.text)),
                };
                let cost = Ledger::calculate_cost(spec, &usage);
                self.ledger.charge(
                    &format!("inference via {} ({})", spec.id, spec.model),
                    cost,
                    "inference",
                )?;
                self.journal.log_action(
                    "model_call",
                    &format!(
                        "model={} prompt_tokens={} completion_tokens={} cost={:.6}",
                        spec.model, usage.prompt_tokens, usage.completion_tokens, cost
                    ),
                    outcome::COMPLETED,
                    cost,
                )?;
                info!(
                    backend = spec.id.as_str(),
                    tokens = usage.total(),
                    cost,
                    "model call completed"
                );
                Ok(reply.text)
            }
            Err(e) => {
                self.journal.log_action(
                    "model_call",
                    &format!("model={} failed: {e:#}", spec.model),
                    outcome::ERROR,
                    0.0,
                )?;
                Err(e)
            }
        }
    }

    /// Route then call, the common path for diagnosis and evolution.
    pub async fn call_routed(
        &self,
        task_kind: &str,
        complexity: TaskComplexity,
        prompt: &str,
        system_prompt: &str,
    ) -> Result<String> {
        let backend_id = self.route(task_kind, complexity)?.id.clone();
        self.call(&backend_id, prompt, system_prompt).await
    }
}

/// Token estimate for backends that do not report counts: `words × 1.3`.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.split_whitespace().count() as f64 * 1.3).round() as u64
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Scripted transport: pops pre-seeded replies in order. An `Err`
    /// entry simulates a backend failure.
    pub struct ScriptedTransport {
        replies: Mutex<Vec<Result<BackendReply>>>,
    }

    impl ScriptedTransport {
        pub fn new(replies: Vec<Result<BackendReply>>) -> Self {
            Self {
                replies: Mutex::new(replies),
            }
        }

        pub fn reply(text: &str, completion_tokens: Option<u64>) -> Result<BackendReply> {
            Ok(BackendReply {
                text: text.to_string(),
                prompt_tokens: None,
                completion_tokens,
            })
        }
    }

    #[async_trait::async_trait]
    impl BackendTransport for ScriptedTransport {
        async fn complete(
            &self,
            spec: &BackendSpec,
            _prompt: &str,
            _system_prompt: &str,
        ) -> Result<BackendReply> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(crate::error::CoreError::model(&spec.id, "script exhausted").into());
            }
            replies.remove(0)
        }
    }
}
