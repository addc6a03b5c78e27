//! Economic Ledger
//!
//! Monetary balance accounting. Every debit and credit goes through the
//! journal's transaction log (one atomic unit per transaction), and the
//! ledger publishes transaction and low-balance signals on the event
//! bus. The ledger never refuses a transaction; reacting to a low
//! balance is a policy-layer concern.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, warn};

use crate::events::EventBus;
use crate::journal::Journal;
use crate::types::{BackendProvider, BackendSpec, EventKind, TokenUsage};

pub struct Ledger {
    journal: Arc<Journal>,
    bus: Arc<EventBus>,
    /// Balance below which every transaction also publishes a
    /// low-balance event.
    threshold: f64,
}

impl Ledger {
    pub fn new(journal: Arc<Journal>, bus: Arc<EventBus>, threshold: f64) -> Self {
        Self {
            journal,
            bus,
            threshold,
        }
    }

    /// Pure cost function over the static backend table. Local backends
    /// charge a flat per-token rate on response tokens; priced backends
    /// apply separate input/output rates.
    pub fn calculate_cost(spec: &BackendSpec, usage: &TokenUsage) -> f64 {
        match spec.provider {
            BackendProvider::Local => spec.cost_per_token * usage.completion_tokens as f64,
            BackendProvider::Priced => {
                spec.input_cost_per_token * usage.prompt_tokens as f64
                    + spec.output_cost_per_token * usage.completion_tokens as f64
            }
        }
    }

    /// Debit `amount` from the balance. Returns the new balance.
    pub fn charge(&self, description: &str, amount: f64, category: &str) -> Result<f64> {
        let balance = self.journal.log_transaction(description, -amount, category)?;
        debug!(amount, balance, category, "ledger debit");
        self.publish_events(description, -amount, balance, category);
        Ok(balance)
    }

    /// Credit `amount` to the balance. Returns the new balance.
    pub fn credit(&self, description: &str, amount: f64, category: &str) -> Result<f64> {
        let balance = self.journal.log_transaction(description, amount, category)?;
        debug!(amount, balance, category, "ledger credit");
        self.publish_events(description, amount, balance, category);
        if category == "income" {
            self.bus.publish(
                EventKind::IncomeGenerated,
                json!({ "description": description, "amount": amount, "balance": balance }),
                "ledger",
            );
        }
        Ok(balance)
    }

    pub fn balance(&self) -> Result<f64> {
        self.journal.current_balance()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn publish_events(&self, description: &str, amount: f64, balance: f64, category: &str) {
        self.bus.publish(
            EventKind::EconomicTransaction,
            json!({
                "description": description,
                "amount": amount,
                "balance": balance,
                "category": category,
            }),
            "ledger",
        );

        if balance < self.threshold {
            warn!(balance, threshold = self.threshold, "balance below threshold");
            self.bus.publish(
                EventKind::BalanceLow,
                json!({ "balance": balance, "threshold": self.threshold }),
                "ledger",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ModelCapability, TaskComplexity};
    use std::sync::Mutex;

    fn local_spec(rate: f64) -> BackendSpec {
        BackendSpec {
            id: "local-test".to_string(),
            model: "test-model".to_string(),
            provider: BackendProvider::Local,
            capabilities: vec![ModelCapability::General],
            cost_per_token: rate,
            input_cost_per_token: 0.0,
            output_cost_per_token: 0.0,
            max_context: 8192,
            max_complexity: TaskComplexity::Medium,
            timeout_secs: 300,
        }
    }

    fn priced_spec(input: f64, output: f64) -> BackendSpec {
        BackendSpec {
            id: "priced-test".to_string(),
            model: "api-model".to_string(),
            provider: BackendProvider::Priced,
            capabilities: vec![ModelCapability::General],
            cost_per_token: 0.0,
            input_cost_per_token: input,
            output_cost_per_token: output,
            max_context: 128_000,
            max_complexity: TaskComplexity::High,
            timeout_secs: 60,
        }
    }

    fn ledger_with(balance: f64, threshold: f64) -> (Ledger, Arc<EventBus>) {
        let journal = Arc::new(Journal::open_in_memory(balance).unwrap());
        let bus = Arc::new(EventBus::new());
        (Ledger::new(journal, Arc::clone(&bus), threshold), bus)
    }

    #[test]
    fn test_calculate_cost_local_uses_response_tokens() {
        let spec = local_spec(0.000001);
        let usage = TokenUsage {
            prompt_tokens: 1000,
            completion_tokens: 500,
        };
        let cost = Ledger::calculate_cost(&spec, &usage);
        assert!((cost - 0.0005).abs() < 1e-12);
    }

    #[test]
    fn test_calculate_cost_priced_uses_both_rates() {
        let spec = priced_spec(0.000001, 0.000002);
        let usage = TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 50,
        };
        let cost = Ledger::calculate_cost(&spec, &usage);
        assert!((cost - 0.0002).abs() < 1e-12);
    }

    #[test]
    fn test_charge_and_low_balance_event() {
        let (ledger, bus) = ledger_with(10.0, 10.0);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bus.subscribe("capture", move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });

        let balance = ledger.charge("x", 0.01, "inference").unwrap();
        assert!((balance - 9.99).abs() < 1e-9);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::EconomicTransaction);
        assert_eq!(events[1].kind, EventKind::BalanceLow);
        assert!((events[1].data["balance"].as_f64().unwrap() - 9.99).abs() < 1e-9);
        assert!((events[1].data["threshold"].as_f64().unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_low_balance_event_above_threshold() {
        let (ledger, bus) = ledger_with(100.0, 10.0);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bus.subscribe("capture", move |event| {
            sink.lock().unwrap().push(event.kind);
            Ok(())
        });

        ledger.charge("x", 1.0, "inference").unwrap();
        assert_eq!(*events.lock().unwrap(), vec![EventKind::EconomicTransaction]);
    }

    #[test]
    fn test_credit_income_publishes_income_event() {
        let (ledger, bus) = ledger_with(5.0, 10.0);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bus.subscribe("capture", move |event| {
            sink.lock().unwrap().push(event.kind);
            Ok(())
        });

        let balance = ledger.credit("payout", 2.0, "income").unwrap();
        assert!((balance - 7.0).abs() < 1e-9);

        let kinds = events.lock().unwrap();
        // Still below threshold, so the low-balance signal fires too.
        assert!(kinds.contains(&EventKind::EconomicTransaction));
        assert!(kinds.contains(&EventKind::BalanceLow));
        assert!(kinds.contains(&EventKind::IncomeGenerated));
    }

    #[test]
    fn test_charge_may_drive_balance_negative() {
        let (ledger, _bus) = ledger_with(1.0, 10.0);
        let balance = ledger.charge("expensive", 5.0, "inference").unwrap();
        assert!(balance < 0.0);
    }
}
