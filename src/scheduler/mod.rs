//! Autonomous Scheduler
//!
//! Priority-aware, interval-driven task runner. A single background
//! worker ticks every 60 seconds and runs every due task serially, in
//! priority order; no task ever runs concurrently with another. The
//! current time is re-examined after each task, so a long task delays
//! the tick but never causes a due check to be skipped.

mod tasks;

pub use tasks::{register_default_tasks, DefaultTaskDeps};

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::EventBus;
use crate::journal::Journal;
use crate::types::{outcome, EventKind};

/// Task cadence, specified as minutes or hours.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskInterval {
    Minutes(u64),
    Hours(u64),
}

impl TaskInterval {
    pub fn as_chrono(&self) -> chrono::Duration {
        match self {
            TaskInterval::Minutes(m) => chrono::Duration::minutes(*m as i64),
            TaskInterval::Hours(h) => chrono::Duration::hours(*h as i64),
        }
    }
}

impl std::fmt::Display for TaskInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskInterval::Minutes(m) => write!(f, "{m}m"),
            TaskInterval::Hours(h) => write!(f, "{h}h"),
        }
    }
}

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

struct RegisteredTask {
    name: String,
    interval: TaskInterval,
    priority: u8,
    enabled: bool,
    last_run: Option<DateTime<Utc>>,
    next_run: DateTime<Utc>,
    runs: u64,
    failures: u64,
    run: TaskFn,
}

/// Snapshot of one registered task, as returned by `task_status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskStatus {
    pub name: String,
    pub interval: String,
    pub priority: u8,
    pub enabled: bool,
    pub last_run: Option<String>,
    pub next_run: String,
    pub runs: u64,
    pub failures: u64,
}

pub struct Scheduler {
    tasks: Arc<Mutex<Vec<RegisteredTask>>>,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
    tick_secs: u64,
    journal: Arc<Journal>,
    bus: Arc<EventBus>,
}

impl Scheduler {
    pub fn new(journal: Arc<Journal>, bus: Arc<EventBus>, tick_secs: u64) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            handle: Mutex::new(None),
            tick_secs,
            journal,
            bus,
        }
    }

    /// Add a periodic task. Priority 1 is highest. The first run is due
    /// one full interval after registration.
    pub fn register<F>(&self, name: &str, interval: TaskInterval, priority: u8, enabled: bool, f: F)
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.iter().any(|t| t.name == name) {
            warn!(task = name, "task already registered, ignoring");
            return;
        }
        tasks.push(RegisteredTask {
            name: name.to_string(),
            interval,
            priority,
            enabled,
            last_run: None,
            next_run: Utc::now() + interval.as_chrono(),
            runs: 0,
            failures: 0,
            run: Arc::new(f),
        });
        debug!(task = name, %interval, priority, "task registered");
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.iter_mut().find(|t| t.name == name) {
            Some(task) => {
                task.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn task_status(&self) -> Vec<TaskStatus> {
        let tasks = self.tasks.lock().unwrap();
        tasks
            .iter()
            .map(|t| TaskStatus {
                name: t.name.clone(),
                interval: t.interval.to_string(),
                priority: t.priority,
                enabled: t.enabled,
                last_run: t.last_run.map(|d| d.to_rfc3339()),
                next_run: t.next_run.to_rfc3339(),
                runs: t.runs,
                failures: t.failures,
            })
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Run every task due at `now`, serially, in priority order. The
    /// clock is re-examined after each task so work that became due
    /// while an earlier task ran is picked up in the same pass. Returns
    /// the number of tasks executed.
    pub async fn run_due(&self, now: DateTime<Utc>) -> usize {
        let mut executed = 0usize;
        let safety_cap = self.task_count() * 2 + 1;

        while executed < safety_cap {
            // Production passes the real clock; tests pass a future one.
            let effective_now = now.max(Utc::now());

            let next = {
                let tasks = self.tasks.lock().unwrap();
                let mut due: Vec<&RegisteredTask> = tasks
                    .iter()
                    .filter(|t| t.enabled && effective_now >= t.next_run)
                    .collect();
                due.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
                due.first().map(|t| (t.name.clone(), Arc::clone(&t.run)))
            };

            let Some((name, run)) = next else { break };

            debug!(task = name.as_str(), "running scheduled task");
            let result = run().await;

            {
                let mut tasks = self.tasks.lock().unwrap();
                if let Some(task) = tasks.iter_mut().find(|t| t.name == name) {
                    task.last_run = Some(effective_now);
                    task.next_run = effective_now + task.interval.as_chrono();
                    task.runs += 1;
                    if result.is_err() {
                        task.failures += 1;
                    }
                }
            }

            match result {
                Ok(summary) => {
                    if let Err(e) = self.journal.log_action(
                        &format!("task:{name}"),
                        &summary,
                        outcome::COMPLETED,
                        0.0,
                    ) {
                        error!(task = name.as_str(), "failed to record task outcome: {:#}", e);
                    }
                }
                Err(e) => {
                    warn!(task = name.as_str(), "scheduled task failed: {:#}", e);
                    if let Err(log_err) = self.journal.log_action(
                        &format!("task:{name}"),
                        &format!("{e:#}"),
                        outcome::ERROR,
                        0.0,
                    ) {
                        error!(
                            task = name.as_str(),
                            "failed to record task failure: {:#}", log_err
                        );
                    }
                }
            }

            executed += 1;
        }

        executed
    }

    /// Start the background worker. Publishes a startup event carrying
    /// the number of registered tasks.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler is already running");
            return;
        }

        let task_count = self.task_count();
        self.bus.publish(
            EventKind::Startup,
            json!({ "registered_tasks": task_count }),
            "scheduler",
        );
        info!(tasks = task_count, tick_secs = self.tick_secs, "scheduler starting");

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(scheduler.tick_secs.max(1)));
            interval.tick().await; // first tick resolves immediately

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = scheduler.notify.notified() => {}
                }
                if !scheduler.running.load(Ordering::SeqCst) {
                    info!("scheduler stopping");
                    break;
                }
                let ran = scheduler.run_due(Utc::now()).await;
                if ran > 0 {
                    debug!(ran, "tick complete");
                }
            }
        });

        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Cooperative stop: sets the flag, wakes the worker, and waits for
    /// any in-flight task to finish. Never preempts.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("scheduler is not running");
            return;
        }
        self.notify.notify_one();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("scheduler worker join failed: {:#}", e);
            }
        }
        self.bus
            .publish(EventKind::Shutdown, json!({}), "scheduler");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn scheduler() -> Scheduler {
        let journal = Arc::new(Journal::open_in_memory(100.0).unwrap());
        let bus = Arc::new(EventBus::new());
        Scheduler::new(journal, bus, 60)
    }

    fn counting_task(counter: Arc<AtomicUsize>) -> impl Fn() -> TaskFuture + Send + Sync {
        move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("ran".to_string())
            })
        }
    }

    #[tokio::test]
    async fn test_cadence_respects_interval() {
        let s = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        s.register(
            "probe",
            TaskInterval::Minutes(30),
            1,
            true,
            counting_task(Arc::clone(&count)),
        );

        let now = Utc::now();

        // 29 minutes in: not yet due.
        let ran = s.run_due(now + chrono::Duration::minutes(29)).await;
        assert_eq!(ran, 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // 30 minutes in: runs exactly once.
        let at = now + chrono::Duration::minutes(30);
        let ran = s.run_due(at).await;
        assert_eq!(ran, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let status = &s.task_status()[0];
        let last_run: DateTime<Utc> = status.last_run.as_ref().unwrap().parse().unwrap();
        let next_run: DateTime<Utc> = status.next_run.parse().unwrap();
        assert_eq!(next_run, last_run + chrono::Duration::minutes(30));

        // Same instant again: already rescheduled, nothing due.
        let ran = s.run_due(at).await;
        assert_eq!(ran, 0);
    }

    #[tokio::test]
    async fn test_priority_order_and_serial_execution() {
        let s = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));

        for (name, priority) in [("low", 3u8), ("high", 1u8), ("mid", 2u8)] {
            let order = Arc::clone(&order);
            let in_flight = Arc::clone(&in_flight);
            s.register(name, TaskInterval::Minutes(1), priority, true, move || {
                let order = Arc::clone(&order);
                let in_flight = Arc::clone(&in_flight);
                let name = name.to_string();
                Box::pin(async move {
                    // At most one task on the worker at a time.
                    assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    order.lock().unwrap().push(name.clone());
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(name)
                })
            });
        }

        let ran = s.run_due(Utc::now() + chrono::Duration::minutes(2)).await;
        assert_eq!(ran, 3);
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_failing_task_is_recorded_and_rescheduled() {
        let journal = Arc::new(Journal::open_in_memory(100.0).unwrap());
        let bus = Arc::new(EventBus::new());
        let s = Scheduler::new(Arc::clone(&journal), bus, 60);

        s.register("flaky", TaskInterval::Minutes(5), 1, true, || {
            Box::pin(async { anyhow::bail!("deliberate failure") })
        });

        let ran = s.run_due(Utc::now() + chrono::Duration::minutes(5)).await;
        assert_eq!(ran, 1);

        let actions = journal.recent_actions(5).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].outcome, "error");
        assert_eq!(actions[0].action, "task:flaky");

        // Rescheduled normally despite the failure.
        let status = &s.task_status()[0];
        assert_eq!(status.failures, 1);
        assert!(status.next_run.parse::<DateTime<Utc>>().is_ok());
    }

    #[tokio::test]
    async fn test_disabled_task_does_not_run() {
        let s = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        s.register(
            "dormant",
            TaskInterval::Minutes(1),
            1,
            false,
            counting_task(Arc::clone(&count)),
        );

        let ran = s.run_due(Utc::now() + chrono::Duration::minutes(5)).await;
        assert_eq!(ran, 0);

        assert!(s.set_enabled("dormant", true));
        let ran = s.run_due(Utc::now() + chrono::Duration::minutes(5)).await;
        assert_eq!(ran, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_ignored() {
        let s = scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        s.register(
            "dup",
            TaskInterval::Minutes(1),
            1,
            true,
            counting_task(Arc::clone(&count)),
        );
        s.register(
            "dup",
            TaskInterval::Minutes(1),
            1,
            true,
            counting_task(Arc::clone(&count)),
        );
        assert_eq!(s.task_count(), 1);
    }

    #[tokio::test]
    async fn test_startup_event_carries_task_count() {
        let journal = Arc::new(Journal::open_in_memory(100.0).unwrap());
        let bus = Arc::new(EventBus::new());
        let s = Arc::new(Scheduler::new(journal, Arc::clone(&bus), 60));

        s.register("a", TaskInterval::Hours(1), 1, true, || {
            Box::pin(async { Ok(String::new()) })
        });
        s.register("b", TaskInterval::Hours(2), 2, true, || {
            Box::pin(async { Ok(String::new()) })
        });

        s.start();
        let history = bus.history(10);
        let startup = history
            .iter()
            .find(|e| e.kind == EventKind::Startup)
            .expect("startup event");
        assert_eq!(startup.data["registered_tasks"], 2);
        s.stop().await;
        assert!(!s.is_running());
    }
}
