//! Evolution planner.
//!
//! Pure text plumbing for phases 2 and 3: tier-keyed coarse goals,
//! prompt construction, the strict `TASK:/DESCRIPTION:/...` parser, and
//! ranked-list parsing for prioritization. Keeping this free of I/O
//! makes the parsing behavior directly testable.

use regex::Regex;

use crate::types::{DiagnosisReport, ImprovementAction, PlanTask};

/// Tasks parsed per coarse goal.
pub const MAX_TASKS_PER_GOAL: usize = 3;
/// Diagnosis recommendations lifted directly into the plan.
pub const MAX_DIRECT_TASKS: usize = 5;
/// Tasks carried into the execute phase.
pub const TOP_TASK_COUNT: usize = 3;

/// How a task will be executed, decided by keyword matching its name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskClass {
    Optimization,
    Creation,
    Analysis,
    Other,
}

/// Three coarse goals keyed to the hierarchy focus tier.
pub fn tier_goals(tier: i64) -> Vec<&'static str> {
    match tier {
        1 => vec![
            "improve runtime efficiency",
            "increase operational stability",
            "reduce the error rate",
        ],
        2 => vec![
            "create new tools for recurring work",
            "raise task throughput",
            "expand the capability catalog",
        ],
        3 => vec![
            "deepen diagnostic precision",
            "improve the quality of generated plans",
            "sharpen the operator model",
        ],
        _ => vec![
            "simplify the architecture",
            "remove redundant behavior",
            "refine long-term strategy",
        ],
    }
}

/// Prompt for one coarse goal, demanding the strict task format.
pub fn build_goal_prompt(goal: &str, report: &DiagnosisReport) -> String {
    format!(
        "Current state: error rate {:.1}%, {} bottlenecks, {} improvement opportunities.\n\
         Goal: {goal}.\n\
         Propose 2-3 concrete tasks that advance this goal. Use exactly this format \
         for each task, with no other text:\n\
         TASK: <short imperative name>\n\
         DESCRIPTION: <one sentence>\n\
         EXPECTED_BENEFIT: <one sentence>\n\
         EFFORT: <low|medium|high>",
        report.performance.error_rate() * 100.0,
        report.bottlenecks.len(),
        report.opportunities.len(),
    )
}

/// Parse tasks out of a goal response. Tolerates noise between blocks;
/// a block is opened by `TASK:` and fields may arrive in any order
/// until the next `TASK:`. At most [`MAX_TASKS_PER_GOAL`] are kept.
pub fn parse_plan_tasks(text: &str, source_goal: &str) -> Vec<PlanTask> {
    let mut tasks: Vec<PlanTask> = Vec::new();

    for line in text.lines() {
        let line = line.trim().trim_start_matches(['-', '*', ' ']);
        if let Some(rest) = strip_field(line, "TASK:") {
            tasks.push(PlanTask {
                name: rest.to_string(),
                description: String::new(),
                expected_benefit: String::new(),
                effort: String::new(),
                status: "pending".to_string(),
                source: source_goal.to_string(),
            });
        } else if let Some(current) = tasks.last_mut() {
            if let Some(rest) = strip_field(line, "DESCRIPTION:") {
                current.description = rest.to_string();
            } else if let Some(rest) = strip_field(line, "EXPECTED_BENEFIT:") {
                current.expected_benefit = rest.to_string();
            } else if let Some(rest) = strip_field(line, "EFFORT:") {
                current.effort = rest.to_lowercase();
            }
        }
    }

    tasks.retain(|t| !t.name.is_empty());
    tasks.truncate(MAX_TASKS_PER_GOAL);
    tasks
}

fn strip_field<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    line.strip_prefix(field).map(str::trim)
}

/// Lift up to [`MAX_DIRECT_TASKS`] diagnosis recommendations into plan
/// tasks.
pub fn direct_tasks(plan_actions: &[ImprovementAction]) -> Vec<PlanTask> {
    plan_actions
        .iter()
        .take(MAX_DIRECT_TASKS)
        .map(|action| PlanTask {
            name: action.title.clone(),
            description: action.steps.join("; "),
            expected_benefit: String::new(),
            effort: String::new(),
            status: "pending".to_string(),
            source: "diagnosis".to_string(),
        })
        .collect()
}

/// Prompt for the single prioritization call of phase 3.
pub fn build_priority_prompt(report: &DiagnosisReport, tasks: &[PlanTask]) -> String {
    let diagnosis_lines: Vec<String> = report
        .bottlenecks
        .iter()
        .map(|b| format!("- bottleneck: {b}"))
        .chain(
            report
                .opportunities
                .iter()
                .map(|o| format!("- opportunity: {} ({}x)", o.action, o.occurrences)),
        )
        .collect();
    let task_lines: Vec<String> = tasks.iter().map(|t| format!("- {}", t.name)).collect();

    format!(
        "Diagnosis findings:\n{}\n\nCandidate tasks:\n{}\n\n\
         Rank the candidate tasks from most to least impactful. Respond with a \
         numbered list of task names only.",
        diagnosis_lines.join("\n"),
        task_lines.join("\n"),
    )
}

/// Parse a numbered list of task names from the prioritization reply.
pub fn parse_ranked_names(text: &str) -> Vec<String> {
    let pattern = Regex::new(r"^\s*\d+[.)]\s*(.+?)\s*$").expect("static regex");
    text.lines()
        .filter_map(|line| {
            pattern
                .captures(line)
                .map(|caps| caps[1].trim().to_string())
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Order `tasks` by the ranked names, appending any unranked tasks at
/// the end in their original order, then keep the top
/// [`TOP_TASK_COUNT`].
pub fn rank_tasks(tasks: Vec<PlanTask>, ranked_names: &[String]) -> Vec<PlanTask> {
    let mut remaining = tasks;
    let mut ordered = Vec::with_capacity(remaining.len());

    for name in ranked_names {
        let wanted = name.to_lowercase();
        if let Some(position) = remaining.iter().position(|t| {
            let have = t.name.to_lowercase();
            have == wanted || have.contains(&wanted) || wanted.contains(&have)
        }) {
            ordered.push(remaining.remove(position));
        }
    }

    ordered.extend(remaining);
    ordered.truncate(TOP_TASK_COUNT);
    ordered
}

/// Keyword classification of a task name.
pub fn classify_task(name: &str) -> TaskClass {
    let name = name.to_lowercase();
    if ["optimize", "improve", "reduce", "decrease"]
        .iter()
        .any(|k| name.contains(k))
    {
        TaskClass::Optimization
    } else if ["create", "add"].iter().any(|k| name.contains(k)) {
        TaskClass::Creation
    } else if ["analyze", "diagnose"].iter().any(|k| name.contains(k)) {
        TaskClass::Analysis
    } else {
        TaskClass::Other
    }
}

/// Derive a tool-name slug from a task name: lowercase, alphanumerics
/// kept, everything else collapsed to single underscores.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_underscore = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_underscore = false;
        } else if !last_was_underscore {
            slug.push('_');
            last_was_underscore = true;
        }
    }
    let slug = slug.trim_end_matches('_').to_string();
    slug.chars().take(48).collect()
}
